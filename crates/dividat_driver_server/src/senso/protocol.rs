// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Binary blocks exchanged on the Senso control channel. Only the status
//! probe and the standard response block are interpreted by the driver;
//! everything else passes through opaque.

use byteorder::{ByteOrder, LittleEndian};

/// Control responses set the high bit of the block type.
const RESPONSE_FLAG: u16 = 0x8000;
/// GetStatus block type.
const BLOCK_TYPE_GET_STATUS: u16 = 0x00D0;
/// High bit of the status word flags a device fault.
const STATUS_FAULT_FLAG: u32 = 0x8000_0000;

pub const HEADER_LEN: usize = 8;
/// Full block size: length and block type words plus the returnCode, status
/// and error words.
const STD_RESPONSE_LEN: usize = 16;

/// The liveness probe: an all-zero 8-byte header followed by a
/// `(size=1, blockType=GetStatus)` block.
pub fn get_status_block() -> [u8; 12] {
  let mut block = [0u8; 12];
  LittleEndian::write_u16(&mut block[8..10], 1);
  LittleEndian::write_u16(&mut block[10..12], BLOCK_TYPE_GET_STATUS);
  block
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
  pub version: u8,
  pub num_blocks: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdResponse {
  pub block_type: u16,
  pub return_code: u32,
  pub status: u32,
  pub error: u32,
}

impl StdResponse {
  /// True when the controller reports trouble. Faults are logged but do not
  /// change session state.
  pub fn indicates_fault(&self) -> bool {
    self.error != 0 || self.status & STATUS_FAULT_FLAG != 0
  }
}

/// Parses a control-channel response. Returns `None` for byte sequences that
/// are not a response block; the channel treats those as opaque traffic.
pub fn parse_response(bytes: &[u8]) -> Option<(ResponseHeader, StdResponse)> {
  if bytes.len() < HEADER_LEN + STD_RESPONSE_LEN {
    return None;
  }
  let header = ResponseHeader {
    version: bytes[0],
    num_blocks: bytes[1],
  };
  let block = &bytes[HEADER_LEN..];
  let raw_type = LittleEndian::read_u16(&block[2..4]);
  if raw_type & RESPONSE_FLAG == 0 {
    return None;
  }
  let response = StdResponse {
    block_type: raw_type & !RESPONSE_FLAG,
    return_code: LittleEndian::read_u32(&block[4..8]),
    status: LittleEndian::read_u32(&block[8..12]),
    error: LittleEndian::read_u32(&block[12..16]),
  };
  Some((header, response))
}
