// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Framer for SensingTex pressure mats.
//!
//! Wire format:
//!
//! ```text
//! Header: 'N' '\n' length_msb length_lsb    // big-endian uint16 sample count
//! Body:   'P' '\n' sample_1 ... sample_length
//! ```
//!
//! A sample is 3 bytes in 8-bit mode (row, col, pressure) and 4 bytes in
//! 12-bit mode (row, col, pressure as big-endian uint16). Only the
//! concatenated sample bytes are emitted; header and body markers are
//! stripped. Garbage on the wire never reaches clients; the parser consumes
//! bytes until the next 'N' marker.

use async_trait::async_trait;
use dividat_driver_core::{
  broker::{Broker, TOPIC_RX, TOPIC_TX},
  message::Payload,
};
use tokio_util::sync::CancellationToken;

use super::{Framer, serial::SerialTransport};
use crate::errors::DeviceError;

/// Selects 8-bit mode on the device.
pub const MODE_8BIT_COMMAND: &[u8] = b"UL\n";
/// Selects 12-bit mode on the device.
pub const MODE_12BIT_COMMAND: &[u8] = b"UM\n";
/// Starts measurement, and polls for the next frame afterwards. Mandatory
/// per frame for the 12-bit device generation, harmless for the 8-bit one.
pub const POLL_COMMAND: &[u8] = b"S\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
  Eight,
  Twelve,
}

impl BitDepth {
  pub fn bytes_per_sample(self) -> usize {
    match self {
      BitDepth::Eight => 3,
      BitDepth::Twelve => 4,
    }
  }

  /// A command is a bitdepth command iff it is exactly `UL\n` or `UM\n`.
  pub fn from_command(command: &[u8]) -> Option<Self> {
    match command {
      MODE_8BIT_COMMAND => Some(BitDepth::Eight),
      MODE_12BIT_COMMAND => Some(BitDepth::Twelve),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  WaitHeader,
  HeaderN,
  LenMsb,
  LenLsb,
  WaitBody,
  BodyP,
  BodyBytes,
  /// Recoverable desync; consumes bytes until the next 'N' marker.
  Unexpected,
}

pub struct SensingTexParser {
  state: State,
  bit_depth: BitDepth,
  sample_count: usize,
  body: Vec<u8>,
}

impl SensingTexParser {
  pub fn new(bit_depth: BitDepth) -> Self {
    Self {
      state: State::WaitHeader,
      bit_depth,
      sample_count: 0,
      body: Vec::new(),
    }
  }

  pub fn bit_depth(&self) -> BitDepth {
    self.bit_depth
  }

  /// Switches sample width and resets to the initial state. Called after the
  /// reader restart, when the OS buffer holds no stale bytes.
  pub fn set_bit_depth(&mut self, bit_depth: BitDepth) {
    self.bit_depth = bit_depth;
    self.state = State::WaitHeader;
    self.sample_count = 0;
    self.body.clear();
  }

  /// Consumes one byte; returns a complete frame body when one is finished.
  pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
    match self.state {
      State::WaitHeader => {
        self.state = if byte == b'N' { State::HeaderN } else { State::Unexpected };
        None
      }
      State::HeaderN => {
        self.state = if byte == b'\n' { State::LenMsb } else { State::Unexpected };
        None
      }
      State::LenMsb => {
        self.sample_count = (byte as usize) << 8;
        self.state = State::LenLsb;
        None
      }
      State::LenLsb => {
        self.sample_count |= byte as usize;
        self.state = State::WaitBody;
        None
      }
      State::WaitBody => {
        self.state = if byte == b'P' { State::BodyP } else { State::Unexpected };
        None
      }
      State::BodyP => {
        if byte != b'\n' {
          self.state = State::Unexpected;
          return None;
        }
        self.body.clear();
        if self.sample_count == 0 {
          // Nothing to collect; wait for the next header.
          self.state = State::WaitHeader;
        } else {
          self.state = State::BodyBytes;
        }
        None
      }
      State::BodyBytes => {
        self.body.push(byte);
        if self.body.len() == self.sample_count * self.bit_depth.bytes_per_sample() {
          self.state = State::WaitHeader;
          Some(std::mem::take(&mut self.body))
        } else {
          None
        }
      }
      State::Unexpected => {
        if byte == b'N' {
          self.state = State::HeaderN;
        }
        None
      }
    }
  }
}

#[derive(Default)]
pub struct SensingTexFramer {}

#[async_trait]
impl Framer for SensingTexFramer {
  async fn run(
    &mut self,
    transport: &mut SerialTransport,
    broker: &Broker<Payload>,
    token: &CancellationToken,
  ) -> Result<(), DeviceError> {
    let Ok(mut tx) = broker.subscribe(TOPIC_TX) else {
      return Ok(());
    };
    // Default mode is 8-bit; start measurement right away.
    transport.write(MODE_8BIT_COMMAND.to_vec()).await?;
    transport.write(POLL_COMMAND.to_vec()).await?;
    let mut parser = SensingTexParser::new(BitDepth::Eight);
    let mut reader = transport.spawn_reader()?;

    let result = loop {
      tokio::select! {
        _ = token.cancelled() => break Ok(()),
        chunk = reader.recv() => match chunk {
          Some(bytes) => {
            for byte in bytes {
              if let Some(frame) = parser.push(byte) {
                broker.try_publish(Payload::Frame(frame), TOPIC_RX);
                transport.write(POLL_COMMAND.to_vec()).await?;
              }
            }
          }
          None => break Err(DeviceError::DeviceGone(transport.path().to_owned())),
        },
        command = tx.recv() => match command {
          Some(Payload::Frame(command)) => {
            match BitDepth::from_command(&command) {
              Some(depth) if depth != parser.bit_depth() => {
                // Reader restart protocol: the old reader may be blocked in a
                // pending read, so cancel it and wait for it to finish before
                // the mode bytes go out, then drop whatever arrived in the
                // old mode.
                reader.shutdown().await;
                transport.write(command).await?;
                transport.clear_input()?;
                parser.set_bit_depth(depth);
                reader = transport.spawn_reader()?;
              }
              _ => transport.write(command).await?,
            }
          }
          Some(Payload::Message(_)) => {}
          None => break Ok(()),
        },
      }
    };
    broker.unsubscribe(tx);
    reader.shutdown().await;
    result
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn frame_bytes(samples: &[u8], bytes_per_sample: usize) -> Vec<u8> {
    let count = samples.len() / bytes_per_sample;
    let mut bytes = vec![b'N', b'\n', (count >> 8) as u8, count as u8, b'P', b'\n'];
    bytes.extend_from_slice(samples);
    bytes
  }

  fn push_all(parser: &mut SensingTexParser, bytes: &[u8]) -> Vec<Vec<u8>> {
    bytes.iter().filter_map(|byte| parser.push(*byte)).collect()
  }

  #[test]
  fn test_8bit_frames() {
    let mut parser = SensingTexParser::new(BitDepth::Eight);
    for i in 0u8..24 {
      let samples = [i, 1, 2 * i + 1, 1, i, 3 * i + 1];
      let frames = push_all(&mut parser, &frame_bytes(&samples, 3));
      assert_eq!(frames, vec![samples.to_vec()]);
    }
  }

  #[test]
  fn test_12bit_frames() {
    let mut parser = SensingTexParser::new(BitDepth::Twelve);
    let samples = [0, 1, 0x02, 0x58, 1, 0, 0x0F, 0xA0];
    let frames = push_all(&mut parser, &frame_bytes(&samples, 4));
    assert_eq!(frames, vec![samples.to_vec()]);
  }

  #[test]
  fn test_noise_only_emits_nothing() {
    let mut parser = SensingTexParser::new(BitDepth::Eight);
    let frames = push_all(&mut parser, &[0xDE, 0xAD, 0xBE, 0xEF, b'P', b'\n', 0x00]);
    assert!(frames.is_empty());
    // Parser does not accumulate anything while desynced.
    assert!(parser.body.is_empty());
  }

  #[test]
  fn test_resync_on_next_marker() {
    let mut parser = SensingTexParser::new(BitDepth::Eight);
    let samples = [1, 2, 3];
    let mut bytes = vec![0x42, 0x42, 0x42];
    bytes.extend_from_slice(&frame_bytes(&samples, 3));
    let frames = push_all(&mut parser, &bytes);
    assert_eq!(frames, vec![samples.to_vec()]);
  }

  #[test]
  fn test_truncated_header_recovers() {
    let mut parser = SensingTexParser::new(BitDepth::Eight);
    // 'N' followed by garbage instead of '\n', then a clean frame.
    let samples = [7, 8, 9];
    let mut bytes = vec![b'N', b'X'];
    bytes.extend_from_slice(&frame_bytes(&samples, 3));
    assert_eq!(push_all(&mut parser, &bytes), vec![samples.to_vec()]);
  }

  #[test]
  fn test_zero_length_frame_emits_nothing() {
    let mut parser = SensingTexParser::new(BitDepth::Eight);
    let frames = push_all(&mut parser, &[b'N', b'\n', 0, 0, b'P', b'\n']);
    assert!(frames.is_empty());
    // And the parser is back in sync for the next frame.
    let samples = [1, 1, 1];
    assert_eq!(
      push_all(&mut parser, &frame_bytes(&samples, 3)),
      vec![samples.to_vec()]
    );
  }

  #[test]
  fn test_mode_switch_resets_state() {
    let mut parser = SensingTexParser::new(BitDepth::Eight);
    // Halfway into a frame body.
    for byte in [b'N', b'\n', 0, 1, b'P', b'\n', 42] {
      assert_eq!(parser.push(byte), None);
    }
    parser.set_bit_depth(BitDepth::Twelve);
    let samples = [0, 1, 0x12, 0x34];
    assert_eq!(
      push_all(&mut parser, &frame_bytes(&samples, 4)),
      vec![samples.to_vec()]
    );
  }

  #[test]
  fn test_bitdepth_command_classification() {
    assert_eq!(BitDepth::from_command(b"UL\n"), Some(BitDepth::Eight));
    assert_eq!(BitDepth::from_command(b"UM\n"), Some(BitDepth::Twelve));
    assert_eq!(BitDepth::from_command(b"UL"), None);
    assert_eq!(BitDepth::from_command(b"S\n"), None);
    assert_eq!(BitDepth::from_command(b"UL\nS\n"), None);
  }

  #[test]
  fn test_split_across_chunks() {
    let mut parser = SensingTexParser::new(BitDepth::Eight);
    let samples = [5, 6, 7, 8, 9, 10];
    let bytes = frame_bytes(&samples, 3);
    let (first, second) = bytes.split_at(5);
    assert!(push_all(&mut parser, first).is_empty());
    assert_eq!(push_all(&mut parser, second), vec![samples.to_vec()]);
  }
}
