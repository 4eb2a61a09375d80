// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Framer for Sensitronics mats. Records are TLV:
//!
//! ```text
//! 0xFF  type(u8)  length(u16 little-endian)  body(length bytes)
//! ```
//!
//! The full framed record, header included, is emitted. Unlike the
//! SensingTex protocol there is no resync marker; a record that does not
//! start with 0xFF terminates the connection and the session retries.

use async_trait::async_trait;
use dividat_driver_core::{
  broker::{Broker, TOPIC_RX, TOPIC_TX},
  message::Payload,
};
use tokio_util::sync::CancellationToken;

use super::{Framer, serial::SerialTransport};
use crate::errors::DeviceError;

/// Starts measurement.
pub const START_COMMAND: &[u8] = b"S\n";

const RECORD_START: u8 = 0xFF;
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Start,
  Type,
  LenLo,
  LenHi,
  Body,
}

/// Signals a record that does not begin with 0xFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desync;

pub struct TlvParser {
  state: State,
  record: Vec<u8>,
  length: usize,
}

impl Default for TlvParser {
  fn default() -> Self {
    Self {
      state: State::Start,
      record: Vec::new(),
      length: 0,
    }
  }
}

impl TlvParser {
  /// Consumes one byte; returns a complete record, or [`Desync`] when a
  /// record starts with anything but 0xFF.
  pub fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>, Desync> {
    match self.state {
      State::Start => {
        if byte != RECORD_START {
          return Err(Desync);
        }
        self.record.clear();
        self.record.push(byte);
        self.state = State::Type;
        Ok(None)
      }
      State::Type => {
        self.record.push(byte);
        self.state = State::LenLo;
        Ok(None)
      }
      State::LenLo => {
        self.length = byte as usize;
        self.record.push(byte);
        self.state = State::LenHi;
        Ok(None)
      }
      State::LenHi => {
        self.length |= (byte as usize) << 8;
        self.record.push(byte);
        if self.length == 0 {
          self.state = State::Start;
          Ok(Some(std::mem::take(&mut self.record)))
        } else {
          self.state = State::Body;
          Ok(None)
        }
      }
      State::Body => {
        self.record.push(byte);
        if self.record.len() == HEADER_LEN + self.length {
          self.state = State::Start;
          Ok(Some(std::mem::take(&mut self.record)))
        } else {
          Ok(None)
        }
      }
    }
  }
}

#[derive(Default)]
pub struct SensitronicsFramer {}

#[async_trait]
impl Framer for SensitronicsFramer {
  async fn run(
    &mut self,
    transport: &mut SerialTransport,
    broker: &Broker<Payload>,
    token: &CancellationToken,
  ) -> Result<(), DeviceError> {
    let Ok(mut tx) = broker.subscribe(TOPIC_TX) else {
      return Ok(());
    };
    transport.write(START_COMMAND.to_vec()).await?;
    let mut parser = TlvParser::default();
    let mut reader = transport.spawn_reader()?;

    let result = loop {
      tokio::select! {
        _ = token.cancelled() => break Ok(()),
        chunk = reader.recv() => match chunk {
          Some(bytes) => {
            let mut failed = false;
            for byte in bytes {
              match parser.push(byte) {
                Ok(Some(record)) => broker.try_publish(Payload::Frame(record), TOPIC_RX),
                Ok(None) => {}
                Err(Desync) => {
                  failed = true;
                  break;
                }
              }
            }
            if failed {
              break Err(DeviceError::ProtocolDesync(transport.path().to_owned()));
            }
          }
          None => break Err(DeviceError::DeviceGone(transport.path().to_owned())),
        },
        command = tx.recv() => match command {
          Some(Payload::Frame(command)) => transport.write(command).await?,
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
