// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Per-family serial protocol handlers. A framer owns the open port for the
//! lifetime of one connection: it reads bytes, emits complete frames to the
//! session's `rx` topic and forwards opaque commands from the `tx` topic to
//! the port.

pub mod passthru;
pub mod sensing_tex;
pub mod sensitronics;
mod serial;

use async_trait::async_trait;
use dividat_driver_core::{broker::Broker, message::Payload};
use tokio_util::sync::CancellationToken;

pub use serial::{SerialReader, SerialTransport};

use crate::{enumerator::DeviceFamily, errors::DeviceError};

#[async_trait]
pub trait Framer: Send {
  /// Runs the framing loop until cancellation (`Ok`) or a connection-fatal
  /// condition (`Err`). Frame-level garbage is never fatal; it is recovered
  /// internally where the protocol allows it.
  async fn run(
    &mut self,
    transport: &mut SerialTransport,
    broker: &Broker<Payload>,
    token: &CancellationToken,
  ) -> Result<(), DeviceError>;
}

pub fn framer_for(family: DeviceFamily) -> Box<dyn Framer> {
  match family {
    DeviceFamily::Passthru => Box::new(passthru::PassthruFramer::default()),
    DeviceFamily::SensingTex => Box::new(sensing_tex::SensingTexFramer::default()),
    DeviceFamily::Sensitronics => Box::new(sensitronics::SensitronicsFramer::default()),
  }
}
