// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Transparent framer: read chunks go out as received, outbound commands go
//! to the port verbatim, nothing is written on startup. Used for raw capture
//! and for end-to-end replays impersonating other families.

use async_trait::async_trait;
use dividat_driver_core::{
  broker::{Broker, TOPIC_RX, TOPIC_TX},
  message::Payload,
};
use tokio_util::sync::CancellationToken;

use super::{Framer, serial::SerialTransport};
use crate::errors::DeviceError;

#[derive(Default)]
pub struct PassthruFramer {}

#[async_trait]
impl Framer for PassthruFramer {
  async fn run(
    &mut self,
    transport: &mut SerialTransport,
    broker: &Broker<Payload>,
    token: &CancellationToken,
  ) -> Result<(), DeviceError> {
    let Ok(mut tx) = broker.subscribe(TOPIC_TX) else {
      return Ok(());
    };
    let mut reader = transport.spawn_reader()?;

    let result = loop {
      tokio::select! {
        _ = token.cancelled() => break Ok(()),
        chunk = reader.recv() => match chunk {
          Some(bytes) => broker.try_publish(Payload::Frame(bytes), TOPIC_RX),
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
