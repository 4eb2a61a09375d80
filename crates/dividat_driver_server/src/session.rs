// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The uniform seam between the WebSocket gateway and the per-device
//! sessions. The gateway is written once against this trait; Flex and Senso
//! implement it over the same broker topics.

use async_trait::async_trait;
use dividat_driver_core::{
  broker::Broker,
  message::{Message, Payload, Status},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

use crate::errors::DeviceError;

#[async_trait]
pub trait DeviceSession: Send + Sync {
  /// The session's broker. Gateway connections subscribe to the `rx` and
  /// `rx-broadcast` topics and publish client binaries to `tx`.
  fn broker(&self) -> &Arc<Broker<Payload>>;

  async fn status(&self) -> Status;

  /// Connects to the device at `address`. A no-op when already connected to
  /// the same device.
  async fn connect(&self, address: &str) -> Result<(), DeviceError>;

  /// Cancels the current connection. Idempotent.
  async fn disconnect(&self);

  /// Produces `Message::Discovered` entries for at most `duration`, then
  /// closes the channel. `duration` of zero closes without emitting.
  fn discover(&self, duration: Duration) -> mpsc::Receiver<Message>;

  /// Runs a firmware update, reporting progress and outcome on the broadcast
  /// topic. Sessions without flashable hardware report failure the same way.
  async fn update_firmware(&self, serial_number: &str, image_base64: &str);

  /// True while a firmware update is in flight; the gateway then drops
  /// client binaries and ignores all commands except GetStatus and Discover.
  fn updating(&self) -> bool;

  /// Registers a gateway connection. `manual` reflects the
  /// `manual-connect` subprotocol; policy is last-subscriber-wins.
  fn register_subscriber(&self, manual: bool);

  /// Deregisters a gateway connection. When the count reaches zero the
  /// session disconnects and stops any auto-connect scheduling.
  fn deregister_subscriber(&self);
}
