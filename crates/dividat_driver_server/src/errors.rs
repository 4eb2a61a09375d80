// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
  #[error("Cannot open serial port {0}: {1}")]
  PortOpen(String, String),
  #[error("Serial port error on {0}: {1}")]
  Serial(String, String),
  #[error("No device matches address {0}")]
  DeviceNotFound(String),
  #[error("A firmware update is in progress")]
  UpdateInProgress,
  #[error("Firmware update failed: {0}")]
  FirmwareUpdate(String),
  /// The serial reader thread exited while the connection was live.
  #[error("Device at {0} stopped responding")]
  DeviceGone(String),
  /// A framer read a byte the protocol cannot start a record with.
  #[error("Protocol desync on {0}, terminating connection")]
  ProtocolDesync(String),
}
