// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Error types shared across the driver crates.

use thiserror::Error;

pub type DriverResult<T = ()> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
  /// The broker has been shut down; publishes and subscriptions are rejected.
  #[error("Broker is shut down")]
  BrokerShutdown,
  /// A registered device record carried a field that is not 16-bit hex.
  #[error("Field {0} is not a 4-digit hexadecimal value: {1}")]
  InvalidHexField(&'static str, String),
  /// A recording line did not match `<sleep_ms>,<base64_payload>`.
  #[error("Malformed recording line {0}: {1}")]
  MalformedRecordingLine(usize, String),
}
