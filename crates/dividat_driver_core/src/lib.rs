// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Core library for the Dividat hardware bridge driver: the in-process
//! pub/sub broker every device session is built on, the JSON command/status
//! protocol spoken over the WebSocket gateway, and the recording line codec
//! shared by the recorder and the replay tooling.

#[macro_use]
extern crate tracing;

pub mod broker;
pub mod errors;
pub mod message;
pub mod recording;

pub use errors::DriverError;
