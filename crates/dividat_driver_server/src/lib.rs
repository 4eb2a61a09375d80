// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Device session layer of the Dividat driver: one session per device
//! endpoint, each owning a broker, the current connection and its protocol
//! handler. Sessions are what the WebSocket gateway talks to.

#[macro_use]
extern crate tracing;

pub mod enumerator;
pub mod errors;
pub mod flex;
pub mod rfid;
pub mod senso;
pub mod session;

pub use errors::DeviceError;
pub use session::DeviceSession;
