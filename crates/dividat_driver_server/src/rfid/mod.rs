// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Boundary contract of the RFID reader integration: a single-topic session
//! that fans out token identifications to every connected client. The PC/SC
//! plumbing that feeds it lives outside this crate.

use dividat_driver_core::broker::Broker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const TOPIC_RFID: &str = "rfid";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RfidMessage {
  Identified { token: String },
}

pub struct RfidSession {
  broker: Arc<Broker<RfidMessage>>,
}

impl RfidSession {
  pub fn new(session_token: CancellationToken) -> Arc<Self> {
    let session = Arc::new(Self {
      broker: Arc::new(Broker::default()),
    });
    let watcher = session.clone();
    tokio::spawn(async move {
      session_token.cancelled().await;
      watcher.broker.shutdown();
    });
    session
  }

  pub fn broker(&self) -> &Arc<Broker<RfidMessage>> {
    &self.broker
  }

  /// Fans a scanned token out to every client.
  pub fn identified(&self, token: &str) {
    self.broker.try_publish(
      RfidMessage::Identified {
        token: token.to_owned(),
      },
      TOPIC_RFID,
    );
  }

  /// Names of attached card readers. Reader attachment is handled by the
  /// external PC/SC collaborator; without it the list is empty.
  pub fn readers(&self) -> Vec<String> {
    Vec::new()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[tokio::test]
  async fn test_identified_fans_out() {
    let token = CancellationToken::new();
    let session = RfidSession::new(token.clone());
    let mut a = session.broker().subscribe(TOPIC_RFID).expect("Broker is live");
    let mut b = session.broker().subscribe(TOPIC_RFID).expect("Broker is live");
    session.identified("0123456789");
    let expected = RfidMessage::Identified {
      token: "0123456789".to_owned(),
    };
    assert_eq!(a.recv().await, Some(expected.clone()));
    assert_eq!(b.recv().await, Some(expected));
    token.cancel();
  }

  #[test]
  fn test_identified_wire_format() {
    let message = RfidMessage::Identified {
      token: "abc".to_owned(),
    };
    assert_eq!(
      serde_json::to_string(&message).expect("Infallible serialization"),
      "{\"type\":\"Identified\",\"token\":\"abc\"}"
    );
  }
}
