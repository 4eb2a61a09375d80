// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! One persistent TCP channel of a Senso connection. The data and control
//! channels share this loop; they differ in which transmit topic they
//! subscribe to and in whether they probe for liveness.
//!
//! The data channel subscribes to a topic nothing publishes to. Outbound
//! traffic can only leave through the control channel; this asymmetry is
//! contract, not accident.

use dividat_driver_core::{
  broker::{Broker, TOPIC_RX, TOPIC_TX},
  message::Payload,
};
use std::{sync::Arc, time::Duration};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::TcpStream,
  sync::watch,
  time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::protocol;

/// Transmit topic of the data channel; never published to.
pub const TOPIC_TX_DATA: &str = "tx-data";

/// Idle time on the control channel before a status probe goes out.
const PROBE_IDLE: Duration = Duration::from_secs(5);
/// How long a probe may stay unanswered before the connection is considered
/// dead.
const PROBE_DEADLINE: Duration = Duration::from_secs(2);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
  Data,
  Control,
}

impl ChannelRole {
  fn is_control(self) -> bool {
    matches!(self, ChannelRole::Control)
  }

  fn tx_topic(self) -> &'static str {
    match self {
      ChannelRole::Control => TOPIC_TX,
      ChannelRole::Data => TOPIC_TX_DATA,
    }
  }
}

enum Exit {
  Cancelled,
  Retry,
}

/// Dials `host:port` forever with exponential backoff, until cancelled.
///
/// `restart` is a latching teardown signal shared by both channels of a
/// connection: bumping the generation makes every channel drop its TCP
/// stream and re-dial, even if it was busy outside its select at that
/// moment.
pub async fn run_channel(
  host: String,
  port: u16,
  role: ChannelRole,
  broker: Arc<Broker<Payload>>,
  restart: Arc<watch::Sender<u64>>,
  token: CancellationToken,
) {
  let Ok(mut tx) = broker.subscribe(role.tx_topic()) else {
    return;
  };
  let mut restart_rx = restart.subscribe();
  let mut backoff = INITIAL_BACKOFF;
  loop {
    match TcpStream::connect((host.as_str(), port)).await {
      Ok(stream) => {
        info!("Senso {:?} channel connected to {}:{}", role, host, port);
        backoff = INITIAL_BACKOFF;
        match run_connected(stream, role, &broker, &mut tx, &restart, &mut restart_rx, &token).await
        {
          Exit::Cancelled => break,
          Exit::Retry => {}
        }
      }
      Err(err) => {
        debug!("Cannot reach {}:{}: {}", host, port, err);
      }
    }
    tokio::select! {
      _ = token.cancelled() => break,
      _ = tokio::time::sleep(backoff) => {}
    }
    backoff = (backoff * 2).min(MAX_BACKOFF);
  }
  broker.unsubscribe(tx);
}

async fn run_connected(
  stream: TcpStream,
  role: ChannelRole,
  broker: &Broker<Payload>,
  tx: &mut dividat_driver_core::broker::Subscription<Payload>,
  restart: &watch::Sender<u64>,
  restart_rx: &mut watch::Receiver<u64>,
  token: &CancellationToken,
) -> Exit {
  let (mut reader, mut writer) = stream.into_split();
  let mut buf = vec![0u8; 4096];
  let mut last_activity = Instant::now();
  let mut probe_sent: Option<Instant> = None;
  // A teardown requested while this channel was between connections is
  // already satisfied by the fresh stream.
  let _ = restart_rx.borrow_and_update();

  loop {
    let wake = match probe_sent {
      Some(sent) => sent + PROBE_DEADLINE,
      None => last_activity + PROBE_IDLE,
    };
    tokio::select! {
      _ = token.cancelled() => return Exit::Cancelled,
      _ = restart_rx.changed() => {
        info!("Senso {:?} channel restarting on request", role);
        return Exit::Retry;
      }
      result = reader.read(&mut buf) => match result {
        Ok(0) => {
          info!("Senso {:?} channel closed by peer", role);
          return Exit::Retry;
        }
        Ok(len) => {
          last_activity = Instant::now();
          if probe_sent.take().is_some() {
            trace!("Status probe answered");
          }
          if role.is_control() {
            if let Some((_, response)) = protocol::parse_response(&buf[..len]) {
              if response.indicates_fault() {
                warn!(
                  "Senso control fault: block {:#06X} returnCode {} status {:#010X} error {}",
                  response.block_type, response.return_code, response.status, response.error
                );
              }
            }
          }
          broker.try_publish(Payload::Frame(buf[..len].to_vec()), TOPIC_RX);
        }
        Err(err) => {
          warn!("Senso {:?} channel read failed: {}", role, err);
          return Exit::Retry;
        }
      },
      command = tx.recv() => match command {
        Some(Payload::Frame(bytes)) => {
          if let Err(err) = writer.write_all(&bytes).await {
            warn!("Senso {:?} channel write failed: {}", role, err);
            return Exit::Retry;
          }
        }
        Some(Payload::Message(_)) => {}
        None => return Exit::Cancelled,
      },
      _ = tokio::time::sleep_until(wake), if role.is_control() => {
        if probe_sent.is_some() {
          warn!("Status probe unanswered, tearing down Senso connection");
          restart.send_modify(|generation| *generation = generation.wrapping_add(1));
          return Exit::Retry;
        }
        trace!("Control channel idle, probing for liveness");
        if let Err(err) = writer.write_all(&protocol::get_status_block()).await {
          warn!("Cannot write status probe: {}", err);
          return Exit::Retry;
        }
        probe_sent = Some(Instant::now());
      }
    }
  }
}
