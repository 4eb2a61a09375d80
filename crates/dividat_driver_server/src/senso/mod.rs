// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The Senso session drives two TCP channels to the same device (data and
//! control), multiplexes both receive sides into one topic, and arbitrates
//! firmware updates.

pub mod channel;
pub mod discovery;
pub mod firmware;
pub mod protocol;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use dividat_driver_core::{
  broker::{Broker, TOPIC_BROADCAST},
  message::{DeviceInfo, Message, Payload, ServiceEntry, Status},
};
use std::{
  collections::HashMap,
  net::{Ipv4Addr, Ipv6Addr},
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
  errors::DeviceError,
  senso::channel::{ChannelRole, run_channel},
  session::DeviceSession,
};

pub const DATA_PORT: u16 = 55568;
pub const CONTROL_PORT: u16 = 55567;

struct SensoConnection {
  address: Option<String>,
  entry: Option<ServiceEntry>,
  token: Option<CancellationToken>,
}

pub struct SensoSession {
  broker: Arc<Broker<Payload>>,
  connection: Arc<Mutex<SensoConnection>>,
  /// Entries seen by discovery, keyed by dial address. Used to enrich the
  /// status report when a client connects by plain address.
  known: Arc<Mutex<HashMap<String, ServiceEntry>>>,
  updating: Arc<AtomicBool>,
  update_lock: Mutex<()>,
  subscriber_count: AtomicUsize,
  session_token: CancellationToken,
  data_port: u16,
  control_port: u16,
}

impl SensoSession {
  pub fn new(session_token: CancellationToken) -> Arc<Self> {
    Self::with_ports(session_token, DATA_PORT, CONTROL_PORT)
  }

  /// Like [`SensoSession::new`] with overridden ports; tests dial fakes on
  /// loopback.
  pub fn with_ports(
    session_token: CancellationToken,
    data_port: u16,
    control_port: u16,
  ) -> Arc<Self> {
    let session = Arc::new(Self {
      broker: Arc::new(Broker::default()),
      connection: Arc::new(Mutex::new(SensoConnection {
        address: None,
        entry: None,
        token: None,
      })),
      known: Arc::new(Mutex::new(HashMap::new())),
      updating: Arc::new(AtomicBool::new(false)),
      update_lock: Mutex::new(()),
      subscriber_count: AtomicUsize::new(0),
      session_token,
      data_port,
      control_port,
    });
    let watcher = session.clone();
    tokio::spawn(async move {
      watcher.session_token.cancelled().await;
      watcher.broker.shutdown();
    });
    session
  }

  fn broadcast(&self, message: Message) {
    self
      .broker
      .try_publish(Payload::Message(message), TOPIC_BROADCAST);
  }

  /// Entry to report for `address` when discovery has not seen the device.
  fn synthesized_entry(address: &str) -> ServiceEntry {
    let ip4 = address
      .parse::<Ipv4Addr>()
      .map(|ip| vec![ip.to_string()])
      .unwrap_or_default();
    let ip6 = address
      .parse::<Ipv6Addr>()
      .map(|ip| vec![ip.to_string()])
      .unwrap_or_default();
    ServiceEntry::new(address, vec![], ip4, ip6)
  }

  fn status_of(connection: &SensoConnection) -> Status {
    match &connection.address {
      Some(address) => {
        let entry = connection
          .entry
          .clone()
          .unwrap_or_else(|| Self::synthesized_entry(address));
        Status::new(
          Some(address.clone()),
          Some(DeviceInfo::Senso { tcp_device: entry }),
        )
      }
      None => Status::disconnected(),
    }
  }
}

#[async_trait]
impl DeviceSession for SensoSession {
  fn broker(&self) -> &Arc<Broker<Payload>> {
    &self.broker
  }

  async fn status(&self) -> Status {
    Self::status_of(&*self.connection.lock().await)
  }

  async fn connect(&self, address: &str) -> Result<(), DeviceError> {
    if self.updating() {
      return Err(DeviceError::UpdateInProgress);
    }
    let mut connection = self.connection.lock().await;
    if connection.address.as_deref() == Some(address) {
      return Ok(());
    }
    if let Some(token) = connection.token.take() {
      token.cancel();
    }
    if connection.address.take().is_some() {
      connection.entry = None;
      self.broadcast(Message::Status(Status::disconnected()));
    }

    connection.address = Some(address.to_owned());
    connection.entry = self.known.lock().await.get(address).cloned();
    let token = self.session_token.child_token();
    connection.token = Some(token.clone());

    let (restart, _) = watch::channel(0u64);
    let restart = Arc::new(restart);
    for (port, role) in [
      (self.data_port, ChannelRole::Data),
      (self.control_port, ChannelRole::Control),
    ] {
      tokio::spawn(run_channel(
        address.to_owned(),
        port,
        role,
        self.broker.clone(),
        restart.clone(),
        token.clone(),
      ));
    }
    info!("Senso session connected to {}", address);
    self.broadcast(Message::Status(Self::status_of(&connection)));
    Ok(())
  }

  async fn disconnect(&self) {
    let mut connection = self.connection.lock().await;
    if let Some(token) = connection.token.take() {
      token.cancel();
    }
    if connection.address.take().is_some() {
      connection.entry = None;
      self.broadcast(Message::Status(Status::disconnected()));
    }
  }

  fn discover(&self, duration: Duration) -> mpsc::Receiver<Message> {
    let (sender, receiver) = mpsc::channel(32);
    if duration.is_zero() {
      return receiver;
    }
    let known = self.known.clone();
    tokio::spawn(async move {
      let mut entries = discovery::browse(duration);
      while let Some(entry) = entries.recv().await {
        known
          .lock()
          .await
          .insert(entry.address().to_owned(), entry.clone());
        let message = Message::Discovered {
          service: Some(entry.hostname().clone()),
          ip: entry.ip4().first().cloned(),
          device: DeviceInfo::Senso { tcp_device: entry },
        };
        if sender.send(message).await.is_err() {
          return;
        }
      }
    });
    receiver
  }

  async fn update_firmware(&self, serial_number: &str, image_base64: &str) {
    // Serializes updates; the flag is what the gateway consults to suppress
    // client traffic in the meantime.
    let _guard = self.update_lock.lock().await;
    self.updating.store(true, Ordering::SeqCst);

    self.broadcast(Message::FirmwareUpdateProgress {
      message: "Disconnecting from the Senso".to_owned(),
    });
    let address = self.connection.lock().await.address.clone();
    self.disconnect().await;

    let image = match STANDARD.decode(image_base64) {
      Ok(image) => image,
      Err(err) => {
        self.broadcast(Message::FirmwareUpdateFailure {
          message: format!("Cannot decode firmware image: {}", err),
        });
        self.updating.store(false, Ordering::SeqCst);
        return;
      }
    };

    let broker = self.broker.clone();
    let progress = move |message: String| {
      broker.try_publish(
        Payload::Message(Message::FirmwareUpdateProgress { message }),
        TOPIC_BROADCAST,
      );
    };
    match firmware::update(&image, Some(serial_number), address.as_deref(), &progress).await {
      Ok(()) => self.broadcast(Message::FirmwareUpdateSuccess {
        message: "Firmware update finished".to_owned(),
      }),
      Err(err) => self.broadcast(Message::FirmwareUpdateFailure {
        message: err.to_string(),
      }),
    }
    self.updating.store(false, Ordering::SeqCst);
  }

  fn updating(&self) -> bool {
    self.updating.load(Ordering::SeqCst)
  }

  fn register_subscriber(&self, _manual: bool) {
    self.subscriber_count.fetch_add(1, Ordering::SeqCst);
  }

  fn deregister_subscriber(&self) {
    let remaining = self
      .subscriber_count
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
        Some(count.saturating_sub(1))
      })
      .expect("fetch_update with Some never fails")
      .saturating_sub(1);
    if remaining == 0 {
      let connection = self.connection.clone();
      let broker = self.broker.clone();
      tokio::spawn(async move {
        let mut connection = connection.lock().await;
        if let Some(token) = connection.token.take() {
          token.cancel();
        }
        if connection.address.take().is_some() {
          connection.entry = None;
          drop(connection);
          broker.try_publish(
            Payload::Message(Message::Status(Status::disconnected())),
            TOPIC_BROADCAST,
          );
        }
      });
    }
  }
}
