// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The Flex session owns the currently connected pressure mat: it opens the
//! serial port, picks the framer for the device family, broadcasts status
//! transitions and runs the auto-connect scheduler.

pub mod framer;

use async_trait::async_trait;
use dividat_driver_core::{
  broker::{Broker, TOPIC_BROADCAST},
  message::{DeviceInfo, Message, Payload, Status},
};
use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
  enumerator::{Enumerator, MatchedDevice},
  errors::DeviceError,
  flex::framer::{SerialTransport, framer_for},
  session::DeviceSession,
};

/// Auto-connect scheduler period.
const SCHEDULER_TICK: Duration = Duration::from_secs(2);

struct Connection {
  current: Option<MatchedDevice>,
  token: Option<CancellationToken>,
  /// Bumped on every transition. The per-connection teardown hook only runs
  /// its cleanup when its generation is still the live one, so a connection
  /// that was replaced does not wipe its successor's state.
  generation: u64,
}

pub struct FlexSession {
  broker: Arc<Broker<Payload>>,
  enumerator: Arc<Enumerator>,
  connection: Arc<Mutex<Connection>>,
  subscriber_count: AtomicUsize,
  auto_connect: AtomicBool,
  session_token: CancellationToken,
}

impl FlexSession {
  /// Creates the session, its broker and the auto-connect scheduler. The
  /// broker shuts down when `session_token` is cancelled.
  pub fn new(enumerator: Arc<Enumerator>, session_token: CancellationToken) -> Arc<Self> {
    let session = Arc::new(Self {
      broker: Arc::new(Broker::default()),
      enumerator,
      connection: Arc::new(Mutex::new(Connection {
        current: None,
        token: None,
        generation: 0,
      })),
      subscriber_count: AtomicUsize::new(0),
      auto_connect: AtomicBool::new(false),
      session_token,
    });

    let scheduler = session.clone();
    tokio::spawn(async move {
      scheduler.run_scheduler().await;
      scheduler.broker.shutdown();
    });

    session
  }

  fn status_of(connection: &Connection) -> Status {
    match &connection.current {
      Some(device) => Status::new(
        Some(device.info.path().clone()),
        Some(DeviceInfo::Flex {
          usb_device: device.info.concealed(),
        }),
      ),
      None => Status::disconnected(),
    }
  }

  fn broadcast(&self, message: Message) {
    self
      .broker
      .try_publish(Payload::Message(message), TOPIC_BROADCAST);
  }

  /// Connects to a classified device. Success with no side effect when the
  /// device is already the current one.
  pub async fn connect_device(&self, device: MatchedDevice) -> Result<(), DeviceError> {
    let mut connection = self.connection.lock().await;
    if connection.current.as_ref() == Some(&device) {
      return Ok(());
    }

    // Tear down any existing connection. The superseded task's hook sees a
    // stale generation and skips its own cleanup.
    if let Some(token) = connection.token.take() {
      token.cancel();
    }
    if connection.current.take().is_some() {
      connection.generation += 1;
      self.broadcast(Message::Status(Status::disconnected()));
    }

    let mut transport = SerialTransport::open(device.info.path()).await?;
    let mut framer = framer_for(device.family);

    connection.generation += 1;
    let generation = connection.generation;
    let token = self.session_token.child_token();
    connection.current = Some(device.clone());
    connection.token = Some(token.clone());
    info!("Connected to {}", device.info.path());
    self.broadcast(Message::Status(Self::status_of(&connection)));

    let broker = self.broker.clone();
    let connection_handle = self.connection.clone();
    tokio::spawn(async move {
      match framer.run(&mut transport, &broker, &token).await {
        Ok(()) => debug!("Framer for {} finished", transport.path()),
        Err(err) => warn!("Framer for {} failed: {}", transport.path(), err),
      }
      drop(transport);
      // After-cancel hook: clear the device and tell every client, exactly
      // once, unless a newer connection has taken over.
      let mut connection = connection_handle.lock().await;
      if connection.generation == generation {
        connection.current = None;
        connection.token = None;
        drop(connection);
        broker.try_publish(
          Payload::Message(Message::Status(Status::disconnected())),
          TOPIC_BROADCAST,
        );
      }
    });
    Ok(())
  }

  async fn run_scheduler(&self) {
    let mut ticker = tokio::time::interval(SCHEDULER_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
      tokio::select! {
        _ = self.session_token.cancelled() => break,
        _ = ticker.tick() => {}
      }
      if !self.auto_connect.load(Ordering::SeqCst)
        || self.subscriber_count.load(Ordering::SeqCst) == 0
      {
        continue;
      }
      if self.connection.lock().await.current.is_some() {
        continue;
      }
      for device in self.enumerator.list() {
        match self.connect_device(device.clone()).await {
          Ok(()) => break,
          Err(err) => debug!("Auto-connect to {} failed: {}", device.info.path(), err),
        }
      }
    }
  }

  fn cancel_connection(&self) {
    let connection = self.connection.clone();
    tokio::spawn(async move {
      if let Some(token) = connection.lock().await.token.take() {
        token.cancel();
      }
    });
  }
}

#[async_trait]
impl DeviceSession for FlexSession {
  fn broker(&self) -> &Arc<Broker<Payload>> {
    &self.broker
  }

  async fn status(&self) -> Status {
    Self::status_of(&*self.connection.lock().await)
  }

  async fn connect(&self, address: &str) -> Result<(), DeviceError> {
    let device = self
      .enumerator
      .find_by_path(address)
      .ok_or_else(|| DeviceError::DeviceNotFound(address.to_owned()))?;
    self.connect_device(device).await
  }

  async fn disconnect(&self) {
    if let Some(token) = self.connection.lock().await.token.take() {
      token.cancel();
    }
  }

  fn discover(&self, duration: Duration) -> mpsc::Receiver<Message> {
    let (sender, receiver) = mpsc::channel(64);
    if duration.is_zero() {
      return receiver;
    }
    let enumerator = self.enumerator.clone();
    tokio::spawn(async move {
      for device in enumerator.list() {
        let message = Message::Discovered {
          device: DeviceInfo::Flex {
            usb_device: device.info.concealed(),
          },
          service: None,
          ip: None,
        };
        if sender.send(message).await.is_err() {
          return;
        }
      }
    });
    receiver
  }

  async fn update_firmware(&self, serial_number: &str, _image_base64: &str) {
    warn!(
      "Rejecting firmware update for {}: Flex devices are not flashable through the driver",
      serial_number
    );
    self.broadcast(Message::FirmwareUpdateFailure {
      message: "Firmware update is not supported for Flex devices".to_owned(),
    });
  }

  fn updating(&self) -> bool {
    false
  }

  fn register_subscriber(&self, manual: bool) {
    self.subscriber_count.fetch_add(1, Ordering::SeqCst);
    // Last subscriber wins: a manual-connect client parks the scheduler, a
    // later automatic client revives it.
    self.auto_connect.store(!manual, Ordering::SeqCst);
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
      self.auto_connect.store(false, Ordering::SeqCst);
      self.cancel_connection();
    }
  }
}
