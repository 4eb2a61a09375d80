// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Serial port plumbing shared by all framers: the port is opened in a named
//! thread (some platforms block in open for seconds), then served by a
//! blocking reader thread feeding a bounded chunk channel and a writer thread
//! draining an outbound channel. The reader can be torn down and respawned
//! without touching the writer, which is what the SensingTex mode switch
//! needs.

use serialport::{ClearBuffer, SerialPort};
use std::{io::ErrorKind, thread, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::errors::DeviceError;

const BAUD_RATE: u32 = 115_200;
/// Poll timeout on blocking reads; bounds how long a cancelled reader thread
/// keeps running.
const READ_POLL: Duration = Duration::from_millis(100);
const READ_BUFFER_SIZE: usize = 2048;
const CHUNK_CHANNEL_CAPACITY: usize = 64;
const WRITE_CHANNEL_CAPACITY: usize = 256;

/// One spawned reader over the port. Dropping it without [`SerialReader::shutdown`]
/// still stops the thread via the transport token, just without waiting.
pub struct SerialReader {
  chunks: mpsc::Receiver<Vec<u8>>,
  finished: oneshot::Receiver<()>,
  token: CancellationToken,
}

impl SerialReader {
  /// Next chunk of raw bytes, `None` once the reader thread has exited.
  pub async fn recv(&mut self) -> Option<Vec<u8>> {
    self.chunks.recv().await
  }

  /// Cancels the reader thread and waits for it to finish. The thread may be
  /// blocked in a poll-timeout read; this returns once that read has come
  /// back and the thread has observed the cancellation.
  pub async fn shutdown(self) {
    self.token.cancel();
    let _ = self.finished.await;
  }
}

pub struct SerialTransport {
  path: String,
  port: Box<dyn SerialPort>,
  writer: mpsc::Sender<Vec<u8>>,
  token: CancellationToken,
}

impl SerialTransport {
  /// Opens `path` at 115200 8N1.
  pub async fn open(path: &str) -> Result<Self, DeviceError> {
    let (port_sender, mut port_receiver) = mpsc::channel(1);
    let port_path = path.to_owned();
    thread::Builder::new()
      .name("Serial Port Connection Thread".to_owned())
      .spawn(move || {
        debug!("Opening serial port {}", port_path);
        let port_result = serialport::new(&port_path, BAUD_RATE).timeout(READ_POLL).open();
        if port_sender.blocking_send(port_result).is_err() {
          warn!("Serial port open outlived its transport, dropping port.");
        }
      })
      .expect("Thread creation should always succeed");

    let port = port_receiver
      .recv()
      .await
      .expect("Open thread always sends exactly once")
      .map_err(|err| DeviceError::PortOpen(path.to_owned(), err.to_string()))?;

    let write_port = port
      .try_clone()
      .map_err(|err| DeviceError::PortOpen(path.to_owned(), err.to_string()))?;
    let (writer, writer_receiver) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
    thread::Builder::new()
      .name("Serial Writer Thread".to_owned())
      .spawn(move || serial_write_thread(write_port, writer_receiver))
      .expect("Thread creation should always succeed");

    Ok(Self {
      path: path.to_owned(),
      port,
      writer,
      token: CancellationToken::new(),
    })
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  /// Starts a reader thread feeding a fresh chunk channel.
  pub fn spawn_reader(&self) -> Result<SerialReader, DeviceError> {
    let read_port = self
      .port
      .try_clone()
      .map_err(|err| DeviceError::Serial(self.path.clone(), err.to_string()))?;
    let token = self.token.child_token();
    let read_token = token.clone();
    let (chunk_sender, chunks) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let (finished_sender, finished) = oneshot::channel();
    thread::Builder::new()
      .name("Serial Reader Thread".to_owned())
      .spawn(move || {
        serial_read_thread(read_port, chunk_sender, read_token);
        let _ = finished_sender.send(());
      })
      .expect("Thread creation should always succeed");
    Ok(SerialReader {
      chunks,
      finished,
      token,
    })
  }

  /// Queues bytes for the writer thread, verbatim.
  pub async fn write(&mut self, bytes: Vec<u8>) -> Result<(), DeviceError> {
    self
      .writer
      .send(bytes)
      .await
      .map_err(|_| DeviceError::DeviceGone(self.path.clone()))
  }

  /// Discards whatever the OS has buffered on the receive side.
  pub fn clear_input(&self) -> Result<(), DeviceError> {
    self
      .port
      .clear(ClearBuffer::Input)
      .map_err(|err| DeviceError::Serial(self.path.clone(), err.to_string()))
  }
}

impl Drop for SerialTransport {
  fn drop(&mut self) {
    self.token.cancel();
  }
}

fn serial_write_thread(mut port: Box<dyn SerialPort>, mut receiver: mpsc::Receiver<Vec<u8>>) {
  // Exits when the transport (and with it the channel sender) is dropped.
  while let Some(bytes) = receiver.blocking_recv() {
    if let Err(err) = port.write_all(&bytes) {
      error!("Cannot write to serial port, exiting writer thread: {}", err);
      return;
    }
  }
}

fn serial_read_thread(
  mut port: Box<dyn SerialPort>,
  sender: mpsc::Sender<Vec<u8>>,
  token: CancellationToken,
) {
  let mut buf = [0u8; READ_BUFFER_SIZE];
  while !token.is_cancelled() {
    match port.read(&mut buf) {
      Ok(0) => continue,
      Ok(len) => {
        trace!("Got {} serial bytes", len);
        if sender.blocking_send(buf[0..len].to_vec()).is_err() {
          debug!("Chunk channel dropped, exiting reader thread.");
          break;
        }
      }
      Err(err) if err.kind() == ErrorKind::TimedOut => continue,
      Err(err) => {
        warn!("Serial read failed, exiting reader thread: {}", err);
        break;
      }
    }
  }
}
