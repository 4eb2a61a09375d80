//! Capture and replay tooling for device traffic. A recording is the line
//! format of `dividat_driver_core::recording`; capture attaches to a running
//! driver's WebSocket endpoint, replay feeds a virtual TTY that a mock
//! device registration points at.

use dividat_driver_core::recording::{self, Record};
use futures::StreamExt;
use std::path::Path;
use tokio::{
  fs,
  io::AsyncWriteExt,
  sync::mpsc,
  time::Instant,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::EngineError;

/// Connects to a device endpoint of a running driver and appends every
/// binary frame to `output` with its inter-frame delay. Runs until the
/// server closes or the returned future is dropped (ctrl-c in the CLI).
pub async fn record(url: &str, output: &Path) -> Result<(), EngineError> {
  let (mut socket, _) = connect_async(url)
    .await
    .map_err(|err| EngineError::Setup(format!("Cannot connect to {}: {}", url, err)))?;
  let mut file = fs::File::create(output).await?;
  info!("Recording frames from {} to {}", url, output.display());

  let mut last_frame = Instant::now();
  let mut frames = 0u64;
  while let Some(message) = socket.next().await {
    match message {
      Ok(WsMessage::Binary(payload)) => {
        let sleep_ms = last_frame.elapsed().as_millis() as u64;
        last_frame = Instant::now();
        let line = recording::format_line(&Record::new(sleep_ms, payload.to_vec()));
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        frames += 1;
      }
      // Status traffic is not part of a recording.
      Ok(WsMessage::Text(_)) => {}
      Ok(WsMessage::Close(_)) | Err(_) => break,
      Ok(_) => {}
    }
  }
  file.flush().await?;
  info!("Recorded {} frames", frames);
  Ok(())
}

/// Replays a recording into the writable side of a virtual TTY, honoring the
/// recorded delays scaled by `speed`.
pub async fn replay(input: &Path, tty: &Path, speed: f64) -> Result<(), EngineError> {
  let contents = fs::read_to_string(input).await?;
  let records = recording::parse(&contents)?;
  info!(
    "Replaying {} records into {} at {}x",
    records.len(),
    tty.display(),
    speed
  );

  let mut file = fs::OpenOptions::new().write(true).open(tty).await?;
  let (sender, mut receiver) = mpsc::channel::<Vec<u8>>(8);
  let writer = tokio::spawn(async move {
    while let Some(payload) = receiver.recv().await {
      if let Err(err) = file.write_all(&payload).await {
        error!("Cannot write to replay target: {}", err);
        return;
      }
    }
  });
  recording::replay(&records, speed, sender).await;
  writer
    .await
    .map_err(|err| EngineError::Setup(format!("Replay writer failed: {}", err)))?;
  Ok(())
}
