// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Firmware transfer engine. Streams a decoded image to the Senso's control
//! port, reporting progress along the way. There is no retry; a failed flash
//! is reported and the operator decides.

use std::time::Duration;
use tokio::{io::AsyncWriteExt, net::TcpStream};

use super::{CONTROL_PORT, discovery};
use crate::errors::DeviceError;

const TRANSFER_CHUNK: usize = 4096;
const DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

/// Resolves the target address: as given, or by browsing for a Senso whose
/// advertised serial matches.
pub async fn resolve_target(
  serial: Option<&str>,
  address: Option<&str>,
) -> Result<String, DeviceError> {
  if let Some(address) = address {
    return Ok(address.to_owned());
  }
  let mut entries = discovery::browse(DISCOVERY_WINDOW);
  while let Some(entry) = entries.recv().await {
    match serial {
      Some(serial) if entry.serial() != Some(serial) => continue,
      _ => return Ok(entry.address().to_owned()),
    }
  }
  Err(DeviceError::FirmwareUpdate(match serial {
    Some(serial) => format!("No Senso with serial {} discovered", serial),
    None => "No Senso discovered".to_owned(),
  }))
}

/// Transfers `image` to the device, calling `progress` with operator-facing
/// status lines.
pub async fn update(
  image: &[u8],
  serial: Option<&str>,
  address: Option<&str>,
  progress: &(dyn Fn(String) + Send + Sync),
) -> Result<(), DeviceError> {
  if image.is_empty() {
    return Err(DeviceError::FirmwareUpdate("Firmware image is empty".to_owned()));
  }
  let address = resolve_target(serial, address).await?;
  progress(format!("Connecting to Senso at {}", address));
  let mut stream = TcpStream::connect((address.as_str(), CONTROL_PORT))
    .await
    .map_err(|err| DeviceError::FirmwareUpdate(format!("Cannot reach {}: {}", address, err)))?;

  progress(format!("Transferring firmware image ({} bytes)", image.len()));
  let mut sent = 0usize;
  let mut reported_percent = 0usize;
  for chunk in image.chunks(TRANSFER_CHUNK) {
    stream
      .write_all(chunk)
      .await
      .map_err(|err| DeviceError::FirmwareUpdate(format!("Transfer failed: {}", err)))?;
    sent += chunk.len();
    let percent = sent * 100 / image.len();
    if percent / 10 > reported_percent / 10 {
      reported_percent = percent;
      progress(format!("Transferred {}%", percent));
    }
  }
  stream
    .shutdown()
    .await
    .map_err(|err| DeviceError::FirmwareUpdate(format!("Transfer failed: {}", err)))?;
  progress("Waiting for the Senso to install the image".to_owned());
  Ok(())
}
