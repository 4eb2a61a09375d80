// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! mDNS discovery of Senso devices on the local network. A browse runs for a
//! caller-supplied duration and closes its channel when the duration elapses.

use dividat_driver_core::message::ServiceEntry;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::{collections::HashSet, time::Duration};
use tokio::sync::mpsc;

/// Service type advertised by the Senso control firmware.
pub const SENSO_SERVICE_TYPE: &str = "_sensoControl._tcp.local.";

fn entry_from(info: &ServiceInfo) -> ServiceEntry {
  let text = info
    .get_properties()
    .iter()
    .map(|property| format!("{}={}", property.key(), property.val_str()))
    .collect();
  let ip4 = info
    .get_addresses()
    .iter()
    .filter(|address| address.is_ipv4())
    .map(|address| address.to_string())
    .collect();
  let ip6 = info
    .get_addresses()
    .iter()
    .filter(|address| address.is_ipv6())
    .map(|address| address.to_string())
    .collect();
  ServiceEntry::new(info.get_hostname(), text, ip4, ip6)
}

/// Browses for Sensos until `duration` elapses, deduplicating by service
/// fullname. A zero duration closes the channel without emitting.
pub fn browse(duration: Duration) -> mpsc::Receiver<ServiceEntry> {
  let (sender, receiver) = mpsc::channel(32);
  if duration.is_zero() {
    return receiver;
  }
  tokio::spawn(async move {
    let daemon = match ServiceDaemon::new() {
      Ok(daemon) => daemon,
      Err(err) => {
        warn!("Cannot start mDNS daemon: {}", err);
        return;
      }
    };
    let events = match daemon.browse(SENSO_SERVICE_TYPE) {
      Ok(events) => events,
      Err(err) => {
        warn!("Cannot browse for {}: {}", SENSO_SERVICE_TYPE, err);
        return;
      }
    };

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut seen = HashSet::new();
    loop {
      tokio::select! {
        _ = &mut deadline => break,
        event = events.recv_async() => match event {
          Ok(ServiceEvent::ServiceResolved(info)) => {
            if !seen.insert(info.get_fullname().to_owned()) {
              continue;
            }
            debug!("Discovered Senso {}", info.get_fullname());
            if sender.send(entry_from(&info)).await.is_err() {
              break;
            }
          }
          Ok(_) => {}
          Err(err) => {
            warn!("mDNS browse ended: {}", err);
            break;
          }
        },
      }
    }
    let _ = daemon.stop_browse(SENSO_SERVICE_TYPE);
    let _ = daemon.shutdown();
  });
  receiver
}

#[cfg(test)]
mod test {
  use super::*;

  #[tokio::test]
  async fn test_zero_duration_closes_without_emitting() {
    let mut receiver = browse(Duration::ZERO);
    assert!(receiver.recv().await.is_none());
  }
}
