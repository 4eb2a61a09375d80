// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Registry of synthetic serial devices, fed by the test-mode HTTP routes.
//! Registered records go through the same hex parsing and classification as
//! platform enumeration, so replays exercise the real connect path.

use dividat_driver_core::message::{PortDetails, UsbDeviceInfo};
use std::{
  collections::BTreeMap,
  sync::{
    RwLock,
    atomic::{AtomicU64, Ordering},
  },
};

#[derive(Default)]
pub struct MockDeviceRegistry {
  devices: RwLock<BTreeMap<u64, PortDetails>>,
  next_id: AtomicU64,
}

impl MockDeviceRegistry {
  pub fn register(&self, details: PortDetails) -> u64 {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    info!("Registering mock device {} at {}", id, details.name());
    self
      .devices
      .write()
      .expect("Registry lock poisoned")
      .insert(id, details);
    id
  }

  pub fn unregister(&self, id: u64) -> bool {
    let removed = self
      .devices
      .write()
      .expect("Registry lock poisoned")
      .remove(&id)
      .is_some();
    if removed {
      info!("Unregistered mock device {}", id);
    }
    removed
  }

  /// Decoded records in registration order. A record with invalid hex fields
  /// is a programmer error in the registering test: logged and skipped.
  pub fn devices(&self) -> Vec<UsbDeviceInfo> {
    self
      .devices
      .read()
      .expect("Registry lock poisoned")
      .values()
      .filter_map(|details| match UsbDeviceInfo::try_from(details) {
        Ok(info) => Some(info),
        Err(err) => {
          error!("Skipping mock device {}: {}", details.name(), err);
          None
        }
      })
      .collect()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_register_unregister() {
    let registry = MockDeviceRegistry::default();
    let id = registry.register(PortDetails::new(
      "16C0", "0486", "0277", "1", "Teensyduino", "", "/tmp/vtty_0",
    ));
    assert_eq!(registry.devices().len(), 1);
    assert!(registry.unregister(id));
    assert!(!registry.unregister(id));
    assert!(registry.devices().is_empty());
  }

  #[test]
  fn test_invalid_hex_is_skipped() {
    let registry = MockDeviceRegistry::default();
    registry.register(PortDetails::new(
      "16C0", "0486", "0277", "1", "Teensyduino", "", "/tmp/vtty_0",
    ));
    registry.register(PortDetails::new(
      "nope", "0486", "0277", "2", "Teensyduino", "", "/tmp/vtty_1",
    ));
    let devices = registry.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].serial_number(), "1");
  }

  #[test]
  fn test_registration_order_is_stable() {
    let registry = MockDeviceRegistry::default();
    for i in 0..5 {
      registry.register(PortDetails::new(
        "16C0",
        "0486",
        "0277",
        &i.to_string(),
        "Teensyduino",
        "",
        &format!("/tmp/vtty_{}", i),
      ));
    }
    let serials: Vec<_> = registry
      .devices()
      .iter()
      .map(|d| d.serial_number().clone())
      .collect();
    assert_eq!(serials, vec!["0", "1", "2", "3", "4"]);
  }
}
