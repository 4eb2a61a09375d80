// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Serial device enumeration: lists system ports plus test-mode mock
//! registrations and classifies each into a device family. Classification is
//! a pure function of the USB record, so mocks and real hardware go through
//! the same path.

pub mod mock;

use dividat_driver_core::message::UsbDeviceInfo;
use serialport::{SerialPortType, available_ports};
use std::sync::Arc;

pub use mock::MockDeviceRegistry;

/// Vendor id shared by all supported Flex mat controllers.
pub const FLEX_VENDOR_ID: u16 = 0x16C0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
  Passthru,
  SensingTex,
  Sensitronics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedDevice {
  pub family: DeviceFamily,
  pub info: UsbDeviceInfo,
}

/// Classifies a USB record into a device family, or rejects it.
pub fn match_device(info: &UsbDeviceInfo) -> Option<DeviceFamily> {
  if info.vendor_id() != FLEX_VENDOR_ID {
    return None;
  }
  if info.product().starts_with("PASSTHRU") {
    Some(DeviceFamily::Passthru)
  } else if info.manufacturer() == "Teensyduino" {
    Some(DeviceFamily::SensingTex)
  } else if ["Sensitronics", "Dividat"].contains(&info.manufacturer().as_str()) {
    Some(DeviceFamily::Sensitronics)
  } else {
    None
  }
}

pub struct Enumerator {
  mocks: Arc<MockDeviceRegistry>,
}

impl Enumerator {
  pub fn new(mocks: Arc<MockDeviceRegistry>) -> Self {
    Self { mocks }
  }

  pub fn mocks(&self) -> &Arc<MockDeviceRegistry> {
    &self.mocks
  }

  /// Ordered sequence of classified devices: system serial ports first, then
  /// mock registrations in registration order.
  pub fn list(&self) -> Vec<MatchedDevice> {
    let mut devices = Vec::new();
    match available_ports() {
      Ok(ports) => {
        for port in ports {
          let SerialPortType::UsbPort(usb) = port.port_type else {
            continue;
          };
          let info = UsbDeviceInfo::new(
            &port.port_name,
            usb.vid,
            usb.pid,
            // Platform enumeration through serialport does not expose the
            // device release number.
            0,
            usb.serial_number.as_deref().unwrap_or(""),
            usb.manufacturer.as_deref().unwrap_or(""),
            usb.product.as_deref().unwrap_or(""),
          );
          devices.push(info);
        }
      }
      Err(err) => {
        warn!("Cannot enumerate serial ports, treating as empty: {}", err);
      }
    }
    devices.extend(self.mocks.devices());

    devices
      .into_iter()
      .filter_map(|info| match_device(&info).map(|family| MatchedDevice { family, info }))
      .collect()
  }

  pub fn find_by_path(&self, path: &str) -> Option<MatchedDevice> {
    self.list().into_iter().find(|device| device.info.path() == path)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn info(vendor: u16, manufacturer: &str, product: &str) -> UsbDeviceInfo {
    UsbDeviceInfo::new("/dev/ttyACM0", vendor, 0x0486, 0x0277, "1", manufacturer, product)
  }

  #[test]
  fn test_vendor_gate() {
    assert_eq!(match_device(&info(0x14F2, "Teensyduino", "")), None);
    assert_eq!(
      match_device(&info(0x16C0, "Teensyduino", "")),
      Some(DeviceFamily::SensingTex)
    );
  }

  #[test]
  fn test_passthru_prefix_wins() {
    assert_eq!(
      match_device(&info(0x16C0, "Teensyduino", "PASSTHRU-Sensitronics")),
      Some(DeviceFamily::Passthru)
    );
    assert_eq!(
      match_device(&info(0x16C0, "", "PASSTHRU")),
      Some(DeviceFamily::Passthru)
    );
  }

  #[test]
  fn test_sensitronics_manufacturers() {
    assert_eq!(
      match_device(&info(0x16C0, "Sensitronics", "")),
      Some(DeviceFamily::Sensitronics)
    );
    assert_eq!(
      match_device(&info(0x16C0, "Dividat", "")),
      Some(DeviceFamily::Sensitronics)
    );
    assert_eq!(match_device(&info(0x16C0, "Acme", "")), None);
  }
}
