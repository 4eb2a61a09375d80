// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The JSON command/status protocol spoken between the driver and browser
//! clients, plus the payload type carried on session broker topics.
//!
//! Clients send [`Command`] values as WebSocket text frames. The driver
//! answers with [`Message`] values, either directly (command replies) or
//! wrapped in [`Broadcast`] when fanned out to every subscriber of a session.

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::errors::DriverError;

/// What flows through a session's broker: raw device frames on the `rx`/`tx`
/// topics, protocol messages on the broadcast topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  Frame(Vec<u8>),
  Message(Message),
}

/// USB enumeration record for a Flex device. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceInfo {
  /// Opaque device locator, e.g. `/dev/ttyACM0` or a virtual TTY path.
  #[getset(get = "pub")]
  path: String,
  #[getset(get_copy = "pub")]
  vendor_id: u16,
  #[getset(get_copy = "pub")]
  product_id: u16,
  #[getset(get_copy = "pub")]
  bcd_device: u16,
  #[serde(default)]
  #[getset(get = "pub")]
  serial_number: String,
  #[serde(default)]
  #[getset(get = "pub")]
  manufacturer: String,
  #[serde(default)]
  #[getset(get = "pub")]
  product: String,
}

impl UsbDeviceInfo {
  pub fn new(
    path: &str,
    vendor_id: u16,
    product_id: u16,
    bcd_device: u16,
    serial_number: &str,
    manufacturer: &str,
    product: &str,
  ) -> Self {
    Self {
      path: path.to_owned(),
      vendor_id,
      product_id,
      bcd_device,
      serial_number: serial_number.to_owned(),
      manufacturer: manufacturer.to_owned(),
      product: product.to_owned(),
    }
  }

  /// Copy with the `PASSTHRU-` impersonation prefix stripped from the product
  /// name, so replayed devices report the family they stand in for.
  pub fn concealed(&self) -> Self {
    let mut info = self.clone();
    if let Some(rest) = info.product.strip_prefix("PASSTHRU-") {
      info.product = rest.to_owned();
    }
    info
  }
}

/// mDNS service entry for a discovered Senso.
#[derive(Debug, Clone, PartialEq, Eq, Default, Getters, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
  #[getset(get = "pub")]
  hostname: String,
  /// Raw TXT records, `key=value`.
  #[serde(default)]
  #[getset(get = "pub")]
  text: Vec<String>,
  #[serde(default)]
  #[getset(get = "pub")]
  ip4: Vec<String>,
  #[serde(default)]
  #[getset(get = "pub")]
  ip6: Vec<String>,
}

impl ServiceEntry {
  pub fn new(hostname: &str, text: Vec<String>, ip4: Vec<String>, ip6: Vec<String>) -> Self {
    Self {
      hostname: hostname.to_owned(),
      text,
      ip4,
      ip6,
    }
  }

  /// Serial number from the TXT records, if the device advertises one.
  pub fn serial(&self) -> Option<&str> {
    self
      .text
      .iter()
      .find_map(|record| record.strip_prefix("Serial="))
  }

  /// Best address to dial: first IPv4, then IPv6, then the hostname.
  pub fn address(&self) -> &str {
    self
      .ip4
      .first()
      .or_else(|| self.ip6.first())
      .map(String::as_str)
      .unwrap_or(&self.hostname)
  }
}

/// Connected-device description as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "deviceType")]
pub enum DeviceInfo {
  #[serde(rename = "flex", rename_all = "camelCase")]
  Flex { usb_device: UsbDeviceInfo },
  #[serde(rename = "senso", rename_all = "camelCase")]
  Senso { tcp_device: ServiceEntry },
}

/// Session connection state. A null address means not connected; exactly one
/// device is connected per session at a time.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct Status {
  #[getset(get = "pub")]
  address: Option<String>,
  #[getset(get = "pub")]
  device: Option<DeviceInfo>,
}

impl Status {
  pub fn new(address: Option<String>, device: Option<DeviceInfo>) -> Self {
    Self { address, device }
  }

  pub fn disconnected() -> Self {
    Self {
      address: None,
      device: None,
    }
  }
}

/// Server-to-client protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
  Status(Status),
  Discovered {
    device: DeviceInfo,
    // Senso discovery results keep these for backward compatibility with
    // older Play releases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
  },
  FirmwareUpdateProgress {
    message: String,
  },
  FirmwareUpdateSuccess {
    message: String,
  },
  FirmwareUpdateFailure {
    message: String,
  },
}

/// Wrapper for messages emitted to all subscribers of a session, as opposed
/// to direct command replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "Broadcast")]
pub struct Broadcast {
  pub message: Message,
}

/// Client-to-server command, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
  GetStatus,
  Connect {
    address: String,
  },
  Disconnect,
  Discover {
    /// Seconds the discovery channel stays open.
    duration: u64,
  },
  #[serde(rename_all = "camelCase")]
  UpdateFirmware {
    serial_number: String,
    /// Base64-encoded firmware image.
    image: String,
  },
}

/// Mock device registration record, accepted on the test-mode HTTP route.
/// Vendor/product/bcd are 4-digit hex strings exactly as platform
/// enumeration reports them.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDetails {
  #[getset(get = "pub")]
  vendor_id: String,
  #[getset(get = "pub")]
  product_id: String,
  #[getset(get = "pub")]
  bcd_device: String,
  #[serde(default)]
  #[getset(get = "pub")]
  serial_number: String,
  #[serde(default)]
  #[getset(get = "pub")]
  manufacturer: String,
  #[serde(default)]
  #[getset(get = "pub")]
  product: String,
  /// Path of the virtual TTY backing the mock device.
  #[getset(get = "pub")]
  name: String,
}

impl PortDetails {
  pub fn new(
    vendor_id: &str,
    product_id: &str,
    bcd_device: &str,
    serial_number: &str,
    manufacturer: &str,
    product: &str,
    name: &str,
  ) -> Self {
    Self {
      vendor_id: vendor_id.to_owned(),
      product_id: product_id.to_owned(),
      bcd_device: bcd_device.to_owned(),
      serial_number: serial_number.to_owned(),
      manufacturer: manufacturer.to_owned(),
      product: product.to_owned(),
      name: name.to_owned(),
    }
  }
}

fn parse_hex16(field: &'static str, value: &str) -> Result<u16, DriverError> {
  if value.len() != 4 {
    return Err(DriverError::InvalidHexField(field, value.to_owned()));
  }
  u16::from_str_radix(value, 16).map_err(|_| DriverError::InvalidHexField(field, value.to_owned()))
}

impl TryFrom<&PortDetails> for UsbDeviceInfo {
  type Error = DriverError;

  fn try_from(details: &PortDetails) -> Result<Self, DriverError> {
    Ok(UsbDeviceInfo::new(
      &details.name,
      parse_hex16("vendorId", &details.vendor_id)?,
      parse_hex16("productId", &details.product_id)?,
      parse_hex16("bcdDevice", &details.bcd_device)?,
      &details.serial_number,
      &details.manufacturer,
      &details.product,
    ))
  }
}

#[cfg(test)]
mod test {
  use super::*;

  const GET_STATUS_STR: &str = "{\"type\":\"GetStatus\"}";
  const CONNECT_STR: &str = "{\"type\":\"Connect\",\"address\":\"/tmp/vtty_0\"}";
  const DISCOVER_STR: &str = "{\"type\":\"Discover\",\"duration\":5}";
  const STATUS_NULL_STR: &str = "{\"type\":\"Status\",\"address\":null,\"device\":null}";

  #[test]
  fn test_command_roundtrip() {
    for command in [
      Command::GetStatus,
      Command::Connect {
        address: "/tmp/vtty_0".to_owned(),
      },
      Command::Disconnect,
      Command::Discover { duration: 5 },
      Command::UpdateFirmware {
        serial_number: "2000-1".to_owned(),
        image: "AAAA".to_owned(),
      },
    ] {
      let js = serde_json::to_string(&command).expect("Infallible serialization");
      let back: Command = serde_json::from_str(&js).expect("Infallible deserialization");
      assert_eq!(command, back);
    }
  }

  #[test]
  fn test_command_wire_format() {
    assert_eq!(
      serde_json::to_string(&Command::GetStatus).expect("Infallible serialization"),
      GET_STATUS_STR
    );
    assert_eq!(
      serde_json::from_str::<Command>(CONNECT_STR).expect("Infallible deserialization"),
      Command::Connect {
        address: "/tmp/vtty_0".to_owned()
      }
    );
    assert_eq!(
      serde_json::from_str::<Command>(DISCOVER_STR).expect("Infallible deserialization"),
      Command::Discover { duration: 5 }
    );
  }

  #[test]
  fn test_unknown_command_tag_rejected() {
    assert!(serde_json::from_str::<Command>("{\"type\":\"Reboot\"}").is_err());
  }

  #[test]
  fn test_disconnected_status_wire_format() {
    let message = Message::Status(Status::disconnected());
    assert_eq!(
      serde_json::to_string(&message).expect("Infallible serialization"),
      STATUS_NULL_STR
    );
  }

  #[test]
  fn test_status_reports_flex_device() {
    let info = UsbDeviceInfo::new("/tmp/vtty_0", 0x16C0, 0x0486, 0x0277, "1234", "Teensyduino", "");
    let message = Message::Status(Status::new(
      Some("/tmp/vtty_0".to_owned()),
      Some(DeviceInfo::Flex {
        usb_device: info.clone(),
      }),
    ));
    let js = serde_json::to_string(&message).expect("Infallible serialization");
    assert!(js.contains("\"deviceType\":\"flex\""));
    assert!(js.contains("\"usbDevice\""));
    assert!(js.contains("\"serialNumber\":\"1234\""));
    let back: Message = serde_json::from_str(&js).expect("Infallible deserialization");
    assert_eq!(message, back);
  }

  #[test]
  fn test_broadcast_wraps_message() {
    let broadcast = Broadcast {
      message: Message::Status(Status::disconnected()),
    };
    let js = serde_json::to_string(&broadcast).expect("Infallible serialization");
    assert!(js.starts_with("{\"type\":\"Broadcast\""));
    assert!(js.contains("\"message\":{\"type\":\"Status\""));
    let back: Broadcast = serde_json::from_str(&js).expect("Infallible deserialization");
    assert_eq!(broadcast, back);
  }

  #[test]
  fn test_passthru_concealment() {
    let info = UsbDeviceInfo::new("/tmp/vtty_0", 0x16C0, 1, 1, "", "", "PASSTHRU-SensingTex");
    assert_eq!(info.concealed().product(), "SensingTex");
    let plain = UsbDeviceInfo::new("/tmp/vtty_0", 0x16C0, 1, 1, "", "", "Flex");
    assert_eq!(plain.concealed().product(), "Flex");
  }

  #[test]
  fn test_port_details_hex_parse() {
    let details = PortDetails::new("16C0", "0486", "0277", "77", "Teensyduino", "", "/tmp/vtty_0");
    let info = UsbDeviceInfo::try_from(&details).expect("Valid hex fields");
    assert_eq!(info.vendor_id(), 0x16C0);
    assert_eq!(info.bcd_device(), 0x0277);

    let bad = PortDetails::new("16C", "0486", "0277", "", "", "", "/tmp/vtty_0");
    assert!(UsbDeviceInfo::try_from(&bad).is_err());
    let bad = PortDetails::new("16C0", "xyzw", "0277", "", "", "", "/tmp/vtty_0");
    assert!(UsbDeviceInfo::try_from(&bad).is_err());
  }

  #[test]
  fn test_service_entry_serial() {
    let entry = ServiceEntry::new(
      "senso.local",
      vec!["Serial=2000-1".to_owned()],
      vec!["192.168.1.20".to_owned()],
      vec![],
    );
    assert_eq!(entry.serial(), Some("2000-1"));
    assert_eq!(entry.address(), "192.168.1.20");
  }
}
