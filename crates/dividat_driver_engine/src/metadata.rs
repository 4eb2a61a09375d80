use serde::Serialize;
use std::fs;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Driver self-description served on `GET /`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverMetadata {
  message: String,
  version: String,
  machine_id: String,
  os: String,
  arch: String,
}

impl DriverMetadata {
  pub fn collect() -> Self {
    Self {
      message: "Dividat Driver".to_owned(),
      version: VERSION.to_owned(),
      machine_id: machine_id(),
      os: std::env::consts::OS.to_owned(),
      arch: std::env::consts::ARCH.to_owned(),
    }
  }
}

/// Best-effort stable machine identifier.
fn machine_id() -> String {
  for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
    if let Ok(id) = fs::read_to_string(path) {
      let id = id.trim();
      if !id.is_empty() {
        return id.to_owned();
      }
    }
  }
  "unknown".to_owned()
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_metadata_serializes_with_expected_fields() {
    let js = serde_json::to_string(&DriverMetadata::collect()).expect("Infallible serialization");
    for field in ["\"message\"", "\"version\"", "\"machineId\"", "\"os\"", "\"arch\""] {
      assert!(js.contains(field), "missing {} in {}", field, js);
    }
  }
}
