use dividat_driver_core::DriverError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("Cannot bring up the gateway: {0}")]
  Setup(String),
  #[error(transparent)]
  Driver(#[from] DriverError),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}
