use getset::{CopyGetters, Getters};

/// Default port of the localhost HTTP/WebSocket gateway.
pub const DEFAULT_PORT: u16 = 8382;

#[derive(CopyGetters, Getters, Debug, Clone)]
pub struct EngineOptions {
  #[getset(get_copy = "pub")]
  port: u16,
  /// Origins allowed to open gateway connections. Enforcement happens in the
  /// HTTP front; the driver records and logs them.
  #[getset(get = "pub")]
  permissible_origins: Vec<String>,
  /// Enables the mock-device HTTP routes (debug builds only).
  #[getset(get_copy = "pub")]
  test_mode: bool,
  /// Senso to connect to as soon as the driver starts.
  #[getset(get = "pub")]
  senso_address: Option<String>,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      port: DEFAULT_PORT,
      permissible_origins: Vec::new(),
      test_mode: false,
      senso_address: None,
    }
  }
}

#[derive(Default)]
pub struct EngineOptionsBuilder {
  options: EngineOptions,
}

impl EngineOptionsBuilder {
  pub fn port(&mut self, port: u16) -> &mut Self {
    self.options.port = port;
    self
  }

  pub fn permissible_origin(&mut self, origin: &str) -> &mut Self {
    self.options.permissible_origins.push(origin.to_owned());
    self
  }

  pub fn test_mode(&mut self, value: bool) -> &mut Self {
    self.options.test_mode = value;
    self
  }

  pub fn senso_address(&mut self, address: &str) -> &mut Self {
    self.options.senso_address = Some(address.to_owned());
    self
  }

  pub fn finish(&mut self) -> EngineOptions {
    self.options.clone()
  }
}
