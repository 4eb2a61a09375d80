use dividat_driver_server::{
  DeviceSession,
  enumerator::{Enumerator, MockDeviceRegistry},
  flex::FlexSession,
  rfid::RfidSession,
  senso::SensoSession,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
  error::EngineError,
  hub::{GatewayState, router},
  metadata::DriverMetadata,
  options::EngineOptions,
};

/// Owns the device sessions and the localhost gateway. Everything runs under
/// one root cancellation scope; [`DriverEngine::stop`] winds the whole driver
/// down, brokers included.
#[derive(Default)]
pub struct DriverEngine {
  stop_token: CancellationToken,
}

impl DriverEngine {
  pub async fn run(&self, options: &EngineOptions) -> Result<(), EngineError> {
    for origin in options.permissible_origins() {
      info!("Permitting origin {}", origin);
    }

    let mocks = Arc::new(MockDeviceRegistry::default());
    let enumerator = Arc::new(Enumerator::new(mocks.clone()));
    let flex = FlexSession::new(enumerator, self.stop_token.child_token());
    let senso = SensoSession::new(self.stop_token.child_token());
    let rfid = RfidSession::new(self.stop_token.child_token());

    if let Some(address) = options.senso_address() {
      if let Err(err) = senso.connect(address).await {
        warn!("Cannot connect to configured Senso at {}: {}", address, err);
      }
    }

    let state = GatewayState {
      flex,
      senso,
      rfid,
      mocks,
      metadata: DriverMetadata::collect(),
    };
    let app = router(state, options.test_mode());

    let addr = SocketAddr::from(([127, 0, 0, 1], options.port()));
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|err| EngineError::Setup(format!("Cannot bind {}: {}", addr, err)))?;
    info!("Dividat Driver listening on {}", addr);

    let shutdown = self.stop_token.clone();
    axum::serve(listener, app.into_make_service())
      .with_graceful_shutdown(async move { shutdown.cancelled().await })
      .await?;
    info!("Gateway stopped");
    Ok(())
  }

  pub fn stop(&self) {
    info!("Engine stop called, cancelling root scope.");
    self.stop_token.cancel();
  }
}
