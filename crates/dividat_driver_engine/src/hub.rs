//! The WebSocket gateway. One handler serves every device endpoint: it
//! attaches a subscriber to the session's receive and broadcast topics,
//! copies frames and status messages onto the socket under a write deadline,
//! and dispatches decoded client commands back into the session.

use axum::{
  Json, Router,
  extract::{
    Path, State, WebSocketUpgrade,
    ws::{Message as WsMessage, WebSocket},
  },
  http::StatusCode,
  response::Response,
  routing::get,
};
use dividat_driver_core::{
  broker::{TOPIC_BROADCAST, TOPIC_RX, TOPIC_TX},
  message::{Broadcast, Command, Message, Payload, PortDetails},
};
use dividat_driver_server::{
  DeviceSession,
  enumerator::MockDeviceRegistry,
  flex::FlexSession,
  rfid::{RfidSession, TOPIC_RFID},
  senso::SensoSession,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::metadata::DriverMetadata;

/// Subprotocol literal a client offers to keep the session from
/// auto-connecting for as long as it is subscribed.
pub const MANUAL_CONNECT_SUBPROTOCOL: &str = "manual-connect";

/// Per-write deadline; a socket that cannot take a frame in this window is
/// torn down rather than allowed to stall the session.
const WRITE_DEADLINE: Duration = Duration::from_millis(50);

/// The underlying WebSocket permits one concurrent writer; command replies
/// and the copy task serialize through this.
type SharedSink = Arc<Mutex<SplitSink<WebSocket, WsMessage>>>;

#[derive(Clone)]
pub struct GatewayState {
  pub flex: Arc<FlexSession>,
  pub senso: Arc<SensoSession>,
  pub rfid: Arc<RfidSession>,
  pub mocks: Arc<MockDeviceRegistry>,
  pub metadata: DriverMetadata,
}

pub fn router(state: GatewayState, test_mode: bool) -> Router {
  let mut router = Router::new()
    .route("/", get(metadata_handler))
    .route("/flex", get(flex_ws))
    .route("/senso", get(senso_ws))
    .route("/rfid", get(rfid_ws))
    .route("/rfid/readers", get(rfid_readers));
  #[cfg(debug_assertions)]
  if test_mode {
    use axum::routing::{delete, post};
    router = router
      .route("/flex/mock/", post(register_mock))
      .route("/flex/mock/{id}", delete(unregister_mock));
  }
  #[cfg(not(debug_assertions))]
  let _ = test_mode;
  router.with_state(state)
}

async fn metadata_handler(State(state): State<GatewayState>) -> Json<DriverMetadata> {
  Json(state.metadata.clone())
}

async fn rfid_readers(State(state): State<GatewayState>) -> Json<serde_json::Value> {
  Json(serde_json::json!({ "readers": state.rfid.readers() }))
}

#[cfg(debug_assertions)]
async fn register_mock(
  State(state): State<GatewayState>,
  Json(details): Json<PortDetails>,
) -> Json<serde_json::Value> {
  let id = state.mocks.register(details);
  Json(serde_json::json!({ "id": id }))
}

#[cfg(debug_assertions)]
async fn unregister_mock(
  State(state): State<GatewayState>,
  Path(id): Path<u64>,
) -> StatusCode {
  if state.mocks.unregister(id) {
    StatusCode::NO_CONTENT
  } else {
    StatusCode::NOT_FOUND
  }
}

async fn flex_ws(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
  let session: Arc<dyn DeviceSession> = state.flex.clone();
  ws.protocols([MANUAL_CONNECT_SUBPROTOCOL])
    .on_upgrade(move |socket| device_socket(socket, session))
}

async fn senso_ws(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
  let session: Arc<dyn DeviceSession> = state.senso.clone();
  ws.protocols([MANUAL_CONNECT_SUBPROTOCOL])
    .on_upgrade(move |socket| device_socket(socket, session))
}

async fn rfid_ws(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
  ws.on_upgrade(move |socket| rfid_socket(socket, state.rfid.clone()))
}

/// Sends one message under the write deadline. An error here means the
/// connection is done for.
async fn send_with_deadline(sink: &SharedSink, message: WsMessage) -> Result<(), ()> {
  let mut sink = sink.lock().await;
  match tokio::time::timeout(WRITE_DEADLINE, sink.send(message)).await {
    Ok(Ok(())) => Ok(()),
    Ok(Err(_)) | Err(_) => Err(()),
  }
}

async fn send_json<T: Serialize>(sink: &SharedSink, value: &T) -> Result<(), ()> {
  let text = serde_json::to_string(value).map_err(|_| ())?;
  send_with_deadline(sink, WsMessage::Text(text.into())).await
}

async fn device_socket(socket: WebSocket, session: Arc<dyn DeviceSession>) {
  let manual = socket
    .protocol()
    .map(|protocol| protocol.as_bytes() == MANUAL_CONNECT_SUBPROTOCOL.as_bytes())
    .unwrap_or(false);
  session.register_subscriber(manual);

  let broker = session.broker().clone();
  let (Ok(rx), Ok(broadcast)) = (broker.subscribe(TOPIC_RX), broker.subscribe(TOPIC_BROADCAST))
  else {
    session.deregister_subscriber();
    return;
  };

  let (sink, mut stream) = socket.split();
  let sink: SharedSink = Arc::new(Mutex::new(sink));
  let token = CancellationToken::new();

  // Copy task: frames and broadcasts out to the socket.
  let writer = {
    let sink = sink.clone();
    let token = token.clone();
    let broker = broker.clone();
    tokio::spawn(async move {
      let mut rx = rx;
      let mut broadcast = broadcast;
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          frame = rx.recv() => match frame {
            Some(Payload::Frame(bytes)) => {
              if send_with_deadline(&sink, WsMessage::Binary(bytes.into())).await.is_err() {
                debug!("Binary write failed or timed out, closing connection");
                token.cancel();
                break;
              }
            }
            Some(Payload::Message(_)) => {}
            None => {
              token.cancel();
              break;
            }
          },
          message = broadcast.recv() => match message {
            Some(Payload::Message(message)) => {
              if send_json(&sink, &Broadcast { message }).await.is_err() {
                debug!("Broadcast write failed or timed out, closing connection");
                token.cancel();
                break;
              }
            }
            Some(Payload::Frame(_)) => {}
            None => {
              token.cancel();
              break;
            }
          },
        }
      }
      broker.unsubscribe(rx);
      broker.unsubscribe(broadcast);
    })
  };

  // Reader loop: binaries to the device, text commands to the session.
  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      incoming = stream.next() => match incoming {
        Some(Ok(WsMessage::Text(text))) => {
          handle_command(text.as_str(), &session, &sink, &token).await;
        }
        Some(Ok(WsMessage::Binary(bytes))) => {
          if session.updating() {
            debug!("Dropping client binary during firmware update");
          } else {
            broker.try_publish(Payload::Frame(bytes.to_vec()), TOPIC_TX);
          }
        }
        Some(Ok(WsMessage::Close(_))) | None => break,
        Some(Ok(_)) => {}
        Some(Err(err)) => {
          debug!("WebSocket receive error, closing: {}", err);
          break;
        }
      },
    }
  }

  token.cancel();
  let _ = writer.await;
  session.deregister_subscriber();
}

async fn handle_command(
  text: &str,
  session: &Arc<dyn DeviceSession>,
  sink: &SharedSink,
  token: &CancellationToken,
) {
  let command = match serde_json::from_str::<Command>(text) {
    Ok(command) => command,
    Err(err) => {
      warn!("Ignoring unparseable command {:?}: {}", text, err);
      return;
    }
  };
  if session.updating()
    && !matches!(command, Command::GetStatus | Command::Discover { .. })
  {
    debug!("Ignoring command during firmware update");
    return;
  }
  match command {
    Command::GetStatus => {
      let status = session.status().await;
      if send_json(sink, &Message::Status(status)).await.is_err() {
        token.cancel();
      }
    }
    Command::Connect { address } => {
      if let Err(err) = session.connect(&address).await {
        warn!("Connect to {} failed: {}", address, err);
      }
    }
    Command::Disconnect => session.disconnect().await,
    Command::Discover { duration } => {
      let mut discovered = session.discover(Duration::from_secs(duration));
      let sink = sink.clone();
      let token = token.clone();
      tokio::spawn(async move {
        while let Some(message) = discovered.recv().await {
          if send_json(&sink, &message).await.is_err() {
            token.cancel();
            return;
          }
        }
      });
    }
    Command::UpdateFirmware {
      serial_number,
      image,
    } => {
      let session = session.clone();
      tokio::spawn(async move {
        session.update_firmware(&serial_number, &image).await;
      });
    }
  }
}

async fn rfid_socket(socket: WebSocket, session: Arc<RfidSession>) {
  let Ok(mut identifications) = session.broker().subscribe(TOPIC_RFID) else {
    return;
  };
  let (sink, mut stream) = socket.split();
  let sink: SharedSink = Arc::new(Mutex::new(sink));
  loop {
    tokio::select! {
      message = identifications.recv() => match message {
        Some(message) => {
          if send_json(&sink, &message).await.is_err() {
            break;
          }
        }
        None => break,
      },
      incoming = stream.next() => match incoming {
        // Clients have nothing to say on this endpoint.
        Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
        Some(Ok(_)) => {}
      },
    }
  }
  session.broker().unsubscribe(identifications);
}
