//! End-to-end tests of the gateway over real sockets: WebSocket command
//! round-trips, broadcast fan-out and the plain HTTP surface. No hardware is
//! involved; device reports come from mock registrations.

use dividat_driver_engine::{DriverMetadata, GatewayState, router};
use dividat_driver_core::message::PortDetails;
use dividat_driver_server::{
  enumerator::{Enumerator, MockDeviceRegistry},
  flex::FlexSession,
  rfid::RfidSession,
  senso::SensoSession,
};
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpListener, TcpStream},
};
use tokio_tungstenite::{
  MaybeTlsStream, WebSocketStream, connect_async,
  tungstenite::{Message as WsMessage, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Gateway {
  addr: SocketAddr,
  state: GatewayState,
  token: CancellationToken,
}

impl Drop for Gateway {
  fn drop(&mut self) {
    self.token.cancel();
  }
}

async fn start_gateway() -> Gateway {
  let token = CancellationToken::new();
  let mocks = Arc::new(MockDeviceRegistry::default());
  let enumerator = Arc::new(Enumerator::new(mocks.clone()));
  let state = GatewayState {
    flex: FlexSession::new(enumerator, token.child_token()),
    senso: SensoSession::new(token.child_token()),
    rfid: RfidSession::new(token.child_token()),
    mocks,
    metadata: DriverMetadata::collect(),
  };
  let app = router(state.clone(), true);
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("Can bind loopback");
  let addr = listener.local_addr().expect("Listener has an address");
  tokio::spawn(async move {
    axum::serve(listener, app.into_make_service())
      .await
      .expect("Gateway serves until the test ends");
  });
  Gateway { addr, state, token }
}

async fn open_ws(addr: SocketAddr, path: &str, subprotocol: Option<&str>) -> WsClient {
  let mut request = format!("ws://{}{}", addr, path)
    .into_client_request()
    .expect("Valid request");
  if let Some(subprotocol) = subprotocol {
    request.headers_mut().insert(
      "Sec-WebSocket-Protocol",
      subprotocol.parse().expect("Valid header value"),
    );
  }
  let (client, response) = connect_async(request).await.expect("Upgrade succeeds");
  if let Some(subprotocol) = subprotocol {
    assert_eq!(
      response
        .headers()
        .get("Sec-WebSocket-Protocol")
        .map(|value| value.to_str().expect("ASCII header")),
      Some(subprotocol)
    );
  }
  client
}

async fn next_json(client: &mut WsClient) -> serde_json::Value {
  loop {
    let message = tokio::time::timeout(Duration::from_secs(5), client.next())
      .await
      .expect("Server answers in time")
      .expect("Connection is open")
      .expect("Frame is well-formed");
    match message {
      WsMessage::Text(text) => {
        return serde_json::from_str(text.as_str()).expect("Server sends valid JSON");
      }
      WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
      other => panic!("Expected a text frame, got {:?}", other),
    }
  }
}

async fn send_text(client: &mut WsClient, text: &str) {
  client
    .send(WsMessage::text(text))
    .await
    .expect("Client write succeeds");
}

fn mock_details(serial: &str, vendor: &str, manufacturer: &str, path: &str) -> PortDetails {
  PortDetails::new(vendor, "0486", "0277", serial, manufacturer, "", path)
}

#[tokio::test]
async fn test_get_status_reports_disconnected() {
  let gateway = start_gateway().await;
  let mut client = open_ws(gateway.addr, "/flex", Some("manual-connect")).await;
  send_text(&mut client, "{\"type\":\"GetStatus\"}").await;
  let status = next_json(&mut client).await;
  assert_eq!(status["type"], "Status");
  assert_eq!(status["address"], serde_json::Value::Null);
  assert_eq!(status["device"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_unknown_command_does_not_close_connection() {
  let gateway = start_gateway().await;
  let mut client = open_ws(gateway.addr, "/flex", Some("manual-connect")).await;
  send_text(&mut client, "{\"type\":\"Reboot\"}").await;
  send_text(&mut client, "not json at all").await;
  send_text(&mut client, "{\"type\":\"GetStatus\"}").await;
  let status = next_json(&mut client).await;
  assert_eq!(status["type"], "Status");
}

#[tokio::test]
async fn test_discover_reports_matching_mocks_only() {
  let gateway = start_gateway().await;
  gateway
    .state
    .mocks
    .register(mock_details("1", "16C0", "Teensyduino", "/tmp/vtty_gw_0"));
  gateway
    .state
    .mocks
    .register(mock_details("2", "16C0", "Sensitronics", "/tmp/vtty_gw_1"));
  gateway
    .state
    .mocks
    .register(mock_details("3", "14F2", "Teensyduino", "/tmp/vtty_gw_2"));

  let mut client = open_ws(gateway.addr, "/flex", Some("manual-connect")).await;
  send_text(&mut client, "{\"type\":\"Discover\",\"duration\":5}").await;
  let first = next_json(&mut client).await;
  let second = next_json(&mut client).await;
  for message in [&first, &second] {
    assert_eq!(message["type"], "Discovered");
    assert_eq!(message["device"]["deviceType"], "flex");
  }
  let serials: Vec<_> = [&first, &second]
    .iter()
    .map(|message| message["device"]["usbDevice"]["serialNumber"].clone())
    .collect();
  assert_eq!(serials, vec!["1", "2"]);
  // Exactly two; nothing else shows up.
  let extra = tokio::time::timeout(Duration::from_millis(300), client.next()).await;
  assert!(extra.is_err(), "Expected no further discovery messages");
}

#[tokio::test]
async fn test_firmware_failure_broadcasts_to_all_subscribers() {
  let gateway = start_gateway().await;
  let mut first = open_ws(gateway.addr, "/senso", None).await;
  let mut second = open_ws(gateway.addr, "/senso", None).await;
  // Let both writer tasks attach to the broadcast topic.
  tokio::time::sleep(Duration::from_millis(200)).await;

  send_text(
    &mut first,
    "{\"type\":\"UpdateFirmware\",\"serialNumber\":\"2000-1\",\"image\":\"%%%\"}",
  )
  .await;

  for client in [&mut first, &mut second] {
    let progress = next_json(client).await;
    assert_eq!(progress["type"], "Broadcast");
    assert_eq!(progress["message"]["type"], "FirmwareUpdateProgress");
    let failure = next_json(client).await;
    assert_eq!(failure["type"], "Broadcast");
    assert_eq!(failure["message"]["type"], "FirmwareUpdateFailure");
  }
}

#[tokio::test]
async fn test_rfid_identifications_reach_clients() {
  let gateway = start_gateway().await;
  let mut client = open_ws(gateway.addr, "/rfid", None).await;
  tokio::time::sleep(Duration::from_millis(200)).await;
  gateway.state.rfid.identified("0123456789");
  let message = next_json(&mut client).await;
  assert_eq!(message["type"], "Identified");
  assert_eq!(message["token"], "0123456789");
}

async fn http_request(addr: SocketAddr, request: &str) -> String {
  let mut stream = TcpStream::connect(addr).await.expect("Gateway is reachable");
  stream
    .write_all(request.as_bytes())
    .await
    .expect("Request write succeeds");
  let mut response = String::new();
  stream
    .read_to_string(&mut response)
    .await
    .expect("Response read succeeds");
  response
}

#[tokio::test]
async fn test_metadata_route() {
  let gateway = start_gateway().await;
  let response = http_request(
    gateway.addr,
    "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"));
  assert!(response.contains("Dividat Driver"));
  assert!(response.contains("machineId"));
}

#[tokio::test]
async fn test_rfid_readers_route() {
  let gateway = start_gateway().await;
  let response = http_request(
    gateway.addr,
    "GET /rfid/readers HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"));
  assert!(response.contains("\"readers\":[]"));
}

#[tokio::test]
async fn test_mock_registration_routes() {
  let gateway = start_gateway().await;
  let body = serde_json::to_string(&mock_details("9", "16C0", "Teensyduino", "/tmp/vtty_gw_9"))
    .expect("Infallible serialization");
  let request = format!(
    "POST /flex/mock/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
    body.len(),
    body
  );
  let response = http_request(gateway.addr, &request).await;
  assert!(response.starts_with("HTTP/1.1 200"));
  assert!(response.contains("\"id\":0"));
  assert_eq!(gateway.state.mocks.devices().len(), 1);

  let response = http_request(
    gateway.addr,
    "DELETE /flex/mock/0 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 204"));
  assert!(gateway.state.mocks.devices().is_empty());
}
