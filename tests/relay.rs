//! End-to-end tests against a real server using WebSocket and HTTP clients.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use relaycast::{AppState, Config, Envelope, EnvelopeType, Hub};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Boot a server on an ephemeral port and return its `host:port`.
async fn boot_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Config {
        listen_addr: addr,
        ..Config::default()
    };
    let state = AppState::new(Hub::spawn(config.hub_capacity), config);
    let _server = tokio::spawn(relaycast::server::serve(
        listener,
        state,
        std::future::pending(),
    ));
    addr.to_string()
}

/// Open a WebSocket posing as `identity` and wait until it is registered.
async fn connect_as(addr: &str, identity: &str) -> (WsStream, String) {
    let mut request = format!("ws://{addr}/connect").into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("X-Real-Ip", identity.parse().unwrap());
    let (ws, response) = timeout(TIMEOUT, tokio_tungstenite::connect_async(request))
        .await
        .expect("connect timed out")
        .unwrap();
    let cookie = response
        .headers()
        .get("set-cookie")
        .map(|v| v.to_str().unwrap().to_owned())
        .unwrap_or_default();

    wait_for(addr, |channels| channels.iter().any(|c| c == identity)).await;
    (ws, cookie)
}

async fn channels(addr: &str) -> Vec<String> {
    reqwest::get(format!("http://{addr}/channels"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for(addr: &str, condition: impl Fn(&[String]) -> bool) {
    for _ in 0..250 {
        if condition(&channels(addr).await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("channel list never reached the expected state");
}

async fn subscribe(addr: &str, subscriber: Option<&str>, channel: Option<&str>) -> StatusCode {
    let mut url = format!("http://{addr}/subscribe");
    if let Some(channel) = channel {
        url.push_str(&format!("?ip={channel}"));
    }
    let mut request = reqwest::Client::new().get(url);
    if let Some(subscriber) = subscriber {
        request = request.header("Cookie", format!("ws-ip={subscriber}"));
    }
    request.send().await.unwrap().status()
}

async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(Message::Text(text.to_owned().into())).await.unwrap();
}

async fn next_envelope(ws: &mut WsStream) -> Envelope {
    loop {
        let message = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return Envelope::decode(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn connect_sets_identity_cookie() {
    let addr = boot_server().await;
    let (_ws, cookie) = connect_as(&addr, "10.0.0.1").await;
    assert!(cookie.starts_with("ws-ip=10.0.0.1"), "cookie was {cookie:?}");
    assert_eq!(channels(&addr).await, vec!["10.0.0.1"]);
}

#[tokio::test]
async fn lifecycle_events_reach_other_channels() {
    let addr = boot_server().await;
    let (mut a, _) = connect_as(&addr, "10.0.0.1").await;
    let (mut b, _) = connect_as(&addr, "10.0.0.2").await;

    assert_eq!(next_envelope(&mut a).await, Envelope::connect("10.0.0.2"));

    b.close(None).await.unwrap();
    assert_eq!(next_envelope(&mut a).await, Envelope::disconnect("10.0.0.2"));
    wait_for(&addr, |channels| channels.len() == 1 && channels[0] == "10.0.0.1").await;
}

#[tokio::test]
async fn subscriber_receives_relayed_messages() {
    let addr = boot_server().await;
    let (mut a, _) = connect_as(&addr, "10.0.0.1").await;
    let (mut b, _) = connect_as(&addr, "10.0.0.2").await;
    assert_eq!(next_envelope(&mut a).await, Envelope::connect("10.0.0.2"));

    assert_eq!(
        subscribe(&addr, Some("10.0.0.1"), Some("10.0.0.2")).await,
        StatusCode::OK
    );

    send_text(&mut b, "hello\n world ").await;

    let echoed = next_envelope(&mut b).await;
    assert_eq!(echoed.kind, EnvelopeType::Broadcast);
    assert_eq!(echoed.body, "hello  world");

    assert_eq!(next_envelope(&mut a).await, Envelope::broadcast("hello  world"));
}

#[tokio::test]
async fn unsubscribed_channel_only_gets_its_echo() {
    let addr = boot_server().await;
    let (mut a, _) = connect_as(&addr, "10.0.0.1").await;
    let (mut b, _) = connect_as(&addr, "10.0.0.2").await;
    assert_eq!(next_envelope(&mut a).await, Envelope::connect("10.0.0.2"));

    send_text(&mut b, "nobody listens").await;
    assert_eq!(next_envelope(&mut b).await, Envelope::broadcast("nobody listens"));

    // A is not subscribed, so the next thing it sees is B leaving
    b.close(None).await.unwrap();
    assert_eq!(next_envelope(&mut a).await, Envelope::disconnect("10.0.0.2"));
}

#[tokio::test]
async fn subscribe_rejects_bad_requests() {
    let addr = boot_server().await;
    let (_a, _) = connect_as(&addr, "10.0.0.1").await;

    assert_eq!(
        subscribe(&addr, Some("10.0.0.1"), None).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        subscribe(&addr, None, Some("10.0.0.1")).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        subscribe(&addr, Some("10.0.0.1"), Some("10.9.9.9")).await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        subscribe(&addr, Some("10.9.9.9"), Some("10.0.0.1")).await,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn channels_rejects_other_methods() {
    let addr = boot_server().await;
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/channels"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn plain_request_to_connect_is_rejected() {
    let addr = boot_server().await;
    let response = reqwest::get(format!("http://{addr}/connect")).await.unwrap();
    assert!(response.status().is_client_error());
    assert!(channels(&addr).await.is_empty());
}

#[tokio::test]
async fn oversize_frame_drops_the_connection() {
    let addr = boot_server().await;
    let (mut a, _) = connect_as(&addr, "10.0.0.1").await;

    let _ = a.send(Message::Text("x".repeat(600).into())).await;
    wait_for(&addr, |channels| channels.is_empty()).await;
}
