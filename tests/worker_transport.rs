//! Realtime transport of a running worker: auth gate, per-viewer isolation,
//! and the HTTP/HTTPS listener.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use byoc::api::MAX_REALTIME_CONNECTIONS;
use byoc::bus::LocalBus;
use byoc::worker::{self, RunningWorker};
use common::{FakeConnector, FakeRemote};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_worker() -> (RunningWorker, FakeConnector) {
    let connector = FakeConnector::new(FakeRemote::new());
    connector.remote.set_display(common::spawn_display_server().await);
    let running = worker::start(
        common::worker_config("S1", "U1"),
        Arc::new(LocalBus::new()),
        &connector,
    )
    .await
    .unwrap();
    (running, connector)
}

async fn connect(
    addr: SocketAddr,
    session_id: &str,
    token: Option<String>,
) -> Result<Viewer, tungstenite::Error> {
    let mut request = format!("ws://{addr}/ws?sessionId={session_id}")
        .into_client_request()
        .unwrap();
    if let Some(token) = token {
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {token}").parse().unwrap(),
        );
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

fn rejected_status(result: Result<Viewer, tungstenite::Error>) -> u16 {
    match result {
        Err(tungstenite::Error::Http(resp)) => resp.status().as_u16(),
        Err(e) => panic!("expected an HTTP rejection, got {e}"),
        Ok(_) => panic!("upgrade should have been rejected"),
    }
}

async fn next_binary(ws: &mut Viewer) -> Vec<u8> {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame should arrive")
            .expect("stream should stay open")
            .expect("frame should be valid");
        match msg {
            Message::Binary(data) => return data.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

// ── auth ──────────────────────────────────────────────────────────

#[tokio::test]
async fn upgrade_without_token_is_401() {
    let (running, _connector) = start_worker().await;
    let status = rejected_status(connect(running.addr(), "S1", None).await);
    assert_eq!(status, 401);
    running.shutdown().await;
}

#[tokio::test]
async fn upgrade_for_other_user_is_403() {
    let (running, connector) = start_worker().await;
    let status = rejected_status(
        connect(running.addr(), "S1", Some(common::token_for("U2"))).await,
    );
    assert_eq!(status, 403);
    // Rejected before a forward was ever opened.
    assert!(!connector.remote.calls().iter().any(|c| c.starts_with("forward")));
    running.shutdown().await;
}

#[tokio::test]
async fn upgrade_for_other_session_is_403() {
    let (running, _connector) = start_worker().await;
    let status = rejected_status(
        connect(running.addr(), "S2", Some(common::token_for("U1"))).await,
    );
    assert_eq!(status, 403);
    running.shutdown().await;
}

#[tokio::test]
async fn query_token_is_accepted() {
    let (running, _connector) = start_worker().await;
    let url = format!(
        "ws://{}/ws?sessionId=S1&token={}",
        running.addr(),
        common::token_for("U1")
    );
    let (mut ws, _) = connect_async(url).await.unwrap();
    assert_eq!(next_binary(&mut ws).await, common::BANNER);
    drop(ws);
    running.shutdown().await;
}

// ── relay ─────────────────────────────────────────────────────────

#[tokio::test]
async fn viewer_input_reaches_display() {
    let (running, _connector) = start_worker().await;
    let mut ws = connect(running.addr(), "S1", Some(common::token_for("U1")))
        .await
        .unwrap();
    assert_eq!(next_binary(&mut ws).await, common::BANNER);

    ws.send(Message::Binary(b"key-event".to_vec().into()))
        .await
        .unwrap();
    assert_eq!(next_binary(&mut ws).await, b"key-event");

    drop(ws);
    running.shutdown().await;
}

#[tokio::test]
async fn closing_one_viewer_leaves_others_untouched() {
    let (running, connector) = start_worker().await;
    let addr = running.addr();
    let token = common::token_for("U1");

    let mut first = connect(addr, "S1", Some(token.clone())).await.unwrap();
    let mut second = connect(addr, "S1", Some(token.clone())).await.unwrap();
    assert_eq!(next_binary(&mut first).await, common::BANNER);
    assert_eq!(next_binary(&mut second).await, common::BANNER);
    assert_eq!(connector.remote.open_forwards(), 2);

    first.close(None).await.unwrap();
    drop(first);
    assert!(
        common::eventually(Duration::from_secs(5), || connector.remote.open_forwards() == 1)
            .await,
        "closed viewer should release its forward"
    );

    // The surviving viewer still relays in both directions.
    second
        .send(Message::Binary(b"still here".to_vec().into()))
        .await
        .unwrap();
    assert_eq!(next_binary(&mut second).await, b"still here");

    // A fresh viewer gets its own forward.
    let mut third = connect(addr, "S1", Some(token)).await.unwrap();
    assert_eq!(next_binary(&mut third).await, common::BANNER);
    assert_eq!(connector.remote.open_forwards(), 2);

    // None of this touched the SSH connection itself.
    assert!(!connector.remote.calls().iter().any(|c| c.starts_with("close")));

    drop(second);
    drop(third);
    running.shutdown().await;
}

#[tokio::test]
async fn concurrent_upgrades_stop_at_connection_cap() {
    let (running, _connector) = start_worker().await;
    let addr = running.addr();
    let token = common::token_for("U1");

    let attempts =
        (0..MAX_REALTIME_CONNECTIONS + 8).map(|_| connect(addr, "S1", Some(token.clone())));
    let results = futures::future::join_all(attempts).await;

    let mut open = Vec::new();
    let mut refused = 0;
    for result in results {
        match result {
            Ok(ws) => open.push(ws),
            Err(tungstenite::Error::Http(resp)) => {
                assert_eq!(resp.status().as_u16(), 503);
                refused += 1;
            }
            Err(e) => panic!("unexpected upgrade error: {e}"),
        }
    }
    assert_eq!(open.len(), MAX_REALTIME_CONNECTIONS);
    assert_eq!(refused, 8);

    // Closing one viewer frees exactly one slot.
    let mut first = open.remove(0);
    first.close(None).await.unwrap();
    drop(first);
    let mut admitted = None;
    for _ in 0..50 {
        if let Ok(ws) = connect(addr, "S1", Some(token.clone())).await {
            admitted = Some(ws);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let mut replacement = admitted.expect("freed slot should admit a viewer");
    assert_eq!(next_binary(&mut replacement).await, common::BANNER);
    assert_eq!(rejected_status(connect(addr, "S1", Some(token)).await), 503);

    drop(open);
    drop(replacement);
    running.shutdown().await;
}

// ── listener ──────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_session_over_http() {
    let (running, _connector) = start_worker().await;
    let resp = reqwest::get(format!("http://{}/health", running.addr()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["sessionId"], "S1");
    running.shutdown().await;
}

#[tokio::test]
async fn tls_listener_serves_https() {
    let dir = tempfile::tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

    let mut config = common::worker_config("S1", "U1");
    config.tls_cert = Some(cert_path);
    config.tls_key = Some(key_path);
    let connector = FakeConnector::new(FakeRemote::new());
    let running = worker::start(config, Arc::new(LocalBus::new()), &connector)
        .await
        .unwrap();

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let resp = client
        .get(format!("https://127.0.0.1:{}/health", running.addr().port()))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Plain HTTP against the TLS port does not get a response.
    let plain = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/health", running.addr().port()))
        .timeout(Duration::from_secs(2))
        .send()
        .await;
    assert!(plain.is_err());

    running.shutdown().await;
}
