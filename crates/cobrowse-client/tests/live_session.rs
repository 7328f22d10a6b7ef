//! End-to-end tests: `SessionClient` against a real WebSocket server and an
//! HTTP backend double.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cobrowse_client::{ClientError, RegistryEvent, SessionClient};
use cobrowse_core::errors::TransitionError;
use cobrowse_core::ids::SessionId;
use cobrowse_core::session::{ConnectionState, ControlOwner};
use cobrowse_settings::CobrowseSettings;

const WAIT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<TcpStream>;

/// Accepted connection plus the request path it was opened on.
struct Accepted {
    path: String,
    socket: Socket,
}

/// Start a WebSocket server on an ephemeral port. Returns its base URL and
/// a stream of accepted connections.
async fn ws_server() -> (String, mpsc::UnboundedReceiver<Accepted>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    let _ = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let _ = tokio::spawn(async move {
                let (path_tx, path_rx) = oneshot::channel();
                let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    let _ = path_tx.send(req.uri().path().to_owned());
                    Ok(resp)
                };
                let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                let path = path_rx.await.unwrap_or_default();
                let _ = tx.send(Accepted { path, socket });
            });
        }
    });

    (format!("ws://{addr}/ws"), rx)
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("no frame from client")
            .expect("client hung up")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn push(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn backend_creating(session_id: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": session_id,
            "browser_url": format!("https://live.test/{session_id}")
        })))
        .mount(&server)
        .await;
    server
}

fn settings(ws_url: &str, api_url: &str, transition_timeout_ms: u64) -> CobrowseSettings {
    let mut settings = CobrowseSettings::default();
    settings.connection.ws_url = ws_url.to_owned();
    settings.connection.reconnect_base_delay_ms = 50;
    settings.connection.reconnect_max_delay_ms = 200;
    settings.connection.max_reconnect_attempts = 5;
    settings.connection.connect_timeout_ms = 2_000;
    settings.handoff.transition_timeout_ms = transition_timeout_ms;
    settings.backend.api_url = api_url.to_owned();
    settings
}

#[tokio::test]
async fn human_takes_control_when_backend_acknowledges() {
    let backend = backend_creating("s1").await;
    let (ws_url, mut accepted) = ws_server().await;
    let client = Arc::new(
        SessionClient::from_settings(settings(&ws_url, &backend.uri(), 10_000)).unwrap(),
    );

    let id = client.start_task("buy socks", None).await.unwrap().session_id;
    assert_eq!(
        client.registry().get(&id).unwrap().control_owner,
        ControlOwner::Agent
    );
    client.connect(Some(&id)).await.unwrap();
    let Accepted { path, mut socket } = accepted.recv().await.unwrap();
    assert_eq!(path, "/ws/s1");

    let handoff = {
        let client = Arc::clone(&client);
        let id = id.clone();
        tokio::spawn(async move { client.take_control(&id, Some("taking over".into())).await })
    };

    let toggle = next_json(&mut socket).await;
    assert_eq!(toggle["type"], "control_toggle");
    assert_eq!(toggle["session_id"], "s1");
    assert_eq!(toggle["human_control"], true);
    assert_eq!(toggle["additional_prompt"], "taking over");
    assert!(client.registry().get(&id).unwrap().in_transition());

    push(
        &mut socket,
        json!({
            "type": "control_change",
            "session_id": "s1",
            "human_control": true,
            "request_id": toggle["request_id"]
        }),
    )
    .await;

    let owner = timeout(WAIT, handoff).await.unwrap().unwrap().unwrap();
    assert_eq!(owner, ControlOwner::Human);
    let session = client.registry().get(&id).unwrap();
    assert_eq!(session.control_owner, ControlOwner::Human);
    assert!(!session.in_transition());

    client.shutdown().await;
    let close = timeout(WAIT, socket.next()).await.unwrap();
    assert_matches!(close, Some(Ok(Message::Close(_))));
}

#[tokio::test]
async fn unacknowledged_handoff_reverts_to_agent() {
    let backend = backend_creating("s1").await;
    let (ws_url, mut accepted) = ws_server().await;
    let client = Arc::new(
        SessionClient::from_settings(settings(&ws_url, &backend.uri(), 300)).unwrap(),
    );
    let mut events = client.registry().subscribe();

    let id = client.start_task("buy socks", None).await.unwrap().session_id;
    let handoff = {
        let client = Arc::clone(&client);
        let id = id.clone();
        tokio::spawn(async move { client.take_control(&id, None).await })
    };

    // The request itself opens the channel
    let Accepted { mut socket, .. } = accepted.recv().await.unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "control_toggle");

    let result = timeout(WAIT, handoff).await.unwrap().unwrap();
    assert_matches!(
        result,
        Err(ClientError::Transition(TransitionError::Timeout { timeout_ms: 300, .. }))
    );
    let session = client.registry().get(&id).unwrap();
    assert_eq!(session.control_owner, ControlOwner::Agent);
    assert!(!session.in_transition());

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::TransitionFailed { restored, .. } = event {
            assert_eq!(restored, ControlOwner::Agent);
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn stale_viewport_update_is_discarded() {
    let backend = MockServer::start().await;
    let (ws_url, mut accepted) = ws_server().await;
    let client = SessionClient::from_settings(settings(&ws_url, &backend.uri(), 10_000)).unwrap();
    let mut events = client.registry().subscribe();

    client.connect(None).await.unwrap();
    let _ = client
        .subscriptions()
        .subscribe_to_browser_sessions()
        .await
        .unwrap();
    let Accepted { path, mut socket } = accepted.recv().await.unwrap();
    assert_eq!(path, "/ws");
    assert_eq!(next_json(&mut socket).await["type"], "subscribe_sessions");

    for (screenshot, timestamp) in [("T1", 1_700_000_002_000u64), ("T0", 1_700_000_001_000)] {
        push(
            &mut socket,
            json!({
                "type": "viewport_update",
                "session_id": "s1",
                "screenshot": screenshot,
                "current_url": format!("https://shop.test/{screenshot}"),
                "timestamp": timestamp
            }),
        )
        .await;
    }
    push(
        &mut socket,
        json!({"type": "step_start", "session_id": "s1", "step": 1}),
    )
    .await;

    timeout(WAIT, async {
        loop {
            if let RegistryEvent::Step { .. } = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .unwrap();

    let session = client.registry().get(&SessionId::from("s1")).unwrap();
    assert_eq!(session.screenshot.as_deref(), Some("T1"));
    assert_eq!(session.current_url.as_deref(), Some("https://shop.test/T1"));
}

#[tokio::test]
async fn dropped_connection_reconnects_to_same_scope() {
    let backend = MockServer::start().await;
    let (ws_url, mut accepted) = ws_server().await;
    let client = SessionClient::from_settings(settings(&ws_url, &backend.uri(), 10_000)).unwrap();
    let id = SessionId::from("s9");

    client.connect(Some(&id)).await.unwrap();
    assert!(client.subscriptions().subscribe_to_session(&id).await.unwrap());
    let Accepted { mut socket, .. } = accepted.recv().await.unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "subscribe");

    // No close frame: an abnormal drop
    drop(socket);

    let Accepted { path, mut socket } = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    assert_eq!(path, "/ws/s9");
    let mut state = client.connection().watch_state();
    let _ = timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    assert!(!client.subscriptions().is_subscribed(&id));
    assert_eq!(client.subscriptions().resubscribe_lapsed().await.unwrap(), 1);
    let frame = next_json(&mut socket).await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["session_id"], "s9");
    assert_eq!(client.connection().reconnect_attempts(), 0);
}

#[tokio::test]
async fn refused_endpoint_surfaces_connect_error() {
    let backend = MockServer::start().await;
    // Bind then drop to get a port nothing listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = SessionClient::from_settings(settings(
        &format!("ws://127.0.0.1:{port}/ws"),
        &backend.uri(),
        10_000,
    ))
    .unwrap();

    let err = client.connect(None).await.unwrap_err();
    assert_matches!(err, ClientError::Connection(_));
    assert_eq!(client.connection().state(), ConnectionState::Disconnected);
}
