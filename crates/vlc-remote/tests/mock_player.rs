//! End-to-end tests against an in-process fake player.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use vlc_remote::auth::challenge_digest;
use vlc_remote::{
    ClientConfig, InboundMessage, MessageCategory, PlayerEvent, RemoteControlClient, RemoteError,
    RestoreOutcome, SessionFile, SessionRegistry, StoredSession, build_http_client,
};

const CHALLENGE: &str = "c0ffee";
const CODE: &str = "4821";
const SESSION_COOKIE: &str = "sid=s3cret";

#[derive(Default)]
struct MockState {
    tickets: AtomicU32,
    connections: AtomicU32,
    frames: std::sync::Mutex<Vec<Value>>,
}

impl MockState {
    fn frames_named(&self, name: &str) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f["message"] == name)
            .cloned()
            .collect()
    }
}

fn has_session_cookie(headers: &HeaderMap) -> bool {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(SESSION_COOKIE))
}

async fn code() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, format!("{SESSION_COOKIE}; Path=/"))],
        CHALLENGE,
    )
}

async fn verify(Form(form): Form<HashMap<String, String>>) -> StatusCode {
    if form.get("code").map(String::as_str) == Some(challenge_digest(CODE, CHALLENGE).as_str()) {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    }
}

async fn wsticket(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !has_session_cookie(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let n = state.tickets.fetch_add(1, Ordering::SeqCst) + 1;
    format!("ticket-{n}\n").into_response()
}

async fn echo(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> Response {
    if !has_session_cookie(&headers) || headers.get(header::ORIGIN).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.protocols(["player"])
        .on_upgrade(move |socket| player_socket(socket, state))
}

async fn player_socket(mut socket: WebSocket, state: Arc<MockState>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        let name = frame["message"].as_str().unwrap_or_default().to_string();
        state.frames.lock().unwrap().push(frame);

        let reply = match name.as_str() {
            "hello" => r#"{"type":"now-playing","title":"Clip","playing":true,"duration":60000}"#,
            "play" => r#"{"type":"auth","status":"forbidden","initialMessage":"play"}"#,
            "pause" => r#"{"type":"auth","status":"forbidden"}"#,
            "next" => r#"{"type":"sleep-timer","value":1}"#,
            _ => continue,
        };
        if socket.send(WsMessage::Text(reply.into())).await.is_err() {
            break;
        }
    }
}

async fn start_player() -> (String, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/code", post(code))
        .route("/verify-code", post(verify))
        .route("/wsticket", get(wsticket))
        .route("/echo", get(echo))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        reconnect_initial_delay: Duration::from_millis(50),
        reconnect_max_delay: Duration::from_millis(200),
        stable_after: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<PlayerEvent>, mut pred: F) -> PlayerEvent
where
    F: FnMut(&PlayerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for player event")
}

async fn eventually<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn logged_in(url: &str, dir: &TempDir) -> (SessionRegistry, SessionFile) {
    let file = SessionFile::new(dir.path().join("cookie").join("cookie.json"));
    let registry = SessionRegistry::new(
        build_http_client(&fast_config()).unwrap(),
        Some(file.clone()),
    );
    assert_eq!(registry.begin_login(url).await.unwrap(), CHALLENGE);
    registry.complete_login(url, CODE).await.unwrap();
    (registry, file)
}

#[tokio::test]
async fn login_persists_session() {
    let (url, _) = start_player().await;
    let dir = TempDir::new().unwrap();
    let (registry, file) = logged_in(&url, &dir).await;

    let session = registry.get(&url).unwrap();
    assert!(session.is_authenticated());

    let stored = file.load().await.unwrap().unwrap();
    assert_eq!(stored.url, url);
    assert!(stored.authenticated);
    assert_eq!(stored.cookies[0].name, "sid");
    assert_eq!(stored.cookies[0].value, "s3cret");
}

#[tokio::test]
async fn wrong_code_is_rejected() {
    let (url, _) = start_player().await;
    let registry = SessionRegistry::new(build_http_client(&fast_config()).unwrap(), None);
    registry.begin_login(&url).await.unwrap();

    let err = registry.complete_login(&url, "0000").await.unwrap_err();
    assert!(matches!(err, RemoteError::VerificationFailed { status: 403, .. }));
    assert!(!registry.get(&url).unwrap().is_authenticated());
}

#[tokio::test]
async fn hello_then_commands() {
    let (url, state) = start_player().await;
    let dir = TempDir::new().unwrap();
    let (registry, _) = logged_in(&url, &dir).await;

    let client = RemoteControlClient::spawn(
        registry.get(&url).unwrap(),
        fast_config(),
        CancellationToken::new(),
    );
    let mut events = client.subscribe();
    client.wait_connected().await.unwrap();

    let now_playing = wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::Message(InboundMessage::NowPlaying(_)))
    })
    .await;
    if let PlayerEvent::Message(InboundMessage::NowPlaying(np)) = now_playing {
        assert_eq!(np.title, "Clip");
    }

    // A refused command must not drop the connection.
    client.play().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PlayerEvent::Message(m) if m.category() == MessageCategory::CommandForbidden)
    })
    .await;

    // Unknown discriminants surface as diagnostics.
    client.next().await.unwrap();
    let diag = wait_for(&mut events, |e| matches!(e, PlayerEvent::Diagnostic { .. })).await;
    assert!(matches!(diag, PlayerEvent::Diagnostic { kind, .. } if kind == "sleep-timer"));

    assert!(client.is_connected());
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);

    let hello = state.frames_named("hello");
    assert_eq!(hello.len(), 1);
    assert_eq!(hello[0]["authTicket"], "ticket-1");
    assert_eq!(state.frames_named("play")[0]["authTicket"], "ticket-1");

    client.shutdown().await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn forbidden_session_triggers_reconnect() {
    let (url, state) = start_player().await;
    let dir = TempDir::new().unwrap();
    let (registry, _) = logged_in(&url, &dir).await;

    let client = RemoteControlClient::spawn(
        registry.get(&url).unwrap(),
        fast_config(),
        CancellationToken::new(),
    );
    let mut events = client.subscribe();
    client.wait_connected().await.unwrap();

    client.pause().await.unwrap();
    wait_for(&mut events, |e| matches!(e, PlayerEvent::Disconnected { .. })).await;
    wait_for(&mut events, |e| matches!(e, PlayerEvent::Reconnecting { attempt: 1, .. })).await;
    wait_for(&mut events, |e| matches!(e, PlayerEvent::Connected { .. })).await;

    eventually(|| state.frames_named("hello").len() == 2).await;
    assert_eq!(state.connections.load(Ordering::SeqCst), 2);
    assert!(state.tickets.load(Ordering::SeqCst) >= 2);

    client.shutdown().await;
}

#[tokio::test]
async fn repeated_session_refusals_back_off() {
    let (url, _) = start_player().await;
    let dir = TempDir::new().unwrap();
    let (registry, _) = logged_in(&url, &dir).await;

    let client = RemoteControlClient::spawn(
        registry.get(&url).unwrap(),
        fast_config(),
        CancellationToken::new(),
    );
    let mut events = client.subscribe();

    let mut delays = Vec::new();
    for _ in 0..4 {
        wait_for(&mut events, |e| matches!(e, PlayerEvent::Connected { .. })).await;
        client.pause().await.unwrap();
        match wait_for(&mut events, |e| matches!(e, PlayerEvent::Reconnecting { .. })).await {
            PlayerEvent::Reconnecting { attempt, delay, .. } => delays.push((attempt, delay)),
            other => panic!("unexpected {other:?}"),
        }
    }

    let ms = Duration::from_millis;
    assert_eq!(
        delays,
        vec![(1, ms(50)), (2, ms(100)), (3, ms(200)), (4, ms(200))]
    );
    client.shutdown().await;
}

#[tokio::test]
async fn ticket_is_renewed_on_cadence() {
    let (url, state) = start_player().await;
    let dir = TempDir::new().unwrap();
    let (registry, _) = logged_in(&url, &dir).await;

    let config = ClientConfig {
        ticket_renew_after: Duration::from_millis(150),
        ticket_expiry: Duration::from_millis(300),
        ..fast_config()
    };
    let client = RemoteControlClient::spawn(registry.get(&url).unwrap(), config, CancellationToken::new());
    client.wait_connected().await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(state.tickets.load(Ordering::SeqCst) >= 3);
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);

    // The command goes out with the most recent ticket.
    client.play().await.unwrap();
    eventually(|| !state.frames_named("play").is_empty()).await;
    let sent = state.frames_named("play");
    let issued = state.tickets.load(Ordering::SeqCst);
    let ticket = sent[0]["authTicket"].as_str().unwrap();
    let n: u32 = ticket.trim_start_matches("ticket-").parse().unwrap();
    assert!(n + 1 >= issued, "stale ticket {ticket} with {issued} issued");

    client.shutdown().await;
}

#[tokio::test]
async fn unauthenticated_session_keeps_retrying_until_teardown() {
    let (url, _) = start_player().await;
    let registry = SessionRegistry::new(build_http_client(&fast_config()).unwrap(), None);
    let teardown = CancellationToken::new();
    let client = RemoteControlClient::spawn(
        registry.get_or_create(&url).unwrap(),
        fast_config(),
        teardown.clone(),
    );
    let mut events = client.subscribe();

    wait_for(&mut events, |e| matches!(e, PlayerEvent::Reconnecting { attempt: 3, .. })).await;
    assert!(matches!(client.play().await, Err(RemoteError::NotConnected)));

    teardown.cancel();
    client.shutdown().await;
}

#[tokio::test]
async fn restore_promotes_live_session() {
    let (url, _) = start_player().await;
    let dir = TempDir::new().unwrap();
    let (_, file) = logged_in(&url, &dir).await;

    let registry = SessionRegistry::new(
        build_http_client(&fast_config()).unwrap(),
        Some(file.clone()),
    );
    let outcome = registry.restore().await.unwrap();
    assert_eq!(outcome, RestoreOutcome::Restored { endpoint: url.clone() });
    assert!(registry.get(&url).unwrap().is_authenticated());
}

#[tokio::test]
async fn restore_discards_rejected_session() {
    let (url, _) = start_player().await;
    let dir = TempDir::new().unwrap();
    let file = SessionFile::new(dir.path().join("cookie.json"));
    file.save(&StoredSession {
        url: url.clone(),
        authenticated: true,
        last_activity: "2026-01-01T00:00:00Z".to_string(),
        cookies: vec![],
    })
    .await
    .unwrap();

    let registry = SessionRegistry::new(
        build_http_client(&fast_config()).unwrap(),
        Some(file.clone()),
    );
    let outcome = registry.restore().await.unwrap();

    assert_eq!(outcome, RestoreOutcome::Rejected { endpoint: url.clone() });
    assert!(registry.get(&url).is_none());
    assert!(file.load().await.unwrap().is_none());
}

#[tokio::test]
async fn restore_keeps_file_when_player_unreachable() {
    let dir = TempDir::new().unwrap();
    let file = SessionFile::new(dir.path().join("cookie.json"));
    file.save(&StoredSession {
        url: "http://127.0.0.1:9".to_string(),
        authenticated: true,
        last_activity: "2026-01-01T00:00:00Z".to_string(),
        cookies: vec![],
    })
    .await
    .unwrap();

    let registry = SessionRegistry::new(
        build_http_client(&fast_config()).unwrap(),
        Some(file.clone()),
    );
    let outcome = registry.restore().await.unwrap();

    assert!(matches!(outcome, RestoreOutcome::Unreachable { .. }));
    assert!(file.load().await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_logins_are_serialized() {
    let (url, _) = start_player().await;
    let registry = Arc::new(SessionRegistry::new(
        build_http_client(&fast_config()).unwrap(),
        None,
    ));
    registry.begin_login(&url).await.unwrap();

    let a = {
        let registry = registry.clone();
        let url = url.clone();
        tokio::spawn(async move { registry.complete_login(&url, CODE).await.map(|_| ()) })
    };
    let b = {
        let registry = registry.clone();
        let url = url.clone();
        tokio::spawn(async move { registry.complete_login(&url, CODE).await.map(|_| ()) })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    // The first verification consumes the challenge; the second sees none.
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(RemoteError::MissingChallenge(_))))
    );
}
