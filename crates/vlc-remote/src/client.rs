//! Persistent duplex control session with a player.
//!
//! A [`RemoteControlClient`] owns one supervisor task per endpoint. The task
//! fetches a ticket, opens `/echo`, sends the hello frame, then multiplexes
//! inbound frames, scheduled ticket renewal and teardown. Any failure drops
//! the connection and the supervisor retries with a doubling delay until the
//! client is shut down.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::error::{RemoteError, Result};
use crate::events::PlayerEvent;
use crate::protocol::{Command, InboundMessage, MessageCategory, OutboundMessage};
use crate::session::RemoteSession;
use crate::ticket::{TicketKeeper, TicketPolicy};

const EVENT_CAPACITY: usize = 256;

/// Sub-protocol the player expects during the upgrade.
const PLAYER_SUBPROTOCOL: &str = "player";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Build the upgrade request for the player's `/echo` endpoint.
pub fn websocket_request(session: &RemoteSession) -> Result<Request<()>> {
    let mut url = session.url().clone();
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| RemoteError::InvalidUrl(format!("cannot use {scheme} for {url}")))?;
    url.set_path("/echo");
    url.set_query(None);

    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(ORIGIN, header_value(session.endpoint())?);
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(PLAYER_SUBPROTOCOL),
    );
    if let Some(cookies) = session.cookie_header() {
        headers.insert(COOKIE, header_value(&cookies)?);
    }
    Ok(request)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| RemoteError::InvalidHeader(e.to_string()))
}

/// Write half plus the ticket that authorizes it.
///
/// Both sit behind one mutex so a command can never be written while the
/// ticket is being renewed.
struct Connection {
    sink: WsSink,
    tickets: TicketKeeper<Arc<RemoteSession>>,
    lost: CancellationToken,
}

struct ClientInner {
    session: Arc<RemoteSession>,
    config: ClientConfig,
    conn: Mutex<Option<Connection>>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<PlayerEvent>,
    teardown: CancellationToken,
}

pub struct RemoteControlClient {
    inner: Arc<ClientInner>,
    tracker: TaskTracker,
}

impl RemoteControlClient {
    /// Start the supervisor for `session`.
    ///
    /// `teardown` is endpoint-scoped: cancelling it stops reconnection for
    /// good and closes the connection.
    pub fn spawn(
        session: Arc<RemoteSession>,
        config: ClientConfig,
        teardown: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (connected, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            session,
            config,
            conn: Mutex::new(None),
            connected,
            events,
            teardown,
        });

        let tracker = TaskTracker::new();
        tracker.spawn(supervise(inner.clone()));
        tracker.close();

        Self { inner, tracker }
    }

    pub fn endpoint(&self) -> &str {
        self.inner.session.endpoint()
    }

    pub fn session(&self) -> &Arc<RemoteSession> {
        &self.inner.session
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the duplex session is up.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.inner.connected.subscribe();
        tokio::select! {
            _ = self.inner.teardown.cancelled() => Err(RemoteError::TornDown),
            res = rx.wait_for(|connected| *connected) => {
                res.map(|_| ()).map_err(|_| RemoteError::TornDown)
            }
        }
    }

    /// Send a control command.
    ///
    /// Fails immediately with [`RemoteError::NotConnected`] when there is no
    /// live session; waits if a ticket renewal is in flight.
    pub async fn send(&self, command: Command) -> Result<()> {
        if self.inner.teardown.is_cancelled() {
            return Err(RemoteError::TornDown);
        }
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }

        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or(RemoteError::NotConnected)?;
        let ticket = conn.tickets.ensure_fresh().await?.value().to_string();
        let frame = OutboundMessage::command(command.encode(), &ticket).to_json()?;

        debug!(endpoint = %self.endpoint(), command = %command, "Sending player command");
        if let Err(e) = conn.sink.send(Message::text(frame)).await {
            error!(endpoint = %self.endpoint(), command = %command, "Failed to send command: {}", e);
            conn.lost.cancel();
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn play(&self) -> Result<()> {
        self.send(Command::Play).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn seek_to(&self, position_ms: i64) -> Result<()> {
        self.send(Command::SeekTo { position_ms }).await
    }

    pub async fn set_volume(&self, volume: u8) -> Result<()> {
        self.send(Command::SetVolume(volume)).await
    }

    pub async fn next(&self) -> Result<()> {
        self.send(Command::Next).await
    }

    pub async fn previous(&self) -> Result<()> {
        self.send(Command::Previous).await
    }

    /// Stop reconnecting, close the connection and wait for the supervisor.
    pub async fn shutdown(&self) {
        self.inner.teardown.cancel();
        self.tracker.wait().await;
    }
}

impl ClientInner {
    fn endpoint(&self) -> &str {
        self.session.endpoint()
    }

    fn emit(&self, event: PlayerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn policy(&self) -> TicketPolicy {
        TicketPolicy {
            renew_after: self.config.ticket_renew_after,
            expires_after: self.config.ticket_expiry,
        }
    }

    /// Probe + ticket + upgrade + hello.
    async fn establish(&self) -> Result<(WsSource, CancellationToken)> {
        if !self.session.is_authenticated() {
            return Err(RemoteError::NotAuthenticated);
        }

        let mut tickets = TicketKeeper::new(self.session.clone(), self.policy());
        let ticket = tickets.renew().await?.value().to_string();

        let request = websocket_request(&self.session)?;
        info!(endpoint = %self.endpoint(), url = %request.uri(), "Connecting to player");
        let connect = tokio::time::timeout(
            self.config.request_timeout,
            tokio_tungstenite::connect_async(request),
        );
        let (ws, _) = tokio::select! {
            _ = self.teardown.cancelled() => return Err(RemoteError::TornDown),
            res = connect => res.map_err(|_| RemoteError::Timeout("player handshake".to_string()))??,
        };

        let (mut sink, stream) = ws.split();
        sink.send(Message::text(OutboundMessage::hello(&ticket).to_json()?))
            .await?;

        let lost = self.teardown.child_token();
        *self.conn.lock().await = Some(Connection {
            sink,
            tickets,
            lost: lost.clone(),
        });
        self.connected.send_replace(true);
        Ok((stream, lost))
    }

    async fn next_renewal(&self) -> Option<Instant> {
        self.conn
            .lock()
            .await
            .as_ref()
            .and_then(|c| c.tickets.next_renewal())
    }

    async fn renew_ticket(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(RemoteError::NotConnected)?;
        conn.tickets.renew().await?;
        debug!(endpoint = %self.endpoint(), "Scheduled ticket renewal done");
        Ok(())
    }

    async fn drop_connection(&self) {
        self.connected.send_replace(false);
        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            let _ = conn.sink.close().await;
        }
    }

    /// Drive one established connection until it has to be dropped.
    async fn run(&self, mut stream: WsSource, lost: CancellationToken) -> String {
        loop {
            let renew_at = self.next_renewal().await;
            let renewal = async {
                match renew_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.teardown.cancelled() => return "client shut down".to_string(),
                _ = lost.cancelled() => return "write failed".to_string(),
                _ = renewal => {
                    if let Err(e) = self.renew_ticket().await {
                        if e.requires_relogin() {
                            self.emit(PlayerEvent::SessionExpired {
                                endpoint: self.endpoint().to_string(),
                            });
                        }
                        return format!("ticket renewal failed: {e}");
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.dispatch(text.as_str()) {
                            return "player refused the session".to_string();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                        return format!("closed by player: {reason}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return format!("read failed: {e}"),
                    None => return "stream ended".to_string(),
                },
            }
        }
    }

    /// Route one text frame. Returns true when the connection must be rebuilt.
    fn dispatch(&self, text: &str) -> bool {
        let msg = match InboundMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(endpoint = %self.endpoint(), "Failed to decode player message: {}", e);
                self.emit(PlayerEvent::Diagnostic {
                    kind: "invalid".to_string(),
                    detail: text.to_string(),
                });
                return false;
            }
        };

        match msg.category() {
            MessageCategory::Diagnostic => {
                warn!(endpoint = %self.endpoint(), kind = %msg.kind(), "Unhandled player message");
                self.emit(PlayerEvent::Diagnostic {
                    kind: msg.kind().to_string(),
                    detail: text.to_string(),
                });
                return false;
            }
            MessageCategory::CommandForbidden => {
                debug!(endpoint = %self.endpoint(), "Player refused a command, likely nothing is playing");
            }
            MessageCategory::SessionForbidden => {
                warn!(endpoint = %self.endpoint(), "Player refused the session");
            }
            MessageCategory::LoginRequired => {
                warn!(endpoint = %self.endpoint(), "Player asks for login");
            }
            category => {
                trace!(endpoint = %self.endpoint(), ?category, kind = %msg.kind(), "Player message");
            }
        }

        let reconnect = msg.requires_reconnect();
        self.emit(PlayerEvent::Message(msg));
        reconnect
    }
}

async fn supervise(inner: Arc<ClientInner>) {
    let endpoint = inner.endpoint().to_string();
    let mut backoff = Backoff::new(
        inner.config.reconnect_initial_delay,
        inner.config.reconnect_max_delay,
    );

    loop {
        if inner.teardown.is_cancelled() {
            break;
        }

        match inner.establish().await {
            Ok((stream, lost)) => {
                let connected_at = Instant::now();
                info!(endpoint = %endpoint, "Player session established");
                inner.emit(PlayerEvent::Connected {
                    endpoint: endpoint.clone(),
                });

                let reason = inner.run(stream, lost).await;
                inner.drop_connection().await;
                // A player that accepts the hello and then drops or refuses
                // the session keeps the delay growing.
                if connected_at.elapsed() >= inner.config.stable_after {
                    backoff.reset();
                }
                info!(endpoint = %endpoint, reason = %reason, "Player session closed");
                inner.emit(PlayerEvent::Disconnected {
                    endpoint: endpoint.clone(),
                    reason,
                });
            }
            Err(RemoteError::TornDown) => break,
            Err(e) => {
                if e.requires_relogin() {
                    inner.emit(PlayerEvent::SessionExpired {
                        endpoint: endpoint.clone(),
                    });
                }
                warn!(endpoint = %endpoint, error = %e, "Failed to connect to player");
            }
        }

        if inner.teardown.is_cancelled() {
            break;
        }

        let delay = backoff.next_delay();
        debug!(endpoint = %endpoint, attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "Reconnecting to player");
        inner.emit(PlayerEvent::Reconnecting {
            endpoint: endpoint.clone(),
            attempt: backoff.attempt(),
            delay,
        });

        tokio::select! {
            _ = inner.teardown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.drop_connection().await;
    debug!(endpoint = %endpoint, "Player supervisor stopped");
}
