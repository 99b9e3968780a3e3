//! Service facade wiring the stores, queue, worker and player clients.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use vlc_remote::{
    Command, PlayerEvent, RemoteControlClient, RemoteError, RestoreOutcome, SessionRegistry,
};

use crate::broadcast::{Broadcaster, RelayEvent, Subscription};
use crate::config::AppConfig;
use crate::job::{
    CleanupScheduler, JobQueue, JobRequest, JobStatus, QueueRejection, Worker, WorkerContext,
};
use crate::playback::{Playback, PlaybackLauncher};
use crate::store::{CancelOutcome, PlayerSnapshot, SessionStore, SubscriberId};
use crate::tools::{Acquirer, Ffmpeg, Transcoder, YtDlp};
use crate::{Error, Result};

/// External collaborators of the worker.
pub struct ToolSet {
    pub acquirer: Arc<dyn Acquirer>,
    pub transcoder: Arc<dyn Transcoder>,
    pub playback: Arc<dyn Playback>,
}

impl ToolSet {
    /// yt-dlp, ffmpeg and the HTTP playback launcher.
    pub fn system(config: &AppConfig, players: Arc<SessionRegistry>, http: reqwest::Client) -> Self {
        Self {
            acquirer: Arc::new(YtDlp::new(config.ytdlp_path.clone())),
            transcoder: Arc::new(Ffmpeg::new(config.ffmpeg_path.clone())),
            playback: Arc::new(PlaybackLauncher::new(players, http, config.probe)),
        }
    }
}

pub struct RelayService {
    config: Arc<AppConfig>,
    store: Arc<SessionStore>,
    broadcaster: Broadcaster,
    queue: JobQueue,
    worker: Mutex<Option<Worker>>,
    /// Duplex clients keyed by normalized endpoint.
    clients: RwLock<HashMap<String, Arc<RemoteControlClient>>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl RelayService {
    pub fn new(config: AppConfig, players: Arc<SessionRegistry>, tools: ToolSet) -> Self {
        info!("Initializing relay service");
        let config = Arc::new(config);
        let store = Arc::new(SessionStore::new(players));
        let broadcaster = Broadcaster::new(store.clone());
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let cleanup = CleanupScheduler::new(
            store.clone(),
            broadcaster.clone(),
            config.cleanup_grace,
            tasks.clone(),
            shutdown.clone(),
        );
        let (queue, receiver) = JobQueue::new(
            config.queue_capacity,
            store.clone(),
            broadcaster.clone(),
            cleanup.clone(),
        );
        let ctx = Arc::new(WorkerContext {
            config: config.clone(),
            store: store.clone(),
            broadcaster: broadcaster.clone(),
            cleanup,
            acquirer: tools.acquirer,
            transcoder: tools.transcoder,
            playback: tools.playback,
            tasks: tasks.clone(),
            shutdown: shutdown.clone(),
        });

        info!(
            queue_capacity = config.queue_capacity,
            video_dir = %config.video_dir.display(),
            "Relay service initialized"
        );
        Self {
            config,
            store,
            broadcaster,
            queue,
            worker: Mutex::new(Some(Worker::new(ctx, receiver))),
            clients: RwLock::new(HashMap::new()),
            tasks,
            shutdown,
        }
    }

    /// Start the worker. Only the first call has an effect.
    pub fn start(&self) -> bool {
        let Some(worker) = self.worker.lock().take() else {
            warn!("Job worker already started");
            return false;
        };
        self.tasks.spawn(worker.run());
        true
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn enqueue(&self, request: JobRequest) -> std::result::Result<String, QueueRejection> {
        self.queue.enqueue(request)
    }

    pub fn cancel(&self, id: &str) -> CancelOutcome {
        self.queue.cancel(id)
    }

    pub fn retry(&self, id: &str) -> std::result::Result<JobStatus, QueueRejection> {
        self.queue.retry(id)
    }

    pub fn snapshot(&self) -> Vec<JobStatus> {
        self.queue.snapshot()
    }

    pub fn job(&self, id: &str) -> Option<JobStatus> {
        self.store.jobs.get(id)
    }

    pub fn clear_terminal(&self) -> usize {
        self.queue.clear_terminal()
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.broadcaster.unsubscribe(id)
    }

    pub fn player_state(&self) -> PlayerSnapshot {
        self.store.player_state.snapshot()
    }

    pub fn set_autoplay(&self, enabled: bool) {
        info!(enabled, "Autoplay preference changed");
        self.store.player_state.set_autoplay(enabled);
    }

    /// First login phase: the player shows a code and returns a challenge.
    pub async fn login_start(&self, endpoint: &str) -> Result<String> {
        Ok(self.store.players.begin_login(endpoint).await?)
    }

    /// Second login phase. Connects the control session on success.
    pub async fn login_verify(&self, endpoint: &str, code: &str) -> Result<()> {
        self.store.players.complete_login(endpoint, code).await?;
        info!(endpoint, "Player login verified");
        if let Err(e) = self.connect_player(endpoint) {
            warn!(endpoint, error = %e, "Failed to start player control session");
        }
        Ok(())
    }

    /// Forget the session for `endpoint` and close its control session.
    pub async fn logout(&self, endpoint: &str) -> Result<()> {
        let client = self
            .store
            .players
            .get(endpoint)
            .and_then(|s| self.clients.write().remove(s.endpoint()));
        if let Some(client) = client {
            client.shutdown().await;
        }
        self.store.players.invalidate(endpoint).await?;
        self.store.player_state.clear_playback();
        Ok(())
    }

    /// Validate the persisted player session and connect if it is live.
    pub async fn restore_sessions(&self) -> Result<RestoreOutcome> {
        let outcome = self.store.players.restore().await?;
        match &outcome {
            RestoreOutcome::Restored { endpoint } => {
                info!(endpoint = %endpoint, "Player session restored");
                self.connect_player(endpoint)?;
            }
            RestoreOutcome::Rejected { endpoint } => {
                info!(endpoint = %endpoint, "Stored player session rejected, login required");
            }
            RestoreOutcome::Unreachable { endpoint, reason } => {
                warn!(endpoint = %endpoint, reason = %reason, "Player unreachable, keeping stored session");
            }
            RestoreOutcome::NothingStored => debug!("No stored player session"),
        }
        Ok(outcome)
    }

    /// Open the duplex control session for an authenticated endpoint and
    /// relay its events to subscribers.
    pub fn connect_player(&self, endpoint: &str) -> Result<()> {
        let session = self
            .store
            .players
            .get(endpoint)
            .filter(|s| s.is_authenticated())
            .ok_or(Error::Remote(RemoteError::NotAuthenticated))?;
        let key = session.endpoint().to_string();

        let mut clients = self.clients.write();
        if clients.contains_key(&key) {
            debug!(endpoint = %key, "Player control session already running");
            return Ok(());
        }

        let client = Arc::new(RemoteControlClient::spawn(
            session,
            self.config.player.clone(),
            self.shutdown.child_token(),
        ));
        let events = client.subscribe();
        clients.insert(key.clone(), client);
        drop(clients);

        let store = self.store.clone();
        let broadcaster = self.broadcaster.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let mut events = events;
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => relay_player_event(&store, &broadcaster, event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(endpoint = %key, skipped, "Player event bridge lagging");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(endpoint = %key, "Player event bridge stopped");
        });
        Ok(())
    }

    /// Send a control command over the first connected player session.
    pub async fn player_command(&self, command: Command) -> Result<()> {
        let client = {
            let clients = self.clients.read();
            clients
                .values()
                .find(|c| c.is_connected())
                .or_else(|| clients.values().next())
                .cloned()
        };
        let client = client.ok_or(Error::Remote(RemoteError::NotConnected))?;
        client.send(command).await?;
        Ok(())
    }

    /// Child of the service shutdown token, for tasks owned elsewhere.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Tracker that `shutdown` waits on.
    pub fn task_tracker(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Stop the worker, kill running tools, close player sessions and wait
    /// for every background task.
    pub async fn shutdown(&self) {
        info!("Shutting down relay service");
        self.shutdown.cancel();
        self.store.jobs.cancel_all_tokens();

        let clients: Vec<Arc<RemoteControlClient>> =
            self.clients.write().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.shutdown().await;
        }

        self.tasks.close();
        self.tasks.wait().await;
        info!("Relay service shut down");
    }
}

/// Fold a player event into the cached state and forward it.
fn relay_player_event(store: &SessionStore, broadcaster: &Broadcaster, event: PlayerEvent) {
    let relayed = match event {
        PlayerEvent::Connected { endpoint } => {
            RelayEvent::player("connected", json!({ "endpoint": endpoint }))
        }
        PlayerEvent::Disconnected { endpoint, reason } => RelayEvent::player(
            "disconnected",
            json!({ "endpoint": endpoint, "reason": reason }),
        ),
        PlayerEvent::Reconnecting {
            endpoint,
            attempt,
            delay,
        } => RelayEvent::player(
            "reconnecting",
            json!({
                "endpoint": endpoint,
                "attempt": attempt,
                "delayMs": delay.as_millis() as u64,
            }),
        ),
        PlayerEvent::SessionExpired { endpoint } => {
            store.player_state.clear_playback();
            RelayEvent::player("session-expired", json!({ "endpoint": endpoint }))
        }
        PlayerEvent::Message(message) => {
            store.player_state.apply(&message);
            RelayEvent::player(message.kind().to_string(), message.payload())
        }
        PlayerEvent::Diagnostic { kind, detail } => RelayEvent::player(
            "diagnostic",
            json!({ "kind": kind, "detail": detail }),
        ),
    };
    broadcaster.publish(relayed);
}
