//! Bounded job queue.
//!
//! A slot in the channel is reserved before a job is registered, so a full
//! queue rejects immediately and never leaves a registered job behind.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::model::{Job, JobRequest, JobState, JobStatus, PostAction, generate_job_id};
use crate::broadcast::{Broadcaster, RelayEvent};
use crate::store::{CancelOutcome, RetryRefusal, SessionStore};

const QUEUED_MESSAGE: &str = "Queued";
const RETRY_MESSAGE: &str = "Queued for retry";
const CANCELLED_MESSAGE: &str = "Cancelled";

/// Why a queue operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueRejection {
    #[error("Queue is full, try again later")]
    QueueFull,

    #[error("Queue is closed")]
    Closed,

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {id} is {state} and cannot be retried")]
    NotRetryable { id: String, state: JobState },
}

impl<T> From<TrySendError<T>> for QueueRejection {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Self::QueueFull,
            TrySendError::Closed(_) => Self::Closed,
        }
    }
}

/// Removes terminal jobs from the registry once observers had time to see
/// their final state.
#[derive(Clone)]
pub struct CleanupScheduler {
    store: Arc<SessionStore>,
    broadcaster: Broadcaster,
    grace: Duration,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<SessionStore>,
        broadcaster: Broadcaster,
        grace: Duration,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            broadcaster,
            grace,
            tasks,
            shutdown,
        }
    }

    /// Remove run `run` of `id` after the grace delay if it is still terminal.
    pub fn schedule(&self, id: &str, run: u32) {
        let id = id.to_string();
        let store = self.store.clone();
        let broadcaster = self.broadcaster.clone();
        let grace = self.grace;
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if store.jobs.remove_finished(&id, run) {
                        debug!(job_id = %id, run, "Removed finished job");
                        broadcaster.publish_snapshot();
                    }
                }
            }
        });
    }
}

pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    store: Arc<SessionStore>,
    broadcaster: Broadcaster,
    cleanup: CleanupScheduler,
}

impl JobQueue {
    /// Create the queue and the receiving end for the worker.
    pub fn new(
        capacity: usize,
        store: Arc<SessionStore>,
        broadcaster: Broadcaster,
        cleanup: CleanupScheduler,
    ) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                store,
                broadcaster,
                cleanup,
            },
            rx,
        )
    }

    /// Free slots left in the channel.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    /// Register and queue a new job. Returns its id.
    pub fn enqueue(&self, request: JobRequest) -> Result<String, QueueRejection> {
        validate(&request)?;
        let permit = self.tx.try_reserve()?;

        let job = Job::new(generate_job_id(), request);
        let id = job.id.clone();
        self.store.jobs.insert(job.clone(), QUEUED_MESSAGE);
        permit.send(job);

        info!(job_id = %id, "Job queued");
        self.broadcaster.publish(RelayEvent::Queued {
            id: id.clone(),
            message: QUEUED_MESSAGE.to_string(),
        });
        self.broadcaster.publish_snapshot();
        Ok(id)
    }

    /// Cancel a queued or running job.
    pub fn cancel(&self, id: &str) -> CancelOutcome {
        let outcome = self.store.jobs.cancel(id, CANCELLED_MESSAGE);
        match &outcome {
            CancelOutcome::Cancelled(status) => {
                info!(job_id = %id, "Job cancelled");
                self.broadcaster
                    .publish(RelayEvent::Cancelled { id: id.to_string() });
                self.broadcaster.publish_snapshot();
                self.cleanup.schedule(id, status.run);
            }
            CancelOutcome::NotCancellable(state) => {
                debug!(job_id = %id, state = %state, "Cancel refused");
            }
            CancelOutcome::NotFound => debug!(job_id = %id, "Cancel for unknown job"),
        }
        outcome
    }

    /// Queue a new run of a finished job under the same id.
    pub fn retry(&self, id: &str) -> Result<JobStatus, QueueRejection> {
        let candidate = self
            .store
            .jobs
            .retry_candidate(id)
            .map_err(|r| refusal(id, r))?;
        let permit = self.tx.try_reserve()?;

        let status = self
            .store
            .jobs
            .requeue(candidate.clone(), RETRY_MESSAGE)
            .map_err(|r| refusal(id, r))?;
        permit.send(candidate);

        info!(job_id = %id, run = status.run, "Job queued for retry");
        self.broadcaster.publish(RelayEvent::Queued {
            id: id.to_string(),
            message: RETRY_MESSAGE.to_string(),
        });
        self.broadcaster.publish_snapshot();
        Ok(status)
    }

    pub fn snapshot(&self) -> Vec<JobStatus> {
        self.store.jobs.snapshot()
    }

    /// Remove every completed or failed job. Returns how many were removed.
    pub fn clear_terminal(&self) -> usize {
        let removed = self.store.jobs.clear_terminal();
        if removed > 0 {
            info!(removed, "Cleared finished jobs");
            self.broadcaster.publish_snapshot();
        }
        removed
    }
}

fn refusal(id: &str, refusal: RetryRefusal) -> QueueRejection {
    match refusal {
        RetryRefusal::NotFound => QueueRejection::NotFound(id.to_string()),
        RetryRefusal::NotRetryable(state) => QueueRejection::NotRetryable {
            id: id.to_string(),
            state,
        },
    }
}

fn validate(request: &JobRequest) -> Result<(), QueueRejection> {
    let source = request.source.trim();
    if source.is_empty() {
        return Err(QueueRejection::Invalid("source URL is empty".to_string()));
    }
    if url::Url::parse(source).is_err() {
        return Err(QueueRejection::Invalid(format!("not a URL: {source}")));
    }
    if request.post_action == PostAction::RemotePlay {
        match &request.target {
            None => {
                return Err(QueueRejection::Invalid(
                    "remote-play needs a player target".to_string(),
                ));
            }
            Some(target) if target.player_url.trim().is_empty() => {
                return Err(QueueRejection::Invalid("player URL is empty".to_string()));
            }
            Some(_) => {}
        }
    }
    if request.post_action == PostAction::None && request.target.is_some() {
        warn!("Player target given without remote-play, ignoring it");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::{AcquisitionMode, PlaybackTarget};

    struct Harness {
        queue: JobQueue,
        rx: mpsc::Receiver<Job>,
        store: Arc<SessionStore>,
        tasks: TaskTracker,
    }

    fn harness(capacity: usize) -> Harness {
        let http = vlc_remote::build_http_client(&vlc_remote::ClientConfig::default()).unwrap();
        let players = Arc::new(vlc_remote::SessionRegistry::new(http, None));
        let store = Arc::new(SessionStore::new(players));
        let broadcaster = Broadcaster::new(store.clone());
        let tasks = TaskTracker::new();
        let cleanup = CleanupScheduler::new(
            store.clone(),
            broadcaster.clone(),
            Duration::from_secs(3),
            tasks.clone(),
            CancellationToken::new(),
        );
        let (queue, rx) = JobQueue::new(capacity, store.clone(), broadcaster, cleanup);
        Harness {
            queue,
            rx,
            store,
            tasks,
        }
    }

    fn request() -> JobRequest {
        JobRequest::new("https://example/video", AcquisitionMode::Download)
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let h = harness(1);
        let first = h.queue.enqueue(request()).unwrap();
        assert_eq!(h.queue.enqueue(request()), Err(QueueRejection::QueueFull));

        // The rejected request left nothing behind.
        let snapshot = h.queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, first);
        assert_eq!(snapshot[0].state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let h = harness(4);
        assert!(matches!(
            h.queue.enqueue(JobRequest::new("  ", AcquisitionMode::Download)),
            Err(QueueRejection::Invalid(_))
        ));

        let mut remote = request();
        remote.post_action = PostAction::RemotePlay;
        assert!(matches!(h.queue.enqueue(remote), Err(QueueRejection::Invalid(_))));

        let ok = request().with_remote_play(PlaybackTarget {
            player_url: "http://192.168.1.20:8080".into(),
            media_base_url: "http://192.168.1.10:8080".into(),
        });
        assert!(h.queue.enqueue(ok).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_job_is_cleaned_up() {
        let mut h = harness(4);
        let id = h.queue.enqueue(request()).unwrap();

        let outcome = h.queue.cancel(&id);
        assert!(outcome.is_cancelled());
        assert_eq!(h.store.jobs.get(&id).unwrap().state, JobState::Cancelled);

        // The worker still receives it but sees the fired token.
        assert!(h.rx.recv().await.unwrap().is_cancelled());

        assert_eq!(
            h.queue.cancel(&id),
            CancelOutcome::NotCancellable(JobState::Cancelled)
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(h.store.jobs.get(&id).is_none());
        h.tasks.close();
        h.tasks.wait().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let h = harness(1);
        let outcome = h.queue.cancel("dl_missing");
        assert_eq!(outcome, CancelOutcome::NotFound);
        assert_eq!(outcome.message("dl_missing"), "Job dl_missing not found");
    }

    #[tokio::test]
    async fn test_retry_rules() {
        let mut h = harness(1);
        let id = h.queue.enqueue(request()).unwrap();
        let job = h.rx.recv().await.unwrap();

        h.store.jobs.advance(&id, 1, JobState::Processing, "processing");
        h.store.jobs.advance(&id, 1, JobState::Downloading, "downloading");
        h.store.jobs.record_progress(&id, 1, Some(40.0), "40%");
        assert_eq!(
            h.queue.retry(&id),
            Err(QueueRejection::NotRetryable {
                id: id.clone(),
                state: JobState::Downloading
            })
        );

        h.store.jobs.fail(&id, job.run, "boom");
        let status = h.queue.retry(&id).unwrap();
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.percent, 0.0);
        assert_eq!(status.error, None);
        assert_eq!(status.run, 2);

        let rerun = h.rx.recv().await.unwrap();
        assert_eq!(rerun.id, id);
        assert_eq!(rerun.run, 2);
        assert!(!rerun.is_cancelled());

        assert_eq!(
            h.queue.retry("dl_missing"),
            Err(QueueRejection::NotFound("dl_missing".into()))
        );
    }

    #[tokio::test]
    async fn test_retry_on_full_queue() {
        let h = harness(1);
        let id = h.queue.enqueue(request()).unwrap();
        h.store.jobs.advance(&id, 1, JobState::Processing, "p");
        h.store.jobs.complete(&id, 1, None, "done");

        // The first run still occupies the only slot.
        assert_eq!(h.queue.retry(&id), Err(QueueRejection::QueueFull));
        let status = h.store.jobs.get(&id).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.run, 1);
    }

    #[tokio::test]
    async fn test_clear_terminal() {
        let h = harness(4);
        let done = h.queue.enqueue(request()).unwrap();
        let waiting = h.queue.enqueue(request()).unwrap();
        h.store.jobs.advance(&done, 1, JobState::Processing, "p");
        h.store.jobs.complete(&done, 1, Some("/videos/a.mp4".into()), "done");

        assert_eq!(h.queue.clear_terminal(), 1);
        let ids: Vec<String> = h.queue.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![waiting]);
    }
}
