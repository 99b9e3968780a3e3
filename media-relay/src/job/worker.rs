//! The sequential job worker.
//!
//! One job at a time goes through preflight and acquisition. A streaming
//! job's transcode tail is handed to the shared task tracker so the worker
//! can pull the next job while ffmpeg keeps running.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use process_utils::ExitOutcome;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::model::{AcquisitionMode, Job, JobState, PlaybackTarget};
use super::queue::CleanupScheduler;
use super::readiness::{Readiness, wait_for_playlist};
use crate::artifacts::{newest_artifact, sanitize_title};
use crate::broadcast::{Broadcaster, RelayEvent};
use crate::config::AppConfig;
use crate::playback::Playback;
use crate::progress::{
    EmitThrottle, FfmpegParser, LineParser, ProgressEvent, ProgressStage, YtDlpParser, normalize,
    terminal_event,
};
use crate::store::SessionStore;
use crate::tools::{Acquirer, ResolvedStream, SegmentRequest, ToolProcess, Transcoder};
use crate::{Error, Result};

/// Everything a job needs while it runs, shared with spawned tails.
pub struct WorkerContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<SessionStore>,
    pub broadcaster: Broadcaster,
    pub cleanup: CleanupScheduler,
    pub acquirer: Arc<dyn Acquirer>,
    pub transcoder: Arc<dyn Transcoder>,
    pub playback: Arc<dyn Playback>,
    /// Transcode tails, playback launches and cleanups.
    pub tasks: TaskTracker,
    pub shutdown: CancellationToken,
}

/// What to hand to the player once a job is done.
enum PlaybackRequest {
    File(PathBuf),
    Url(String),
}

pub struct Worker {
    ctx: Arc<WorkerContext>,
    jobs: mpsc::Receiver<Job>,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>, jobs: mpsc::Receiver<Job>) -> Self {
        Self { ctx, jobs }
    }

    /// Pull and process jobs until shutdown or until the queue is dropped.
    pub async fn run(mut self) {
        info!("Job worker started");
        loop {
            let job = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    debug!("Job worker shutting down");
                    break;
                }
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.ctx.process(job).await;
        }
        info!("Job worker stopped");
    }
}

impl WorkerContext {
    /// Run one job's acquisition phase.
    pub async fn process(self: &Arc<Self>, job: Job) {
        if job.is_cancelled() {
            debug!(job_id = %job.id, "Skipping cancelled job");
            return;
        }
        if self
            .store
            .jobs
            .advance(&job.id, job.run, JobState::Processing, "Processing")
            .is_none()
        {
            debug!(job_id = %job.id, run = job.run, "Job no longer runnable");
            return;
        }
        info!(job_id = %job.id, mode = %job.mode, run = job.run, "Processing job");
        self.broadcaster.publish_snapshot();

        if !self.config.skip_tool_update
            && let Err(e) = self.preflight(&job).await
        {
            self.finish_with_error(&job, e);
            return;
        }

        let result = match job.mode {
            AcquisitionMode::Download => self.run_download(&job).await,
            AcquisitionMode::Stream => self.start_stream(&job).await,
            AcquisitionMode::Direct => self.run_direct(&job).await,
        };
        if let Err(e) = result {
            self.finish_with_error(&job, e);
        }
    }

    async fn preflight(&self, job: &Job) -> Result<()> {
        let tool = self.acquirer.name().to_string();
        self.tool_status(&tool, "checking", format!("Checking {tool} version"));

        match self.acquirer.ensure_current(job.cancel_token()).await {
            Ok(update) => {
                self.tool_status(&tool, update.as_str(), update.message(&tool));
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Tool update check failed");
                self.tool_status(&tool, "error", e.to_string());
                Err(e)
            }
        }
    }

    fn tool_status(&self, tool: &str, status: &str, message: String) {
        self.store.player_state.set_tool_state(status, message.clone());
        self.broadcaster.publish(RelayEvent::ToolStatus {
            tool: tool.to_string(),
            status: status.to_string(),
            message,
        });
    }

    async fn run_download(self: &Arc<Self>, job: &Job) -> Result<()> {
        self.enter(job, JobState::Downloading, "Downloading")?;

        let process = self
            .acquirer
            .download(&job.source, &self.config.video_dir, job.cancel_token())
            .await?;
        let throttle = EmitThrottle::from_config(&self.config.download_progress);
        let (outcome, announced) = self
            .follow(job, process, YtDlpParser::new(), throttle, self.acquirer.name())
            .await;
        self.check_outcome(job, &outcome, self.acquirer.name(), announced.failure)?;

        let output = match announced.artifact {
            Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => Some(path),
            _ => newest_artifact(&self.config.video_dir).await?,
        };
        let Some(output) = output else {
            return Err(Error::tool(self.acquirer.name(), "no output file found"));
        };

        if self.complete(job, Some(output.display().to_string()), "Download finished") {
            self.autoplay(job, PlaybackRequest::File(output));
        }
        Ok(())
    }

    async fn run_direct(self: &Arc<Self>, job: &Job) -> Result<()> {
        self.report(job, ProgressEvent::new(ProgressStage::Started, "Resolving media URL"));
        let url = self
            .acquirer
            .resolve_direct(&job.source, job.cancel_token())
            .await?;
        if job.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if self.complete(job, Some(url.clone()), "Media URL resolved") {
            self.autoplay(job, PlaybackRequest::Url(url));
        }
        Ok(())
    }

    /// Resolve, set up the HLS layout and hand ffmpeg to a background tail.
    async fn start_stream(self: &Arc<Self>, job: &Job) -> Result<()> {
        self.report(job, ProgressEvent::new(ProgressStage::Started, "Resolving stream URLs"));
        let resolved = self.resolve_with_retry(job).await?;

        let title = sanitize_title(resolved.title.as_deref().unwrap_or_default(), &job.id);
        let segment_dir = self.config.segment_dir(&job.id);
        tokio::fs::create_dir_all(&segment_dir).await?;
        let playlist = self.config.video_dir.join(format!("{title}.m3u8"));

        if job.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.enter(job, JobState::Streaming, "Streaming")?;

        // Stops the readiness watcher if the transcode fails early.
        let watch = job.cancel_token().child_token();
        if self.autoplay_target(job).is_some() {
            self.watch_playlist(job, playlist.clone(), watch.clone());
        }

        let request = SegmentRequest {
            video_url: resolved.video_url,
            audio_url: resolved.audio_url,
            playlist: playlist.clone(),
            segment_dir,
            base_url: format!("segments/{}/", job.id),
        };
        let process = match self.transcoder.segment(&request, job.cancel_token()).await {
            Ok(process) => process,
            Err(e) => {
                watch.cancel();
                return Err(e);
            }
        };

        let ctx = self.clone();
        let job = job.clone();
        self.tasks.spawn(async move {
            ctx.finish_stream(job, process, playlist, watch).await;
        });
        Ok(())
    }

    async fn finish_stream(
        self: Arc<Self>,
        job: Job,
        process: ToolProcess,
        playlist: PathBuf,
        watch: CancellationToken,
    ) {
        let throttle = EmitThrottle::from_config(&self.config.transcode_progress);
        let tool = self.transcoder.name().to_string();
        let (outcome, announced) = self
            .follow(&job, process, FfmpegParser::new(), throttle, &tool)
            .await;

        match self.check_outcome(&job, &outcome, &tool, announced.failure) {
            Ok(()) => {
                info!(job_id = %job.id, playlist = %playlist.display(), "Stream transcode finished");
                self.complete(&job, Some(playlist.display().to_string()), "Stream finished");
            }
            Err(e) => {
                watch.cancel();
                self.finish_with_error(&job, e);
            }
        }
    }

    /// Resolve stream URLs, retrying a bounded number of times while the
    /// requested format is unavailable.
    async fn resolve_with_retry(&self, job: &Job) -> Result<ResolvedStream> {
        let retry = self.config.format_retry;
        let mut attempt = 1;
        loop {
            if job.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self
                .acquirer
                .resolve_stream(&job.source, job.cancel_token())
                .await
            {
                Err(Error::FormatUnavailable(reason)) if attempt < retry.attempts => {
                    warn!(
                        job_id = %job.id,
                        attempt,
                        max_attempts = retry.attempts,
                        reason = %reason,
                        "Format not available, retrying"
                    );
                    tokio::select! {
                        _ = job.cancel_token().cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(retry.delay) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Drain a tool's progress into the registry and wait for it to exit.
    async fn follow<P: LineParser>(
        &self,
        job: &Job,
        process: ToolProcess,
        parser: P,
        throttle: EmitThrottle,
        tool: &str,
    ) -> (ExitOutcome, Announced) {
        let ToolProcess { lines, exit } = process;
        let events = normalize(lines, parser, throttle);
        futures::pin_mut!(events);

        let mut announced = Announced::default();
        loop {
            // Grandchildren may keep the pipes open after the tool is killed.
            let event = tokio::select! {
                biased;
                _ = job.cancel_token().cancelled() => {
                    debug!(job_id = %job.id, tool, "Stopped reading tool output, job cancelled");
                    break;
                }
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Some(path) = &event.artifact {
                announced.artifact = Some(path.clone());
            }
            match event.stage {
                ProgressStage::Failed => announced.failure = Some(event.message),
                ProgressStage::Finished => {
                    announced.finished = true;
                    self.report(job, event);
                }
                _ => self.report(job, event),
            }
        }

        let outcome = ToolProcess::wait(exit).await;
        debug!(job_id = %job.id, tool, outcome = %outcome.describe(), "Tool exited");
        if outcome.is_success() && !announced.finished {
            self.report(job, terminal_event(tool, &outcome));
        }
        (outcome, announced)
    }

    fn check_outcome(
        &self,
        job: &Job,
        outcome: &ExitOutcome,
        tool: &str,
        failure: Option<String>,
    ) -> Result<()> {
        if outcome.is_cancelled() || job.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if outcome.is_success() {
            return Ok(());
        }
        Err(Error::tool(tool, failure.unwrap_or_else(|| outcome.describe())))
    }

    /// Move into a working state. Fails as cancelled if the job left the
    /// lifecycle meanwhile.
    fn enter(&self, job: &Job, state: JobState, message: &str) -> Result<()> {
        if job.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let status = self
            .store
            .jobs
            .advance(&job.id, job.run, state, message)
            .ok_or(Error::Cancelled)?;
        self.broadcaster.publish(RelayEvent::Progress {
            id: job.id.clone(),
            percent: status.percent,
            message: status.progress,
            details: None,
        });
        self.broadcaster.publish_snapshot();
        Ok(())
    }

    /// Record and publish one progress sample. Dropped once the job is
    /// terminal.
    fn report(&self, job: &Job, event: ProgressEvent) {
        let Some(status) =
            self.store
                .jobs
                .record_progress(&job.id, job.run, event.percent, event.message.clone())
        else {
            return;
        };
        self.broadcaster.publish(RelayEvent::Progress {
            id: job.id.clone(),
            percent: status.percent,
            message: status.progress,
            details: Some(event),
        });
    }

    /// Mark the job completed. Returns false if it was cancelled first.
    fn complete(&self, job: &Job, output: Option<String>, message: &str) -> bool {
        let Some(status) = self
            .store
            .jobs
            .complete(&job.id, job.run, output.clone(), message)
        else {
            debug!(job_id = %job.id, "Completion dropped, job already finished");
            return false;
        };

        info!(job_id = %job.id, output = ?status.output, "Job completed");
        self.broadcaster.publish(RelayEvent::Completed {
            id: job.id.clone(),
            output,
            message: message.to_string(),
        });
        self.broadcaster.publish_snapshot();
        self.cleanup.schedule(&job.id, job.run);
        true
    }

    /// Record the failure, or the cancellation if that is what it was.
    fn finish_with_error(&self, job: &Job, err: Error) {
        if err.is_cancelled() || job.is_cancelled() {
            // A user cancel already updated the registry; this covers shutdown.
            if self
                .store
                .jobs
                .advance(&job.id, job.run, JobState::Cancelled, "Cancelled")
                .is_some()
            {
                info!(job_id = %job.id, "Job cancelled");
                self.broadcaster
                    .publish(RelayEvent::Cancelled { id: job.id.clone() });
                self.broadcaster.publish_snapshot();
            }
            self.cleanup.schedule(&job.id, job.run);
            return;
        }

        error!(job_id = %job.id, category = ?err.category(), "Job failed: {}", err);
        let message = err.to_string();
        if self.store.jobs.fail(&job.id, job.run, message.clone()).is_some() {
            self.broadcaster.publish(RelayEvent::Error {
                id: job.id.clone(),
                message,
            });
            self.broadcaster.publish_snapshot();
        }
        self.cleanup.schedule(&job.id, job.run);
    }

    fn autoplay_target(&self, job: &Job) -> Option<PlaybackTarget> {
        if !self.store.player_state.autoplay() {
            return None;
        }
        job.playback_target().cloned()
    }

    fn autoplay(self: &Arc<Self>, job: &Job, request: PlaybackRequest) {
        let Some(target) = self.autoplay_target(job) else {
            return;
        };
        let ctx = self.clone();
        let id = job.id.clone();
        let cancel = job.cancel_token().clone();
        self.tasks.spawn(async move {
            let result = match &request {
                PlaybackRequest::File(path) => ctx.playback.play_file(&target, path, &cancel).await,
                PlaybackRequest::Url(url) => ctx.playback.play_url(&target, url).await,
            };
            if let Err(e) = result {
                ctx.playback_failed(&id, &target, e);
            }
        });
    }

    /// Wait for the playlist to fill, then start playback.
    fn watch_playlist(self: &Arc<Self>, job: &Job, playlist: PathBuf, watch: CancellationToken) {
        let Some(target) = self.autoplay_target(job) else {
            return;
        };
        let ctx = self.clone();
        let id = job.id.clone();
        self.tasks.spawn(async move {
            match wait_for_playlist(&playlist, ctx.config.readiness, &watch).await {
                Readiness::Ready => {
                    if let Err(e) = ctx.playback.play_file(&target, &playlist, &watch).await {
                        ctx.playback_failed(&id, &target, e);
                    }
                }
                Readiness::Cancelled => debug!(job_id = %id, "Playlist watcher cancelled"),
                Readiness::TimedOut => {
                    let e = Error::Timeout(format!("{} never became ready", display(&playlist)));
                    ctx.playback_failed(&id, &target, e);
                }
            }
        });
    }

    /// Playback never fails the job; it only surfaces as a diagnostic.
    fn playback_failed(&self, id: &str, target: &PlaybackTarget, err: Error) {
        if err.is_cancelled() {
            debug!(job_id = %id, "Playback abandoned, job cancelled");
            return;
        }
        warn!(job_id = %id, player = %target.player_url, error = %err, "Remote playback failed");
        self.broadcaster.publish(RelayEvent::player(
            "playback-error",
            json!({
                "jobId": id,
                "player": target.player_url,
                "message": err.to_string(),
            }),
        ));
    }
}

/// What the tool said about its own run.
#[derive(Debug, Default)]
struct Announced {
    artifact: Option<PathBuf>,
    failure: Option<String>,
    finished: bool,
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
