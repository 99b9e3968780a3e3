//! External tool adapters.
//!
//! The worker only sees the [`Acquirer`] and [`Transcoder`] traits; the
//! yt-dlp and ffmpeg implementations spawn real processes through
//! `process_utils` so that a cancelled job kills its child.

pub mod ffmpeg;
pub mod ytdlp;

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use process_utils::{ExitOutcome, spawn_process_waiter};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::progress::lines_from_reader;
use crate::{Error, Result};

pub use ffmpeg::Ffmpeg;
pub use ytdlp::YtDlp;

/// A running tool: its output lines and how it ended.
pub struct ToolProcess {
    /// stdout and stderr, framed into lines and interleaved.
    pub lines: BoxStream<'static, io::Result<String>>,
    /// Resolves once the process is gone. Killed when the job's token fires.
    pub exit: oneshot::Receiver<ExitOutcome>,
}

impl ToolProcess {
    pub fn new(
        lines: BoxStream<'static, io::Result<String>>,
        exit: oneshot::Receiver<ExitOutcome>,
    ) -> Self {
        Self { lines, exit }
    }

    /// Spawn `command` with both pipes captured.
    pub fn spawn(tool: &str, mut command: Command, cancel: CancellationToken) -> Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| Error::tool(tool, format!("failed to spawn: {e}")))?;
        debug!(tool, pid = ?child.id(), "Spawned tool process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::tool(tool, "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::tool(tool, "stderr not captured"))?;

        let lines = futures::stream::select(lines_from_reader(stdout), lines_from_reader(stderr));
        let exit = spawn_process_waiter(child, cancel);
        Ok(Self::new(lines.boxed(), exit))
    }

    /// Wait for the exit outcome. A dropped waiter counts as a failed wait.
    pub async fn wait(exit: oneshot::Receiver<ExitOutcome>) -> ExitOutcome {
        exit.await
            .unwrap_or_else(|_| ExitOutcome::Failed("process waiter dropped".to_string()))
    }
}

/// Captured output of a short-lived tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub outcome: ExitOutcome,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Last non-empty stderr line, or the exit description.
    pub fn failure_reason(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.outcome.describe())
    }
}

/// Run `command` to completion and collect its output.
///
/// Returns [`Error::Cancelled`] if `cancel` fires first; the child is killed.
pub async fn run_to_completion(
    tool: &str,
    mut command: Command,
    cancel: &CancellationToken,
) -> Result<ToolOutput> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| Error::tool(tool, format!("failed to spawn: {e}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::tool(tool, "stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::tool(tool, "stderr not captured"))?;
    let exit = spawn_process_waiter(child, cancel.clone());

    let mut out = String::new();
    let mut err = String::new();
    tokio::select! {
        // A grandchild may keep the pipes open after the kill.
        _ = cancel.cancelled() => {
            let _ = ToolProcess::wait(exit).await;
            return Err(Error::Cancelled);
        }
        res = async { tokio::try_join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err)) } => {
            res.map_err(|e| Error::tool(tool, format!("failed to read output: {e}")))?;
        }
    }

    let outcome = ToolProcess::wait(exit).await;
    if outcome.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(ToolOutput {
        stdout: out,
        stderr: err,
        outcome,
    })
}

/// Result of the self-update preflight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolUpdate {
    Updated,
    UpToDate,
    /// The tool ran fine but said something unrecognized.
    Unknown,
}

impl ToolUpdate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::UpToDate => "uptodate",
            Self::Unknown => "unknown",
        }
    }

    pub fn message(&self, tool: &str) -> String {
        match self {
            Self::Updated => format!("{tool} updated"),
            Self::UpToDate => format!("{tool} is up to date"),
            Self::Unknown => format!("{tool} update check finished"),
        }
    }
}

/// Direct media URLs behind a page URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStream {
    pub title: Option<String>,
    pub video_url: String,
    /// Separate audio track, when the best video has none.
    pub audio_url: Option<String>,
}

/// Page-to-media acquisition (yt-dlp).
#[async_trait]
pub trait Acquirer: Send + Sync {
    fn name(&self) -> &str;

    /// Idempotent self-update check run before each job.
    async fn ensure_current(&self, cancel: &CancellationToken) -> Result<ToolUpdate>;

    /// Start downloading `url` into `output_dir`.
    async fn download(
        &self,
        url: &str,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolProcess>;

    /// Resolve the video (and audio) URLs to feed a transcoder.
    ///
    /// Fails with [`Error::FormatUnavailable`] when the requested encoding is
    /// not offered, which the caller may retry.
    async fn resolve_stream(&self, url: &str, cancel: &CancellationToken)
    -> Result<ResolvedStream>;

    /// Resolve a single playable URL.
    async fn resolve_direct(&self, url: &str, cancel: &CancellationToken) -> Result<String>;
}

/// Inputs of an HLS segmenting run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub video_url: String,
    pub audio_url: Option<String>,
    pub playlist: PathBuf,
    pub segment_dir: PathBuf,
    /// Prefix written before segment names in the playlist.
    pub base_url: String,
}

/// Live transcode into HLS (ffmpeg).
#[async_trait]
pub trait Transcoder: Send + Sync {
    fn name(&self) -> &str;

    async fn segment(
        &self,
        request: &SegmentRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolProcess>;
}
