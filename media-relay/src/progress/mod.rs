//! Turns noisy tool output into a lazy, throttled sequence of progress events.
//!
//! Bytes are framed into lines by [`ToolLineCodec`], each line goes through a
//! tool-specific [`LineParser`], and [`normalize`] drops samples that arrive
//! faster than the [`EmitThrottle`] allows. Stage changes always pass, and the
//! last suppressed sample is flushed when the source ends.

pub mod codec;
pub mod ffmpeg;
pub mod throttle;
pub mod ytdlp;

use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use process_utils::ExitOutcome;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::debug;

pub use codec::ToolLineCodec;
pub use ffmpeg::FfmpegParser;
pub use throttle::EmitThrottle;
pub use ytdlp::YtDlpParser;

/// Where the tool is in its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    /// A new output started (first sample, new destination file).
    Started,
    Running,
    Finished,
    Failed,
}

impl ProgressStage {
    /// Stage changes bypass the throttle.
    pub fn is_transition(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One normalized progress sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub at: DateTime<Utc>,
    pub stage: ProgressStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_bytes_per_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    /// Media time already written, for transcodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_time_secs: Option<f64>,
    /// Transcode speed relative to real time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_ratio: Option<f64>,
    /// Output file the tool announced.
    #[serde(skip)]
    pub artifact: Option<PathBuf>,
}

impl ProgressEvent {
    pub fn new(stage: ProgressStage, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            stage,
            percent: None,
            message: message.into(),
            downloaded_bytes: None,
            total_bytes: None,
            speed_bytes_per_sec: None,
            eta_secs: None,
            media_time_secs: None,
            playback_ratio: None,
            artifact: None,
        }
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact = Some(path.into());
        self
    }
}

/// Tool-specific interpretation of one output line.
pub trait LineParser: Send {
    /// `None` for lines that carry no progress information.
    fn parse_line(&mut self, line: &str) -> Option<ProgressEvent>;
}

/// Frame raw tool output into lines.
pub fn lines_from_reader<R>(reader: R) -> FramedRead<R, ToolLineCodec>
where
    R: AsyncRead,
{
    FramedRead::new(reader, ToolLineCodec::new())
}

struct NormalizerState<S, P> {
    lines: S,
    parser: P,
    throttle: EmitThrottle,
    /// Newest sample held back by the throttle.
    pending: Option<ProgressEvent>,
    done: bool,
}

/// Lazily parse and throttle `lines`.
///
/// Unparsable lines are skipped. A read error ends the sequence like EOF.
/// A `Finished` event without a percentage is reported as 100%.
pub fn normalize<S, P>(lines: S, parser: P, throttle: EmitThrottle) -> impl Stream<Item = ProgressEvent>
where
    S: Stream<Item = io::Result<String>> + Unpin,
    P: LineParser,
{
    let state = NormalizerState {
        lines,
        parser,
        throttle,
        pending: None,
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.lines.next().await {
                Some(Ok(line)) => {
                    let Some(mut event) = state.parser.parse_line(&line) else {
                        continue;
                    };
                    if event.stage == ProgressStage::Finished && event.percent.is_none() {
                        event.percent = Some(100.0);
                    }

                    let now = tokio::time::Instant::now();
                    if state
                        .throttle
                        .should_emit(now, event.percent, event.stage.is_transition())
                    {
                        state.throttle.mark_emitted(now, event.percent);
                        state.pending = None;
                        return Some((event, state));
                    }
                    state.pending = Some(event);
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Tool output stream failed");
                    state.done = true;
                    return state.pending.take().map(|event| (event, state));
                }
                None => {
                    state.done = true;
                    return state.pending.take().map(|event| (event, state));
                }
            }
        }
    })
}

/// Terminal event synthesized from the exit of the tool, for sources that
/// stop without reporting completion.
pub fn terminal_event(tool: &str, outcome: &ExitOutcome) -> ProgressEvent {
    match outcome {
        ExitOutcome::Exited(0) => {
            ProgressEvent::new(ProgressStage::Finished, format!("{tool} finished")).with_percent(100.0)
        }
        other => ProgressEvent::new(
            ProgressStage::Failed,
            format!("{tool} {}", other.describe()),
        ),
    }
}
