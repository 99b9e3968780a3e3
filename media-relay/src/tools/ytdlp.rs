//! yt-dlp adapter.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Acquirer, ResolvedStream, ToolOutput, ToolProcess, ToolUpdate, run_to_completion};
use crate::{Error, Result};

const TOOL: &str = "yt-dlp";

/// Substring yt-dlp prints when the `-f` selector matches nothing.
pub const FORMAT_UNAVAILABLE: &str = "Requested format is not available";

/// Output template relative to the download directory.
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

pub struct YtDlp {
    path: String,
}

impl YtDlp {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = process_utils::tokio_command(&self.path);
        command.env("LC_ALL", "C").args(args);
        command
    }

    pub fn update_args() -> Vec<String> {
        vec!["-U".to_string()]
    }

    pub fn download_args(url: &str, output_dir: &Path) -> Vec<String> {
        let output = output_dir.join(OUTPUT_TEMPLATE);
        [
            "-S",
            "res,ext:mp4:m4a",
            "--merge-output-format",
            "mp4",
            "--no-playlist",
            "-o",
        ]
        .into_iter()
        .map(str::to_string)
        .chain([output.to_string_lossy().into_owned()])
        .chain(
            [
                "--progress",
                "--newline",
                "--sponsorblock-mark",
                "all",
                "--sponsorblock-remove",
                "sponsor",
                url,
            ]
            .into_iter()
            .map(str::to_string),
        )
        .collect()
    }

    pub fn video_args(url: &str) -> Vec<String> {
        [
            "--get-title",
            "--get-url",
            "-f",
            "bestvideo[ext=mp4]",
            "-S",
            "vcodec:h264",
            "--no-playlist",
            url,
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    pub fn audio_args(url: &str) -> Vec<String> {
        ["-g", "-f", "bestaudio[ext=m4a]", "--no-playlist", url]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn direct_args(url: &str) -> Vec<String> {
        ["-g", "-f", "best", "--no-playlist", url]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Run a resolution command and map a non-zero exit to an error.
    async fn query(&self, args: Vec<String>, cancel: &CancellationToken) -> Result<ToolOutput> {
        debug!(args = ?args, "Running yt-dlp query");
        let output = run_to_completion(TOOL, self.command(args), cancel).await?;
        if output.success() {
            return Ok(output);
        }
        if output.stderr.contains(FORMAT_UNAVAILABLE) {
            return Err(Error::FormatUnavailable(output.failure_reason()));
        }
        Err(Error::tool(TOOL, output.failure_reason()))
    }
}

/// Classify the output of `yt-dlp -U`.
pub fn parse_update_output(stdout: &str) -> ToolUpdate {
    if stdout.contains("Updated yt-dlp to") {
        ToolUpdate::Updated
    } else if stdout.contains("yt-dlp is up to date") {
        ToolUpdate::UpToDate
    } else {
        ToolUpdate::Unknown
    }
}

/// Split `--get-title --get-url` output into title and URL.
///
/// Two lines are title then URL, one line is the URL alone.
pub fn parse_video_output(stdout: &str) -> Result<(Option<String>, String)> {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    match lines.as_slice() {
        [title, url] => Ok((Some(title.to_string()), url.to_string())),
        [url] => Ok((None, url.to_string())),
        _ => Err(Error::tool(
            TOOL,
            format!("unexpected number of video output lines: {}", lines.len()),
        )),
    }
}

fn first_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl Acquirer for YtDlp {
    fn name(&self) -> &str {
        TOOL
    }

    async fn ensure_current(&self, cancel: &CancellationToken) -> Result<ToolUpdate> {
        info!("Checking for yt-dlp updates");
        let output = run_to_completion(TOOL, self.command(Self::update_args()), cancel).await?;
        if !output.success() {
            return Err(Error::tool(TOOL, format!("update failed: {}", output.failure_reason())));
        }

        let update = parse_update_output(&output.stdout);
        if update == ToolUpdate::Unknown {
            warn!(stdout = %output.stdout.trim(), "Unexpected yt-dlp update output");
        } else {
            info!(status = update.as_str(), "yt-dlp update check completed");
        }
        Ok(update)
    }

    async fn download(
        &self,
        url: &str,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolProcess> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let args = Self::download_args(url, output_dir);
        info!(url, output_dir = %output_dir.display(), "Starting yt-dlp download");
        ToolProcess::spawn(TOOL, self.command(args), cancel.clone())
    }

    async fn resolve_stream(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedStream> {
        let video = self.query(Self::video_args(url), cancel).await?;
        let (title, video_url) = parse_video_output(&video.stdout)?;

        let audio = self.query(Self::audio_args(url), cancel).await?;
        let audio_url = first_url(&audio.stdout);

        Ok(ResolvedStream {
            title,
            video_url,
            audio_url,
        })
    }

    async fn resolve_direct(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        let output = self.query(Self::direct_args(url), cancel).await?;
        first_url(&output.stdout).ok_or_else(|| Error::tool(TOOL, "no URL in output"))
    }
}
