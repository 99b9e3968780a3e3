//! ffmpeg adapter: live remux of resolved URLs into an HLS playlist.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{SegmentRequest, ToolProcess, Transcoder};
use crate::{Error, Result};

const TOOL: &str = "ffmpeg";

/// Target segment length in seconds.
const HLS_SEGMENT_SECS: u32 = 6;

pub struct Ffmpeg {
    path: String,
}

impl Ffmpeg {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn segment_args(request: &SegmentRequest) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-i".into(), request.video_url.clone()];
        if let Some(audio) = &request.audio_url {
            args.extend(["-i".into(), audio.clone()]);
            args.extend(["-map".into(), "0:v:0".into(), "-map".into(), "1:a:0".into()]);
        }

        let segment_pattern = request.segment_dir.join("segment_%03d.ts");
        args.extend(
            [
                "-c:v",
                "copy",
                "-c:a",
                "copy",
                "-f",
                "hls",
                "-hls_time",
            ]
            .into_iter()
            .map(String::from),
        );
        args.push(HLS_SEGMENT_SECS.to_string());
        args.extend(["-hls_list_size".into(), "0".into()]);
        args.extend([
            "-hls_segment_filename".into(),
            segment_pattern.to_string_lossy().into_owned(),
        ]);
        args.extend(["-hls_base_url".into(), request.base_url.clone()]);
        args.extend(["-start_number".into(), "0".into()]);
        args.extend(["-hls_flags".into(), "independent_segments".into()]);
        args.push("-y".into());
        args.push(request.playlist.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Transcoder for Ffmpeg {
    fn name(&self) -> &str {
        TOOL
    }

    async fn segment(
        &self,
        request: &SegmentRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolProcess> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let args = Self::segment_args(request);
        info!(
            playlist = %request.playlist.display(),
            segments = %request.segment_dir.display(),
            "Starting ffmpeg HLS transcode"
        );

        let mut command = process_utils::tokio_command(&self.path);
        command.env("LC_ALL", "C").args(&args);
        ToolProcess::spawn(TOOL, command, cancel.clone())
    }
}
