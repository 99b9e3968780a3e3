//! FFmpeg stderr parsing.
//!
//! FFmpeg reports the input duration once (`Duration: 00:03:25.12, ...`) and
//! then redraws a stats line:
//! `frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x`

use super::{LineParser, ProgressEvent, ProgressStage};

/// Lines that mean the run is over and failed.
const FAILURE_MARKERS: &[&str] = &[
    "Conversion failed!",
    "Error opening input",
    "Invalid data found when processing input",
];

/// Parse `HH:MM:SS.ms` into seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let mut parts = time_str.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Value of a `key=value` field. FFmpeg pads values with spaces after `=`.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("{key}=");
    let start = line.find(&needle)? + needle.len();
    line[start..].trim_start().split_whitespace().next()
}

/// `time=00:01:30.50` in seconds.
pub fn parse_time_field(line: &str) -> Option<f64> {
    parse_time(field(line, "time")?)
}

/// `size=    1024kB` in bytes. `N/A` for segmenting muxers.
pub fn parse_size(line: &str) -> Option<u64> {
    let value = field(line, "size")?;
    let end = value.find(['k', 'K'])?;
    let size: u64 = value[..end].trim().parse().ok()?;
    Some(size * 1024)
}

/// `speed=1.00x` as a ratio to real time.
pub fn parse_speed(line: &str) -> Option<f64> {
    field(line, "speed")?.strip_suffix('x')?.parse().ok()
}

/// `bitrate=2097.2kbits/s` in bytes per second.
pub fn parse_bitrate(line: &str) -> Option<u64> {
    let value = field(line, "bitrate")?;
    let kbits: f64 = value.strip_suffix("kbits/s")?.parse().ok()?;
    Some((kbits * 1024.0 / 8.0) as u64)
}

/// `Duration: 00:03:25.12, start: ...` in seconds.
pub fn parse_duration(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?;
    let value = rest.split(',').next()?;
    parse_time(value)
}

/// Stateful: remembers the input duration to turn media time into a percentage.
#[derive(Debug, Default)]
pub struct FfmpegParser {
    total_secs: Option<f64>,
}

impl FfmpegParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known total, e.g. from a probe before the run.
    pub fn with_total(total_secs: f64) -> Self {
        Self {
            total_secs: (total_secs > 0.0).then_some(total_secs),
        }
    }

    pub fn total_secs(&self) -> Option<f64> {
        self.total_secs
    }

    fn progress(&self, line: &str) -> Option<ProgressEvent> {
        // `time=` plus another stats marker, so unrelated lines are not taken
        // for progress.
        if !line.contains("time=") || !(line.contains("frame=") || line.contains("size=")) {
            return None;
        }
        let media_time = parse_time_field(line)?;
        let speed = parse_speed(line);

        let mut message = format!("Transcoded {media_time:.1}s");
        if let Some(speed) = speed {
            message.push_str(&format!(" ({speed:.2}x)"));
        }

        let mut event = ProgressEvent::new(ProgressStage::Running, message);
        if let Some(total) = self.total_secs {
            event.percent = Some((media_time / total * 100.0).clamp(0.0, 100.0));
            if let Some(speed) = speed.filter(|s| *s > 0.0) {
                event.eta_secs = Some(((total - media_time).max(0.0) / speed) as u64);
            }
        }
        event.media_time_secs = Some(media_time);
        event.playback_ratio = speed;
        event.downloaded_bytes = parse_size(line);
        event.speed_bytes_per_sec = parse_bitrate(line);
        Some(event)
    }
}

impl LineParser for FfmpegParser {
    fn parse_line(&mut self, line: &str) -> Option<ProgressEvent> {
        if self.total_secs.is_none()
            && let Some(total) = parse_duration(line).filter(|t| *t > 0.0)
        {
            self.total_secs = Some(total);
            return None;
        }

        if FAILURE_MARKERS.iter().any(|m| line.contains(m)) {
            return Some(ProgressEvent::new(ProgressStage::Failed, line.trim()));
        }

        // Final summary, e.g. `video:1kB audio:2kB ... muxing overhead: 0.1%`.
        if line.contains("muxing overhead") {
            return Some(ProgressEvent::new(ProgressStage::Finished, "Transcode finished"));
        }

        self.progress(line)
    }
}
