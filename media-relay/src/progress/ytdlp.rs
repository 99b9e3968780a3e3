//! yt-dlp `--progress --newline` output parsing.
//!
//! ```text
//! [download] Destination: /videos/Clip.f137.mp4
//! [download]  45.3% of ~ 10.00MiB at    1.23MiB/s ETA 00:05 (frag 3/10)
//! [download] 100% of   10.00MiB in 00:00:03 at 3.00MiB/s
//! [Merger] Merging formats into "/videos/Clip.mp4"
//! ERROR: [youtube] abc: Video unavailable
//! ```

use std::path::PathBuf;

use super::{LineParser, ProgressEvent, ProgressStage};

/// Parse a byte count such as `10.00MiB`, `512KiB`, `1.5GB` or `900B`.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().trim_start_matches('~').trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "B" | "" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

/// Parse a rate such as `1.23MiB/s`.
pub fn parse_rate(s: &str) -> Option<u64> {
    parse_size(s.trim().strip_suffix("/s")?)
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS` into seconds.
pub fn parse_clock(s: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut parts = 0;
    for part in s.trim().split(':') {
        parts += 1;
        if parts > 3 {
            return None;
        }
        total = total * 60 + part.parse::<u64>().ok()?;
    }
    Some(total)
}

/// Token following ` <keyword> ` in `line`, e.g. `field_after(l, "ETA")`.
fn field_after<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let needle = format!(" {keyword} ");
    let start = line.find(&needle)? + needle.len();
    let rest = line[start..].trim_start();
    let rest = rest.strip_prefix('~').map(str::trim_start).unwrap_or(rest);
    rest.split_whitespace().next()
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Parse a `[download]  NN.N% of ...` line.
pub fn parse_download_line(line: &str) -> Option<ProgressEvent> {
    let rest = line.strip_prefix("[download]")?.trim_start();
    let pct_end = rest.find('%')?;
    let percent: f64 = rest[..pct_end].trim().parse().ok()?;

    // Leading space so that keywords at the start of `rest` also match.
    let padded = format!(" {}", &rest[pct_end + 1..]);
    let total = field_after(&padded, "of").and_then(parse_size);
    let speed = field_after(&padded, "at").and_then(parse_rate);
    let eta = field_after(&padded, "ETA").and_then(parse_clock);
    let fragment = padded.find("(frag ").and_then(|i| {
        let frag = &padded[i + 6..];
        let end = frag.find(')')?;
        let (index, count) = frag[..end].split_once('/')?;
        Some((index.trim().parse::<u32>().ok()?, count.trim().parse::<u32>().ok()?))
    });

    let mut message = format!("Downloading {percent:.1}%");
    if let Some(total) = total {
        message.push_str(&format!(" of {:.2} MiB", total as f64 / 1024.0 / 1024.0));
    }
    if let Some(speed) = speed {
        message.push_str(&format!(" @ {:.2} MiB/s", speed as f64 / 1024.0 / 1024.0));
    }
    if let Some(eta) = eta {
        message.push_str(&format!(" ETA {eta}s"));
    }
    if let Some((index, count)) = fragment {
        message.push_str(&format!(" [fragment {index}/{count}]"));
    }

    let mut event = ProgressEvent::new(ProgressStage::Running, message).with_percent(percent);
    event.total_bytes = total;
    event.downloaded_bytes = total.map(|t| (t as f64 * percent / 100.0) as u64);
    event.speed_bytes_per_sec = speed;
    event.eta_secs = eta;
    Some(event)
}

/// Stateless parser for yt-dlp's download output.
#[derive(Debug, Default)]
pub struct YtDlpParser;

impl YtDlpParser {
    pub fn new() -> Self {
        Self
    }
}

impl LineParser for YtDlpParser {
    fn parse_line(&mut self, line: &str) -> Option<ProgressEvent> {
        let line = line.trim();

        if let Some(error) = line.strip_prefix("ERROR:") {
            return Some(ProgressEvent::new(ProgressStage::Failed, error.trim()));
        }

        if let Some(rest) = line.strip_prefix("[download]") {
            let rest = rest.trim();
            if let Some(path) = rest.strip_prefix("Destination:") {
                let path = PathBuf::from(path.trim());
                return Some(
                    ProgressEvent::new(ProgressStage::Started, "Download started")
                        .with_percent(0.0)
                        .with_artifact(path),
                );
            }
            if let Some(path) = rest.strip_suffix("has already been downloaded") {
                return Some(
                    ProgressEvent::new(ProgressStage::Finished, "Already downloaded")
                        .with_artifact(PathBuf::from(path.trim())),
                );
            }
            return parse_download_line(line);
        }

        if line.starts_with("[Merger]") {
            let path = line.split_once("Merging formats into").map(|(_, p)| unquote(p));
            let mut event = ProgressEvent::new(ProgressStage::Finished, "Merging formats");
            event.artifact = path.filter(|p| !p.is_empty()).map(PathBuf::from);
            return Some(event);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("10.00MiB"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("~ 1.00KiB"), Some(1024));
        assert_eq!(parse_size("900B"), Some(900));
        assert_eq!(parse_size("1.5GB"), Some(1_500_000_000));
        assert_eq!(parse_size("Unknown"), None);
        assert_eq!(parse_size("12.3XB"), None);
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("00:05"), Some(5));
        assert_eq!(parse_clock("01:02:03"), Some(3723));
        assert_eq!(parse_clock("42"), Some(42));
        assert_eq!(parse_clock("Unknown"), None);
        assert_eq!(parse_clock("1:2:3:4"), None);
    }

    #[test]
    fn test_progress_line() {
        let event = parse_download_line(
            "[download]  45.3% of ~ 10.00MiB at    1.00MiB/s ETA 00:05 (frag 3/10)",
        )
        .unwrap();
        assert_eq!(event.stage, ProgressStage::Running);
        assert_eq!(event.percent, Some(45.3));
        assert_eq!(event.total_bytes, Some(10 * 1024 * 1024));
        assert_eq!(event.speed_bytes_per_sec, Some(1024 * 1024));
        assert_eq!(event.eta_secs, Some(5));
        assert!(event.message.contains("[fragment 3/10]"));
    }

    #[test]
    fn test_unknown_fields_are_absent() {
        let event =
            parse_download_line("[download]   0.0% of   10.00MiB at  Unknown B/s ETA Unknown")
                .unwrap();
        assert_eq!(event.percent, Some(0.0));
        assert_eq!(event.speed_bytes_per_sec, None);
        assert_eq!(event.eta_secs, None);
    }

    #[test]
    fn test_final_line() {
        let event = parse_download_line("[download] 100% of   10.00MiB in 00:00:03 at 3.00MiB/s")
            .unwrap();
        assert_eq!(event.percent, Some(100.0));
        assert_eq!(event.speed_bytes_per_sec, Some(3 * 1024 * 1024));
    }

    #[test]
    fn test_stage_lines() {
        let mut parser = YtDlpParser::new();

        let start = parser
            .parse_line("[download] Destination: /videos/My Clip.f137.mp4")
            .unwrap();
        assert_eq!(start.stage, ProgressStage::Started);
        assert_eq!(start.artifact, Some(PathBuf::from("/videos/My Clip.f137.mp4")));

        let merge = parser
            .parse_line(r#"[Merger] Merging formats into "/videos/My Clip.mp4""#)
            .unwrap();
        assert_eq!(merge.stage, ProgressStage::Finished);
        assert_eq!(merge.artifact, Some(PathBuf::from("/videos/My Clip.mp4")));

        let done = parser
            .parse_line("[download] /videos/My Clip.mp4 has already been downloaded")
            .unwrap();
        assert_eq!(done.stage, ProgressStage::Finished);

        let error = parser
            .parse_line("ERROR: [youtube] abc: Video unavailable")
            .unwrap();
        assert_eq!(error.stage, ProgressStage::Failed);
        assert_eq!(error.message, "[youtube] abc: Video unavailable");
    }

    #[test]
    fn test_noise_is_skipped() {
        let mut parser = YtDlpParser::new();
        assert!(parser.parse_line("[youtube] Extracting URL: https://x").is_none());
        assert!(parser.parse_line("[download] Got fragment list").is_none());
        assert!(parser.parse_line("").is_none());
    }
}
