//! Media file inspection via ffprobe.
//!
//! Used after a recording stops to get the authoritative container duration;
//! every field is best-effort because a truncated file may probe partially.

use crate::error::{RelayError, RelayResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Probed facts about a media file. Missing fields mean ffprobe could not
/// determine them, not an error.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub codec: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

/// Run ffprobe against `path` and parse the JSON report.
pub async fn probe_media(ffprobe: &str, path: &Path) -> RelayResult<MediaInfo> {
    let output = tokio::time::timeout(
        Duration::from_secs(30),
        tokio::process::Command::new(ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output(),
    )
    .await
    .map_err(|_| RelayError::Probe("ffprobe timed out".to_string()))?
    .map_err(|e| RelayError::Probe(format!("failed to run {ffprobe}: {e}")))?;

    if !output.status.success() {
        return Err(RelayError::Probe(format!(
            "ffprobe exited with {} for {}",
            output.status,
            path.display()
        )));
    }

    let report: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| RelayError::Probe(format!("unparseable ffprobe output: {e}")))?;

    let mut info = MediaInfo::default();
    if let Some(format) = report.format {
        info.duration_secs = format.duration.and_then(|d| d.parse().ok());
        info.size_bytes = format.size.and_then(|s| s.parse().ok());
    }
    for stream in report.streams {
        if stream.codec_type.as_deref() == Some("video") {
            info.width = stream.width;
            info.height = stream.height;
            info.codec = stream.codec_name;
            info.fps = stream.r_frame_rate.as_deref().and_then(parse_frame_rate);
            break;
        }
    }
    Ok(info)
}

/// Parse ffprobe's rational frame rate ("25/1") into frames per second.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("30000/1001").map(|f| f.round()), Some(30.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn probe_report_parsing() {
        let raw = r#"{
            "format": {"duration": "5.013000", "size": "1048576"},
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "h264",
                 "width": 1280, "height": 720, "r_frame_rate": "25/1"}
            ]
        }"#;
        let report: ProbeOutput = serde_json::from_str(raw).unwrap();
        let format = report.format.unwrap();
        assert_eq!(format.duration.as_deref(), Some("5.013000"));
        let video = report
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .unwrap();
        assert_eq!(video.width, Some(1280));
    }
}
