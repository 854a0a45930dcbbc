//! ffprobe invocations and JSON parsing (spec.md §6.2).
use crate::process::run_collecting_lines;
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Sources shorter than this are considered unusable (spec.md §4.2).
const MIN_USABLE_DURATION: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct VideoProbe {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub iframes: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct AudioProbe {
    pub duration: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct NativeSupportHint {
    pub maybe_natively_supported: bool,
}

#[derive(Deserialize, Default)]
struct ProbeJson {
    #[serde(default)]
    frames: Vec<FrameJson>,
    format: Option<FormatJson>,
    #[serde(default)]
    streams: Vec<StreamJson>,
}

#[derive(Deserialize, Default)]
struct FrameJson {
    pkt_pts_time: Option<String>,
}

#[derive(Deserialize, Default)]
struct FormatJson {
    duration: Option<String>,
    format_name: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamJson {
    duration: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    codec_name: Option<String>,
    bit_rate: Option<String>,
}

fn parse_flexible(s: &str) -> Option<f64> {
    s.parse::<f64>().ok()
}

async fn run_probe_json(ffprobe_bin: &str, args: &[String]) -> Result<ProbeJson> {
    let lines = run_collecting_lines(ffprobe_bin, args, PROBE_TIMEOUT).await?;
    let joined = lines.join("\n");
    serde_json::from_str(&joined).context("failed to parse ffprobe JSON output")
}

/// `ffprobe -v error -skip_frame nokey -show_entries frame=pkt_pts_time
/// -show_entries format=duration -show_entries stream=duration,width,height
/// -select_streams v -of json <path>`
pub async fn probe_video(ffprobe_bin: &str, path: &str) -> Result<VideoProbe> {
    let args: Vec<String> = [
        "-v",
        "error",
        "-skip_frame",
        "nokey",
        "-show_entries",
        "frame=pkt_pts_time",
        "-show_entries",
        "format=duration",
        "-show_entries",
        "stream=duration,width,height",
        "-select_streams",
        "v",
        "-of",
        "json",
        path,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let json = run_probe_json(ffprobe_bin, &args).await?;

    let stream = json
        .streams
        .first()
        .ok_or_else(|| anyhow!("source has no video stream"))?;
    let width = stream.width.ok_or_else(|| anyhow!("missing video width"))?;
    let height = stream
        .height
        .ok_or_else(|| anyhow!("missing video height"))?;

    let duration = json
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(parse_flexible)
        .or_else(|| stream.duration.as_deref().and_then(parse_flexible))
        .ok_or_else(|| anyhow!("missing duration"))?;
    if duration <= MIN_USABLE_DURATION {
        bail!("source duration {duration}s is too short to be usable");
    }

    let iframes: Vec<f64> = json
        .frames
        .iter()
        .filter_map(|f| f.pkt_pts_time.as_deref())
        .filter_map(parse_flexible)
        .collect();

    Ok(VideoProbe {
        duration,
        width,
        height,
        iframes,
    })
}

/// `ffprobe -v error -show_entries stream=duration,bit_rate -select_streams a -of json <path>`
pub async fn probe_audio(ffprobe_bin: &str, path: &str) -> Result<AudioProbe> {
    let args: Vec<String> = [
        "-v",
        "error",
        "-show_entries",
        "stream=duration,bit_rate",
        "-select_streams",
        "a",
        "-of",
        "json",
        path,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let json = run_probe_json(ffprobe_bin, &args).await?;
    let stream = json
        .streams
        .first()
        .ok_or_else(|| anyhow!("source has no audio stream"))?;
    let duration = stream
        .duration
        .as_deref()
        .and_then(parse_flexible)
        .ok_or_else(|| anyhow!("missing duration"))?;
    if duration <= MIN_USABLE_DURATION {
        bail!("source duration {duration}s is too short to be usable");
    }
    Ok(AudioProbe { duration })
}

/// `ffprobe -v error -show_format -show_streams -of json <path>`
///
/// Classifies the source against a fixed container/codec allow-list to
/// derive the advisory "native support" hint (spec.md §6.1, §6.5).
pub async fn probe_native_support(ffprobe_bin: &str, path: &str) -> Result<NativeSupportHint> {
    let args: Vec<String> = [
        "-v",
        "error",
        "-show_format",
        "-show_streams",
        "-of",
        "json",
        path,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let json = run_probe_json(ffprobe_bin, &args).await?;
    let container_ok = json
        .format
        .as_ref()
        .and_then(|f| f.format_name.as_deref())
        .map(|fmt| fmt.split(',').any(|f| f == "mp4" || f == "mov" || f == "m4a"))
        .unwrap_or(false);
    let codecs_ok = json
        .streams
        .iter()
        .all(|s| matches!(s.codec_name.as_deref(), Some("h264") | Some("aac") | None));

    Ok(NativeSupportHint {
        maybe_natively_supported: container_ok && codecs_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_scientific_numbers() {
        assert_eq!(parse_flexible("1.234000"), Some(1.234));
        assert_eq!(parse_flexible("N/A"), None);
    }
}
