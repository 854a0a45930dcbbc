//! HLS master and variant playlist generation (spec.md §4.2, §6.3).
use crate::quality::QualityPreset;
use std::fmt::Write as _;

/// `#EXT-X-STREAM-INF` BANDWIDTH for a preset, per spec.md §4.2.
fn bandwidth(preset: &QualityPreset) -> u64 {
    let kbps = preset.video_bitrate_kbps as f64 + preset.audio_bitrate_kbps as f64;
    (kbps * 1.05 * 1000.0).ceil() as u64
}

/// Scale `(width, height)` so the shorter side equals `preset.resolution`,
/// rounded to the nearest pixel.
fn scaled_resolution(width: u32, height: u32, preset_resolution: u16) -> (u32, u32) {
    let shorter = width.min(height).max(1) as f64;
    let factor = preset_resolution as f64 / shorter;
    (
        (width as f64 * factor).round() as u32,
        (height as f64 * factor).round() as u32,
    )
}

/// Master playlist for a video source: one `#EXT-X-STREAM-INF` per
/// applicable preset, ordered by descending resolution, each followed by its
/// variant playlist URL.
pub fn master_manifest_video(presets: &[QualityPreset], source_width: u32, source_height: u32) -> String {
    let mut ordered = presets.to_vec();
    ordered.sort_by(|a, b| b.resolution.cmp(&a.resolution));

    let mut out = String::from("#EXTM3U\n");
    for preset in &ordered {
        let (w, h) = scaled_resolution(source_width, source_height, preset.resolution);
        let _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},NAME={}",
            bandwidth(preset),
            w,
            h,
            preset.name
        );
        let _ = writeln!(out, "quality-{}.m3u8", preset.name);
    }
    out
}

/// For audio, the master manifest is the variant manifest verbatim
/// (spec.md §4.2).
pub fn master_manifest_audio(breakpoints: &[f64], preset: &QualityPreset, max_segment_length: f64) -> String {
    variant_manifest(breakpoints, preset.name, max_segment_length)
}

/// Variant (media) playlist listing every segment implied by `breakpoints`,
/// regardless of how much of the media has actually been encoded yet — this
/// is VOD, so the full duration is already known (spec.md §6.3).
pub fn variant_manifest(breakpoints: &[f64], preset_name: &str, max_segment_length: f64) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{:.2}", max_segment_length);
    out.push_str("#EXT-X-VERSION:4\n");
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");

    for (i, w) in breakpoints.windows(2).enumerate() {
        let length = w[1] - w[0];
        let _ = writeln!(out, "#EXTINF:{:.3}", length);
        let _ = writeln!(out, "{}.{:x}.ts", preset_name, i + 1);
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{AUDIO_PRESET, VIDEO_PRESETS};

    #[test]
    fn bandwidth_matches_formula() {
        let p = VIDEO_PRESETS[1]; // 720p: 3000 + 192 kbps
        assert_eq!(bandwidth(&p), ((3000.0 + 192.0) * 1.05 * 1000.0).ceil() as u64);
    }

    #[test]
    fn resolution_scales_to_shorter_side() {
        let (w, h) = scaled_resolution(1920, 1080, 720);
        assert_eq!(h, 720);
        assert_eq!(w, 1280);
    }

    #[test]
    fn variant_manifest_lists_every_segment() {
        let bp = vec![0.0, 3.5, 7.0, 10.0];
        let m = variant_manifest(&bp, "720p", 4.75);
        assert!(m.starts_with("#EXTM3U\n"));
        assert!(m.contains("#EXT-X-TARGETDURATION:4.75"));
        assert!(m.contains("720p.1.ts"));
        assert!(m.contains("720p.3.ts"));
        assert!(!m.contains("720p.4.ts"));
        assert!(m.trim_end().ends_with("#EXT-X-ENDLIST"));
    }

    #[test]
    fn audio_master_is_variant_verbatim() {
        let bp = vec![0.0, 4.0];
        let a = master_manifest_audio(&bp, &AUDIO_PRESET, 4.75);
        let v = variant_manifest(&bp, AUDIO_PRESET.name, 4.75);
        assert_eq!(a, v);
    }
}
