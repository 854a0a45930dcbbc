//! Quality presets: the fixed descending-by-resolution video ladder plus
//! the single audio-only preset (spec.md §3).
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityPreset {
    pub name: &'static str,
    /// Target resolution: the shorter-side pixel count this preset scales
    /// to, per spec.md §4.2's `masterManifest` scaling rule.
    pub resolution: u16,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl Display for QualityPreset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}p, {}k/{}k)",
            self.name, self.resolution, self.video_bitrate_kbps, self.audio_bitrate_kbps
        )
    }
}

/// Fixed descending-by-resolution video ladder.
pub const VIDEO_PRESETS: &[QualityPreset] = &[
    QualityPreset {
        name: "1080p",
        resolution: 1080,
        video_bitrate_kbps: 5_000,
        audio_bitrate_kbps: 192,
    },
    QualityPreset {
        name: "720p",
        resolution: 720,
        video_bitrate_kbps: 3_000,
        audio_bitrate_kbps: 192,
    },
    QualityPreset {
        name: "480p",
        resolution: 480,
        video_bitrate_kbps: 1_500,
        audio_bitrate_kbps: 128,
    },
    QualityPreset {
        name: "360p",
        resolution: 360,
        video_bitrate_kbps: 800,
        audio_bitrate_kbps: 96,
    },
    QualityPreset {
        name: "240p",
        resolution: 240,
        video_bitrate_kbps: 400,
        audio_bitrate_kbps: 64,
    },
];

/// The single audio-only preset.
pub const AUDIO_PRESET: QualityPreset = QualityPreset {
    name: "audio",
    resolution: 0,
    video_bitrate_kbps: 0,
    audio_bitrate_kbps: 160,
};

/// For a video source of (shorter-side) resolution `r`, the applicable
/// presets are those with `resolution <= r`; if none qualify, the smallest
/// preset is used anyway (spec.md §3).
pub fn applicable_video_presets(source_resolution: u16) -> Vec<QualityPreset> {
    let applicable: Vec<QualityPreset> = VIDEO_PRESETS
        .iter()
        .copied()
        .filter(|p| p.resolution <= source_resolution)
        .collect();
    if applicable.is_empty() {
        vec![*VIDEO_PRESETS.last().expect("non-empty ladder")]
    } else {
        applicable
    }
}

pub fn find_preset_by_name(name: &str, is_video: bool) -> Option<QualityPreset> {
    if is_video {
        VIDEO_PRESETS.iter().copied().find(|p| p.name == name)
    } else if name == AUDIO_PRESET.name {
        Some(AUDIO_PRESET)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applicable_filters_by_resolution() {
        let got = applicable_video_presets(720);
        assert_eq!(
            got.iter().map(|p| p.name).collect::<Vec<_>>(),
            vec!["720p", "480p", "360p", "240p"]
        );
    }

    #[test]
    fn falls_back_to_smallest_when_source_too_small() {
        let got = applicable_video_presets(120);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "240p");
    }
}
