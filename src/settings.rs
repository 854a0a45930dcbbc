use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_port() -> u16 {
    4040
}

fn default_cache_path() -> String {
    std::env::temp_dir().join("hls-vod-cache").to_string_lossy().to_string()
}

fn default_buffer_length() -> f64 {
    30.0
}

fn default_max_client_number() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root directory media paths in requests are resolved against.
    #[serde(rename = "root-path")]
    pub root_path: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Where transcoded segments are cached, per-source under a hashed
    /// subdirectory (spec.md §6.4). Defaults to a subdirectory of the OS
    /// temp directory.
    #[serde(rename = "cache-path", default = "default_cache_path")]
    pub cache_path: String,

    /// Directory prefix applied to the `ffmpeg`/`ffprobe` binary names.
    #[serde(rename = "ffmpeg-binary-dir", default)]
    pub ffmpeg_binary_dir: Option<String>,

    #[serde(rename = "buffer-length", default = "default_buffer_length")]
    pub buffer_length: f64,

    #[serde(rename = "max-client-number", default = "default_max_client_number")]
    pub max_client_number: usize,

    #[serde(default)]
    pub debug: bool,

    /// Disables the "maybe natively supported" hint on `/media/:file`.
    #[serde(rename = "no-short-circuit", default)]
    pub no_short_circuit: bool,
}

impl Settings {
    pub fn ffmpeg_bin(&self) -> String {
        self.binary_path("ffmpeg")
    }

    pub fn ffprobe_bin(&self) -> String {
        self.binary_path("ffprobe")
    }

    fn binary_path(&self, name: &str) -> String {
        match &self.ffmpeg_binary_dir {
            Some(dir) => PathBuf::from(dir).join(name).to_string_lossy().to_string(),
            None => name.to_string(),
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        PathBuf::from(&self.cache_path)
    }

    pub fn max_buffer_length(&self) -> f64 {
        self.buffer_length * 2.0
    }
}
