//! Configuration loading and parsing.
//!
//! Parses `vermilion.toml` (or an override path provided by the binary):
//! compression mode, streaming-video policy, cache budgets, client flow
//! control, and the stats block toggle. Unknown fields are ignored so the
//! file can grow without breaking older binaries, and a parse error falls
//! back to defaults rather than refusing to start — the server must come
//! up even with a mangled config.

use anyhow::Result;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::info;

use core_codec::CompressMode;
use core_dispatch::dispatcher::StreamVideoMode;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct CompressionConfig {
    /// off | auto-glz | auto-lz | quic | glz | lz
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct StreamingConfig {
    /// off | all | filter
    #[serde(default)]
    pub video: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_pixmap_bytes")]
    pub pixmap_bytes: u64,
    #[serde(default = "CacheConfig::default_palette_entries")]
    pub palette_entries: u64,
    #[serde(default = "CacheConfig::default_cursor_bytes")]
    pub cursor_bytes: u64,
    #[serde(default = "CacheConfig::default_glz_window_bytes")]
    pub glz_window_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pixmap_bytes: Self::default_pixmap_bytes(),
            palette_entries: Self::default_palette_entries(),
            cursor_bytes: Self::default_cursor_bytes(),
            glz_window_bytes: Self::default_glz_window_bytes(),
        }
    }
}

impl CacheConfig {
    const fn default_pixmap_bytes() -> u64 {
        32 << 20
    }
    const fn default_palette_entries() -> u64 {
        128
    }
    const fn default_cursor_bytes() -> u64 {
        1 << 20
    }
    const fn default_glz_window_bytes() -> u64 {
        16 << 20
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "ClientConfig::default_max_pipe_size")]
    pub max_pipe_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_pipe_size: Self::default_max_pipe_size(),
        }
    }
}

impl ClientConfig {
    const fn default_max_pipe_size() -> usize {
        50
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct StatsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub shm_name: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub file: ConfigFile,
}

impl Config {
    pub fn compress_mode(&self) -> CompressMode {
        match self.file.compression.mode.as_deref() {
            Some("off") => CompressMode::Off,
            Some("auto-lz") => CompressMode::AutoLz,
            Some("quic") => CompressMode::Quic,
            Some("glz") => CompressMode::Glz,
            Some("lz") => CompressMode::Lz,
            Some("auto-glz") | None => CompressMode::AutoGlz,
            Some(other) => {
                info!(target: "config", mode = other, "unknown compression mode, using auto-glz");
                CompressMode::AutoGlz
            }
        }
    }

    pub fn streaming_video(&self) -> StreamVideoMode {
        match self.file.streaming.video.as_deref() {
            Some("off") => StreamVideoMode::Off,
            Some("all") => StreamVideoMode::All,
            Some("filter") | None => StreamVideoMode::Filter,
            Some(other) => {
                info!(target: "config", video = other, "unknown streaming mode, using filter");
                StreamVideoMode::Filter
            }
        }
    }
}

/// Best-effort config path: working directory first, then the platform
/// config dir.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("vermilion.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("vermilion").join("vermilion.toml");
    }
    PathBuf::from("vermilion.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => Ok(Config { file }),
            Err(err) => {
                info!(target: "config", %err, "config parse failed, using defaults");
                Ok(Config::default())
            }
        }
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing_file() {
        let cfg = load_from(Some(PathBuf::from("__no_such_config__.toml"))).unwrap();
        assert_eq!(cfg.compress_mode(), CompressMode::AutoGlz);
        assert_eq!(cfg.streaming_video(), StreamVideoMode::Filter);
        assert_eq!(cfg.file.cache.pixmap_bytes, 32 << 20);
        assert_eq!(cfg.file.cache.palette_entries, 128);
        assert_eq!(cfg.file.client.max_pipe_size, 50);
        assert!(!cfg.file.stats.enabled);
    }

    #[test]
    fn parses_modes_and_budgets() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[compression]\nmode = \"quic\"\n\
             [streaming]\nvideo = \"off\"\n\
             [cache]\npixmap_bytes = 1048576\n\
             [client]\nmax_pipe_size = 25\n\
             [stats]\nenabled = true\nshm_name = \"vd-test\"\n",
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.compress_mode(), CompressMode::Quic);
        assert_eq!(cfg.streaming_video(), StreamVideoMode::Off);
        assert_eq!(cfg.file.cache.pixmap_bytes, 1 << 20);
        assert_eq!(cfg.file.client.max_pipe_size, 25);
        assert!(cfg.file.stats.enabled);
        assert_eq!(cfg.file.stats.shm_name.as_deref(), Some("vd-test"));
    }

    #[test]
    fn unknown_fields_tolerated() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[compression]\nmode = \"glz\"\nfuture_knob = 3\n[brand_new_section]\nx = 1\n",
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.compress_mode(), CompressMode::Glz);
    }

    #[test]
    fn bad_mode_falls_back() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[compression]\nmode = \"zstd\"\n").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.compress_mode(), CompressMode::AutoGlz);
    }

    #[test]
    fn parse_error_falls_back_to_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[[[[ not toml").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.compress_mode(), CompressMode::AutoGlz);
    }
}
