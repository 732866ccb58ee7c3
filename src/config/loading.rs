//! Engine settings: cache sizes, preload depth, memory ceiling, job timing.
//!
//! Persisted as JSON. Missing fields take static defaults; a missing or
//! malformed file falls back to adaptive defaults derived from system memory
//! and CPU count.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::memory::system_memory_gb;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingConfig {
    // Cache sizes (entries)
    pub audio_cache_size: usize,
    pub image_cache_size: usize,
    pub icon_cache_size: usize,
    pub lyrics_cache_size: usize,

    // Preloading
    pub preload_next_songs: usize,
    pub lyrics_preload_radius: usize,
    pub preload_covers: bool,

    // Memory
    pub max_memory_usage_mb: u64,
    pub cleanup_interval_ms: u64,
    /// Audio entries kept by `cleanup_old` under memory pressure
    pub audio_keep_on_cleanup: usize,

    // Loading
    pub max_concurrent_loads: usize,
    pub load_timeout_seconds: u64, // 0 = no timeout
    pub cover_size: (u32, u32),

    // Separation jobs
    pub library_dir: PathBuf,
    pub separation_tool: String,
    pub separation_tool_args: Vec<String>, // inserted before "-n <model>"
    pub separation_model: String,
    pub tool_timeout_secs: u64,
    pub verify_interval_secs: u64,
    pub verify_max_attempts: u32,

    // Playback
    pub settle_delay_ms: u64,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            audio_cache_size: 20,
            image_cache_size: 100,
            icon_cache_size: 32,
            lyrics_cache_size: 50,
            preload_next_songs: 2,
            lyrics_preload_radius: 1,
            preload_covers: true,
            max_memory_usage_mb: 512,
            cleanup_interval_ms: 300_000,
            audio_keep_on_cleanup: 3,
            max_concurrent_loads: 3,
            load_timeout_seconds: 30,
            cover_size: (500, 500),
            library_dir: PathBuf::from("music_library"),
            separation_tool: "demucs".to_string(),
            separation_tool_args: Vec::new(),
            separation_model: "htdemucs_ft".to_string(),
            tool_timeout_secs: 7200,
            verify_interval_secs: 30,
            verify_max_attempts: 60,
            settle_delay_ms: 150,
        }
    }
}

impl LoadingConfig {
    /// Defaults tuned to this machine's memory and CPU count
    pub fn adaptive() -> Self {
        Self::adaptive_for(system_memory_gb(), num_cpus::get())
    }

    /// Memory tiers: <4 GB, <8 GB, >=8 GB
    pub fn adaptive_for(memory_gb: f64, cpu_count: usize) -> Self {
        let mut config = Self::default();

        if memory_gb < 4.0 {
            config.audio_cache_size = 10;
            config.image_cache_size = 50;
            config.lyrics_cache_size = 25;
            config.max_memory_usage_mb = 256;
            config.preload_next_songs = 1;
        } else if memory_gb < 8.0 {
            config.audio_cache_size = 15;
            config.image_cache_size = 75;
            config.lyrics_cache_size = 35;
            config.max_memory_usage_mb = 384;
            config.preload_next_songs = 2;
        } else {
            config.audio_cache_size = 25;
            config.image_cache_size = 150;
            config.lyrics_cache_size = 75;
            config.max_memory_usage_mb = 768;
            config.preload_next_songs = 3;
        }

        config.max_concurrent_loads = if cpu_count < 4 { 2 } else { cpu_count.min(5) };

        info!(
            "Adaptive config: {:.1} GB / {} CPUs -> audio={}, images={}, lyrics={}, ceiling={} MB",
            memory_gb,
            cpu_count,
            config.audio_cache_size,
            config.image_cache_size,
            config.lyrics_cache_size,
            config.max_memory_usage_mb
        );
        config
    }

    /// Load from file; missing or malformed files fall back to adaptive defaults.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                if path.exists() {
                    warn!("Config load failed ({:#}), using adaptive defaults", e);
                } else {
                    info!("No config at {}, using adaptive defaults", path.display());
                }
                Self::adaptive()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        (self.load_timeout_seconds > 0).then(|| Duration::from_secs(self.load_timeout_seconds))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.verify_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tiers() {
        let low = LoadingConfig::adaptive_for(2.0, 2);
        assert_eq!(low.audio_cache_size, 10);
        assert_eq!(low.max_memory_usage_mb, 256);
        assert_eq!(low.preload_next_songs, 1);
        assert_eq!(low.max_concurrent_loads, 2);

        let mid = LoadingConfig::adaptive_for(6.0, 4);
        assert_eq!(mid.image_cache_size, 75);
        assert_eq!(mid.max_concurrent_loads, 4);

        let high = LoadingConfig::adaptive_for(32.0, 16);
        assert_eq!(high.lyrics_cache_size, 75);
        assert_eq!(high.max_memory_usage_mb, 768);
        assert_eq!(high.max_concurrent_loads, 5);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stemdeck.json");

        let mut config = LoadingConfig::default();
        config.audio_cache_size = 7;
        config.separation_model = "htdemucs".to_string();
        config.save(&path).unwrap();

        assert_eq!(LoadingConfig::load(&path), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stemdeck.json");
        std::fs::write(&path, r#"{ "lyrics_cache_size": 9 }"#).unwrap();

        let config = LoadingConfig::load(&path);
        assert_eq!(config.lyrics_cache_size, 9);
        assert_eq!(config.verify_max_attempts, 60);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stemdeck.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = LoadingConfig::load(&path);
        // Adaptive defaults always keep the job timing defaults
        assert_eq!(config.verify_interval_secs, 30);
        assert!(config.audio_cache_size >= 10);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let mut config = LoadingConfig::default();
        config.load_timeout_seconds = 0;
        assert_eq!(config.load_timeout(), None);
    }
}
