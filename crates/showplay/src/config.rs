//! Player configuration file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use showplay_control::{OutputOptions, PacingOptions};
use showplay_core::{BufferPoolConfig, ControllerSetup, LogConfig};
use showplay_io::FrameCacheOptions;

/// Frame cache limits as written in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Sequence headers kept
    pub header_budget: u64,
    /// Decoded frame data kept, in MiB
    pub chunk_budget_mb: u64,
    pub chunk_concurrency: usize,
    pub ageout_ms: u64,
    /// Bytes the buffer pool may park for reuse, in MiB
    pub pool_retained_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let defaults = FrameCacheOptions::default();
        Self {
            header_budget: defaults.header_budget,
            chunk_budget_mb: defaults.chunk_budget / (1024 * 1024),
            chunk_concurrency: defaults.chunk_concurrency,
            ageout_ms: defaults.ageout_ms,
            pool_retained_mb: defaults.pool.max_retained_bytes / (1024 * 1024),
        }
    }
}

impl CacheConfig {
    pub fn to_options(&self) -> FrameCacheOptions {
        FrameCacheOptions {
            header_budget: self.header_budget.max(1),
            chunk_budget: self.chunk_budget_mb.max(1) * 1024 * 1024,
            chunk_concurrency: self.chunk_concurrency.max(1),
            ageout_ms: self.ageout_ms,
            pool: BufferPoolConfig {
                max_retained_bytes: self.pool_retained_mb * 1024 * 1024,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// How far ahead of the playhead frames are prefetched
    pub lookahead_ms: u64,
    /// Start over at the end of the sequence
    #[serde(rename = "loop")]
    pub loop_playback: bool,
    pub start_frame: u32,
    /// Seconds between statistics log lines (0 disables)
    pub stats_interval_secs: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: 2000,
            loop_playback: false,
            start_frame: 0,
            stats_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub sequence: Option<PathBuf>,
    pub controllers: Vec<ControllerSetup>,
    pub cache: CacheConfig,
    pub playback: PlaybackConfig,
    pub output: OutputOptions,
    pub pacing: PacingOptions,
    pub log: LogConfig,
}

impl PlayerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        Self::parse(&text).with_context(|| format!("Invalid config {:?}", path))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: PlayerConfig = toml::from_str(text)?;
        Ok(config)
    }

    /// Check what playback needs before anything is opened.
    pub fn validate(&self) -> Result<()> {
        if self.sequence.is_none() {
            bail!("No sequence file configured");
        }
        if self.controllers.is_empty() {
            bail!("No controllers configured");
        }
        for setup in &self.controllers {
            setup.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use showplay_core::ControllerProtocol;

    const SAMPLE: &str = r#"
sequence = "shows/xmas.fseq"

[[controllers]]
name = "garage"
address = "10.0.0.20"
protocol = "ddp"
start_channel = 1
channel_count = 1500

[[controllers]]
name = "tree"
address = "10.0.0.21"
protocol = "e131"
start_channel = 1501
channel_count = 1020
universe = 10

[cache]
chunk_budget_mb = 64

[playback]
loop = true
lookahead_ms = 500

[output]
ping_timeout_ms = 250

[output.ddp]
push_at_end_of_frame = false

[output.e131]
source_name = "Yard"
sync_universe = 64000

[pacing]
byte_rate = 5000000

[log]
level = "debug"
"#;

    #[test]
    fn test_parse_sample() {
        let config = PlayerConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.sequence, Some(PathBuf::from("shows/xmas.fseq")));
        assert_eq!(config.controllers.len(), 2);
        assert_eq!(config.controllers[1].protocol, ControllerProtocol::E131);
        assert_eq!(config.controllers[1].universe, Some(10));
        assert!(config.controllers[0].usable);
        assert!(config.playback.loop_playback);
        assert_eq!(config.playback.stats_interval_secs, 10);
        assert_eq!(config.output.ping_timeout_ms, Some(250));
        assert!(!config.output.ddp.push_at_end_of_frame);
        assert_eq!(config.output.ddp.max_payload, 1440);
        assert_eq!(config.output.e131.sync_universe, Some(64000));
        assert_eq!(config.output.e131.universe_size, 510);
        assert_eq!(config.pacing.byte_rate, Some(5_000_000));
        assert_eq!(config.pacing.burst_size, None);
        assert_eq!(config.log.level, "debug");
        assert!(config.validate().is_ok());

        let options = config.cache.to_options();
        assert_eq!(options.chunk_budget, 64 * 1024 * 1024);
        assert_eq!(options.chunk_concurrency, 2);
    }

    #[test]
    fn test_defaults_need_sequence_and_controllers() {
        let config = PlayerConfig::parse("").unwrap();
        assert_eq!(config.cache, CacheConfig::default());
        assert!(config.validate().is_err());

        let mut config = PlayerConfig::parse(SAMPLE).unwrap();
        config.controllers[0].channel_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PlayerConfig::load(&dir.path().join("none.toml")).is_err());
    }
}
