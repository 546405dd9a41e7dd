//! Logging configuration
//!
//! Serializable settings consumed by the player's logging setup. Each session
//! writes to its own timestamped file; older files beyond `max_log_files` are
//! removed at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::level_filters::LevelFilter;

static SESSION_STAMP: OnceLock<u64> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    pub console_output: bool,
    pub file_output: bool,
    pub log_directory: PathBuf,
    pub file_prefix: String,
    /// Number of session logs kept (including the current one)
    pub max_log_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: false,
            log_directory: PathBuf::from("logs"),
            file_prefix: "showplay".to_string(),
            max_log_files: 10,
        }
    }
}

impl LogConfig {
    /// Parsed level, INFO if unrecognized
    pub fn parse_level(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::INFO)
    }

    pub fn ensure_log_directory(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.log_directory)
    }

    /// Path of this session's log file
    pub fn current_log_path(&self) -> PathBuf {
        let stamp = *SESSION_STAMP.get_or_init(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
        });
        self.log_directory
            .join(format!("{}_{}.log", self.file_prefix, stamp))
    }

    /// Remove the oldest session logs so that at most `max_log_files - 1`
    /// remain before this session's file is created.
    pub fn cleanup_old_logs(&self) -> std::io::Result<usize> {
        if !self.log_directory.exists() {
            return Ok(0);
        }

        let prefix = format!("{}_", self.file_prefix);
        let mut logs: Vec<PathBuf> = std::fs::read_dir(&self.log_directory)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "log")
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();

        // Timestamped names sort chronologically
        logs.sort();
        let keep = self.max_log_files.saturating_sub(1);
        let excess = logs.len().saturating_sub(keep);
        let mut removed = 0;
        for path in logs.into_iter().take(excess) {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }
}
