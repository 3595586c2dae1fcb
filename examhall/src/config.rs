//! Exam configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::arena::SENTINEL_GRADE;
use crate::error::ExamError;
use crate::names::{DEFAULT_NAMESPACE, Names};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Resource naming
    pub names: NamesConfig,

    /// Delays, polls and timeouts
    pub timing: TimingConfig,

    /// Ticket and grade ranges
    pub exam: ExamConfig,
}

impl Config {
    /// Check cross-field constraints; call before creating any resource
    pub fn validate(&self) -> std::result::Result<(), ExamError> {
        Names::new(&self.names.namespace)?;

        let t = &self.timing;
        if t.poll_interval_ms == 0 {
            return Err(ExamError::InvalidConfig("poll-interval-ms must be positive".to_string()));
        }
        if t.lock_probe_ms == 0 {
            return Err(ExamError::InvalidConfig("lock-probe-ms must be positive".to_string()));
        }
        if t.prep_min_ms > t.prep_max_ms {
            return Err(ExamError::InvalidConfig("prep-min-ms exceeds prep-max-ms".to_string()));
        }
        if t.grading_min_ms > t.grading_max_ms {
            return Err(ExamError::InvalidConfig(
                "grading-min-ms exceeds grading-max-ms".to_string(),
            ));
        }

        let e = &self.exam;
        if e.ticket_max == 0 {
            return Err(ExamError::InvalidConfig("ticket-max must be positive".to_string()));
        }
        if e.grade_min > e.grade_max {
            return Err(ExamError::InvalidConfig("grade-min exceeds grade-max".to_string()));
        }
        if e.grades().contains(&SENTINEL_GRADE) {
            return Err(ExamError::InvalidConfig(format!(
                "grade range must not contain the sentinel {}",
                SENTINEL_GRADE
            )));
        }
        Ok(())
    }

    pub fn names(&self) -> std::result::Result<Names, ExamError> {
        Names::new(&self.names.namespace)
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .examhall.yml
        let local_config = PathBuf::from(".examhall.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/examhall/examhall.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("examhall").join("examhall.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Resource naming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamesConfig {
    /// Prefix for the arena, lock, counter and channel names
    pub namespace: String,

    /// FIFO the log lines are broadcast through
    #[serde(rename = "log-fifo")]
    pub log_fifo: PathBuf,
}

impl Default for NamesConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            log_fifo: PathBuf::from("/tmp/exam_log"),
        }
    }
}

/// Delays, polls and timeouts (all in milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Bound on every blocking wait before flags are re-checked
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// How long a lock waiter blocks before checking for a dead holder
    #[serde(rename = "lock-probe-ms")]
    pub lock_probe_ms: u64,

    #[serde(rename = "prep-min-ms")]
    pub prep_min_ms: u64,

    #[serde(rename = "prep-max-ms")]
    pub prep_max_ms: u64,

    #[serde(rename = "grading-min-ms")]
    pub grading_min_ms: u64,

    #[serde(rename = "grading-max-ms")]
    pub grading_max_ms: u64,

    /// Longest the teacher waits for a student's acknowledgment
    #[serde(rename = "ack-timeout-ms")]
    pub ack_timeout_ms: u64,

    /// Longest the teacher waits for students to leave after shutdown
    #[serde(rename = "drain-timeout-ms")]
    pub drain_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            lock_probe_ms: 500,
            prep_min_ms: 1000,
            prep_max_ms: 3000,
            grading_min_ms: 1000,
            grading_max_ms: 3000,
            ack_timeout_ms: 5000,
            drain_timeout_ms: 3000,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_probe(&self) -> Duration {
        Duration::from_millis(self.lock_probe_ms)
    }

    pub fn prep_range(&self) -> RangeInclusive<u64> {
        self.prep_min_ms..=self.prep_max_ms
    }

    pub fn grading_range(&self) -> RangeInclusive<u64> {
        self.grading_min_ms..=self.grading_max_ms
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Ticket and grade ranges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExamConfig {
    /// Tickets are drawn from 1..=ticket-max
    #[serde(rename = "ticket-max")]
    pub ticket_max: u32,

    #[serde(rename = "grade-min")]
    pub grade_min: i32,

    #[serde(rename = "grade-max")]
    pub grade_max: i32,
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            ticket_max: 100,
            grade_min: 3,
            grade_max: 5,
        }
    }
}

impl ExamConfig {
    pub fn grades(&self) -> RangeInclusive<i32> {
        self.grade_min..=self.grade_max
    }
}
