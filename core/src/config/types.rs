use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub journal: JournalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// If true, log to stderr.
    #[serde(default = "default_logging_console")]
    pub console: bool,

    /// If true, log to a file under `directory` (or `<project>/logs` if unset).
    #[serde(default = "default_logging_file")]
    pub file: bool,

    /// EnvFilter string, e.g. "info" or "modelyard_core=debug".
    #[serde(default = "default_logging_level")]
    pub level: String,

    #[serde(default)]
    pub directory: Option<String>,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_logging_console() -> bool {
    true
}

fn default_logging_file() -> bool {
    false
}

fn default_logging_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            console: default_logging_console(),
            file: default_logging_file(),
            level: default_logging_level(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Upper bound on engine queries running at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_histogram_buckets")]
    pub histogram_buckets: usize,

    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_histogram_buckets() -> usize {
    10
}

fn default_preview_rows() -> usize {
    25
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            histogram_buckets: default_histogram_buckets(),
            preview_rows: default_preview_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive failing ticks before an IO error is surfaced.
    #[serde(default = "default_io_error_threshold")]
    pub io_error_threshold: u32,

    /// Pending outbound patch events per remote link before a full resync.
    #[serde(default = "default_push_queue_capacity")]
    pub push_queue_capacity: usize,
}

fn default_interval_ms() -> u64 {
    500
}

fn default_io_error_threshold() -> u32 {
    3
}

fn default_push_queue_capacity() -> usize {
    256
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            io_error_threshold: default_io_error_threshold(),
            push_queue_capacity: default_push_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Relative paths resolve against the project directory.
    #[serde(default = "default_journal_path")]
    pub path: String,
    #[serde(default = "default_journal_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_drop_when_full")]
    pub drop_when_full: bool,
}

fn default_journal_path() -> String {
    "state/patches.jsonl".to_string()
}

fn default_journal_capacity() -> usize {
    2048
}

fn default_drop_when_full() -> bool {
    true
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_journal_path(),
            channel_capacity: default_journal_capacity(),
            drop_when_full: default_drop_when_full(),
        }
    }
}
