mod load;
mod types;

pub use load::{apply_env_overrides, load_for_project, read_config, CONFIG_FILE_NAME};
pub use types::{AppConfig, JournalConfig, LoggingConfig, SchedulerConfig, SyncConfig};
