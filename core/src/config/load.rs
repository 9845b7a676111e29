use anyhow::Context;
use std::path::Path;

use super::types::AppConfig;

pub const CONFIG_FILE_NAME: &str = "modelyard.toml";

/// Load configuration for `project_dir`.
///
/// Priority: `<project>/modelyard.toml`, then `./modelyard.toml`, then
/// defaults. `MODELYARD_*` environment variables override any file.
pub fn load_for_project(project_dir: Option<&Path>) -> anyhow::Result<AppConfig> {
    let project_config = project_dir.map(|dir| dir.join(CONFIG_FILE_NAME));
    let local_config = Path::new(CONFIG_FILE_NAME);

    let mut cfg = match project_config.filter(|p| p.exists()) {
        Some(path) => read_config(&path)?,
        None if local_config.exists() => read_config(local_config)?,
        None => AppConfig::default(),
    };

    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

pub fn read_config(path: &Path) -> anyhow::Result<AppConfig> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    toml::from_str::<AppConfig>(&s).with_context(|| format!("Failed to parse config {:?}", path))
}

/// Apply `MODELYARD_*` overrides; unparsable values are ignored with a warning.
pub fn apply_env_overrides<F>(cfg: &mut AppConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| var(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("MODELYARD_MAX_CONCURRENCY") {
        match v.trim().parse::<usize>() {
            Ok(n) if n > 0 => cfg.scheduler.max_concurrency = n,
            _ => tracing::warn!(value = %v, "ignoring invalid MODELYARD_MAX_CONCURRENCY"),
        }
    }
    if let Some(v) = get("MODELYARD_SYNC_INTERVAL_MS") {
        match v.trim().parse::<u64>() {
            Ok(n) if n > 0 => cfg.sync.interval_ms = n,
            _ => tracing::warn!(value = %v, "ignoring invalid MODELYARD_SYNC_INTERVAL_MS"),
        }
    }
    if let Some(v) = get("MODELYARD_LOG_LEVEL") {
        cfg.logging.level = v;
    }
}
