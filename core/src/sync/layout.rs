use std::path::{Path, PathBuf};

use crate::config::CONFIG_FILE_NAME;
use crate::state::StateFiles;

pub const MODELS_DIR: &str = "models";
pub const STATE_DIR: &str = "state";

/// On-disk layout of a project directory.
///
/// ```text
/// <project>/
///   modelyard.toml
///   models/<name>.sql
///   state/<state_kind>_<kind>_state.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODELS_DIR)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn model_path(&self, file_name: &str) -> PathBuf {
        self.models_dir().join(file_name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn state_files(&self) -> StateFiles {
        StateFiles::new(self.state_dir())
    }

    /// Create the project, models and state directories.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.models_dir())?;
        std::fs::create_dir_all(self.state_dir())
    }
}
