//! Storage layer for settings (tasks are in SQLite)

use crate::error::RdmError;
use rdm_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;

const SETTINGS_FILE: &str = "settings.json";

/// Storage manager for RDM data
#[derive(Clone, Debug)]
pub struct Storage {
    /// Data directory
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, RdmError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the task database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("tasks.db")
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Load settings. A missing file is created with defaults; a malformed one is ignored.
    pub async fn load_settings(&self) -> Result<Settings, RdmError> {
        let path = self.data_dir.join(SETTINGS_FILE);

        if !path.exists() {
            let settings = Settings::default();
            self.save_settings(&settings).await?;
            return Ok(settings);
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => Ok(settings.validated()),
            Err(e) => {
                tracing::warn!("Ignoring malformed settings file {}: {}", path.display(), e);
                Ok(Settings::default())
            }
        }
    }

    /// Save settings
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), RdmError> {
        let path = self.data_dir.join(SETTINGS_FILE);
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&path, content).await?;
        Ok(())
    }
}
