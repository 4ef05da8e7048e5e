//! Local settings storage
//!
//! A small TOML file of user choices that must survive restarts. Every
//! update is written through to disk immediately.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

use super::Permission;

/// Persisted user settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub notification_permission: Permission,

    /// Whether the real-time client should be enabled at all
    #[serde(default = "default_realtime_enabled")]
    pub realtime_enabled: bool,
}

fn default_realtime_enabled() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            notification_permission: Permission::Default,
            realtime_enabled: default_realtime_enabled(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("No user config directory available")]
    NoConfigDir,

    #[error("Failed to access settings file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Settings backed by a file
#[derive(Debug)]
pub struct LocalSettings {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl LocalSettings {
    /// Open the settings file at `path`; a missing file yields defaults
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let current = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(|e| SettingsError::Parse {
                path: path.clone(),
                error: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(source) => return Err(SettingsError::Io { path, source }),
        };

        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    /// Open `<config dir>/ratefeed/settings.toml`
    pub fn open_default() -> Result<Self, SettingsError> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Self::open(dir.join("ratefeed").join("settings.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply `change` and persist the result
    ///
    /// The in-memory copy is only replaced once the file has been written.
    pub fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<Settings, SettingsError> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = current.clone();
        change(&mut next);

        if next != *current {
            self.write(&next)?;
            *current = next.clone();
        }
        Ok(next)
    }

    fn write(&self, settings: &Settings) -> Result<(), SettingsError> {
        let content = toml::to_string_pretty(settings)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.path, content).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = ?self.path, "Saved settings");
        Ok(())
    }
}
