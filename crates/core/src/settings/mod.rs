//! User settings persisted between sessions.
//!
//! Loading and saving never fail the caller: problems are logged and the
//! defaults (or the in-memory values) stay in effect.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Playback rate of the audio player.
    pub speed: f64,
    /// Player volume in percent.
    pub volume: u8,
    pub tempo_bpm: f64,
    pub accent_interval: u32,
    pub recorded_bpm: Option<f64>,
    pub target_bpm: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            speed: 1.0,
            volume: 100,
            tempo_bpm: 120.0,
            accent_interval: 4,
            recorded_bpm: None,
            target_bpm: None,
        }
    }
}

/// JSON file holding [`Settings`].
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Store backed by the JSON file at `path`. Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored settings, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(&self) -> Settings {
        if !self.path.exists() {
            return Settings::default();
        }

        match self.try_load() {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(%err, path = %self.path.display(), "failed to load settings");
                Settings::default()
            }
        }
    }

    /// Writes the settings. Returns whether the write succeeded.
    pub fn save(&self, settings: &Settings) -> bool {
        match self.try_save(settings) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, path = %self.path.display(), "failed to save settings");
                false
            }
        }
    }

    fn try_load(&self) -> Result<Settings> {
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn try_save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}
