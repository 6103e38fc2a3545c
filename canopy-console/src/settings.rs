//! Console settings

use std::path::PathBuf;

use canopy_detect::{default_candidates, CanCandidate, ScannerConfig};
use canopy_tree::{OpenMode, TreeConfig, DEFAULT_SETTLE_DELAY_MS};
use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;

/// Console settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Pause after opening a channel, in milliseconds
    pub settle_delay_ms: u64,
    /// Where channel opens run
    pub open_mode: OpenMode,
    /// Discover buses on startup
    pub auto_scan: bool,
    /// Serial port scanner configuration
    pub scanner: ScannerConfig,
    /// CAN channels to probe
    pub can_candidates: Vec<CanCandidate>,
    /// SocketCAN channels backed by virtual hardware
    pub virtual_can: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            open_mode: OpenMode::Deferred,
            auto_scan: true,
            scanner: ScannerConfig::default(),
            can_candidates: default_candidates(),
            virtual_can: vec!["vcan0".to_string(), "vcan1".to_string()],
        }
    }
}

/// Resolve the config directory from `$XDG_CONFIG_HOME` and the home directory
fn config_dir_from(xdg_config: Option<String>, home: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(xdg_config) = xdg_config {
        let path = PathBuf::from(xdg_config);
        if path.is_absolute() {
            return Some(path.join("canopy"));
        }
    }

    // XDG default
    home.map(|h| h.join(".config").join("canopy"))
}

impl Settings {
    /// Get the config directory for canopy
    fn config_dir() -> Option<PathBuf> {
        config_dir_from(std::env::var("XDG_CONFIG_HOME").ok(), dirs::home_dir())
    }

    /// Get the settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from disk, falling back to defaults
    pub fn load() -> Self {
        Self::settings_path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|s| Self::from_json(&s))
            .unwrap_or_default()
    }

    /// Parse settings, falling back to defaults on malformed input
    pub fn from_json(json: &str) -> Self {
        serde_json::from_str(json).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed settings: {}", e);
            Self::default()
        })
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<PathBuf, ConsoleError> {
        let path = Self::settings_path()
            .ok_or_else(|| ConsoleError::Settings("could not determine settings path".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConsoleError::Settings(format!("failed to create settings directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConsoleError::Settings(format!("failed to serialize settings: {}", e)))?;
        std::fs::write(&path, json)
            .map_err(|e| ConsoleError::Settings(format!("failed to write settings: {}", e)))?;

        Ok(path)
    }

    /// Tree configuration derived from these settings
    pub fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            settle_delay_ms: self.settle_delay_ms,
            open_mode: self.open_mode,
        }
    }
}
