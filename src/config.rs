use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILENAME: &str = "stadia_bridge_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long one transport read may block
    pub read_timeout_ms: u64,
    /// Motors are switched off after this long without a request, `None` keeps them running
    pub vibration_timeout_ms: Option<u64>,
    /// Delay before the Stadia button is released again, `None` disables it
    pub guide_release_ms: Option<u64>,
    pub max_devices: usize,
    pub refresh_interval_ms: u64,
    /// Create virtual Xbox pads for connected controllers
    pub virtual_pads: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10,
            vibration_timeout_ms: Some(2000),
            guide_release_ms: Some(200),
            max_devices: 4,
            refresh_interval_ms: 1000,
            virtual_pads: true,
        }
    }
}

impl BridgeConfig {
    /// Load from next to the executable, falling back to defaults
    pub fn load() -> Self {
        Self::load_from(&Self::config_path()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Option<Self> {
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {:?}", path);
                    Some(config)
                }
                Err(e) => {
                    log::error!("Failed to parse config: {}", e);
                    None
                }
            },
            Err(e) => {
                log::error!("Failed to read config file: {}", e);
                None
            }
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        log::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_FILENAME)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            // A zero timeout would turn the input loop into a spin
            read_timeout: Duration::from_millis(self.read_timeout_ms.max(1)),
            vibration_timeout: self.vibration_timeout_ms.map(Duration::from_millis),
            guide_release: self.guide_release_ms.map(Duration::from_millis),
        }
    }
}

/// Per-session timing, derived from [`BridgeConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub read_timeout: Duration,
    pub vibration_timeout: Option<Duration>,
    pub guide_release: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        BridgeConfig::default().session_config()
    }
}
