//! Application settings store.
//!
//! One JSON document per installation. A missing or malformed file never fails
//! the caller; it degrades to defaults and logs a warning, so the panel can
//! always come up and let the user fix the paths from the UI.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default location of the settings document, relative to the install root.
pub const DEFAULT_CONFIG_PATH: &str = "data/llpanel_config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Path to the QQ client executable.
    #[serde(default)]
    pub client_path: String,
    /// Path to the PMHQ bridge executable.
    #[serde(default)]
    pub bridge_path: String,
    /// Path to the bot runtime interpreter (e.g. a bundled Node binary).
    #[serde(default)]
    pub runtime_path: String,
    /// Path to the LLBot entry script run under the runtime.
    #[serde(default)]
    pub bot_script_path: String,
    /// Account to log in automatically on startup. Empty means manual login.
    #[serde(default)]
    pub auto_login_uin: String,
    /// Run the QQ client without a visible window.
    #[serde(default)]
    pub headless: bool,
    /// Extra command executed after all services are up.
    #[serde(default)]
    pub startup_command: String,
    /// Days of log files to keep before rotation deletes them.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
    /// Generic settings bag. Keys written by newer panel versions (or by the
    /// user) survive a load/save cycle untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_log_retention_days() -> u32 {
    7
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client_path: String::new(),
            bridge_path: String::new(),
            runtime_path: String::new(),
            bot_script_path: String::new(),
            auto_login_uin: String::new(),
            headless: false,
            startup_command: String::new(),
            log_retention_days: default_log_retention_days(),
            extra: Map::new(),
        }
    }
}

/// Owns the on-disk settings document and an in-memory cache of it.
pub struct ConfigStore {
    path: PathBuf,
    config: AppConfig,
    dirty: bool,
}

impl ConfigStore {
    /// Load the settings document at `path`. Absent or unparsable files yield
    /// defaults; the latter is logged so the user's broken file is noticed.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<AppConfig>(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(
                        "Settings file '{}' is malformed ({}), using defaults",
                        path.display(),
                        e
                    );
                    AppConfig::default()
                }
            },
            Err(_) => AppConfig::default(),
        };

        Self {
            path,
            config,
            dirty: false,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Replace the in-memory settings. Marks the store dirty.
    pub fn update(&mut self, config: AppConfig) {
        if config != self.config {
            self.config = config;
            self.dirty = true;
        }
    }

    /// Read a value from the generic settings bag.
    pub fn get_setting(&self, key: &str) -> Option<&Value> {
        self.config.extra.get(key)
    }

    /// Write a value into the generic settings bag. Marks the store dirty.
    pub fn set_setting(&mut self, key: &str, value: Value) {
        self.config.extra.insert(key.to_string(), value);
        self.dirty = true;
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty
    }

    /// Persist the current settings as pretty-printed JSON.
    pub fn save(&mut self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(&self.path, json)?;
        self.dirty = false;
        tracing::info!("Settings saved to '{}'", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
