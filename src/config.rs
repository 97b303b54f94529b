use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

/// Config file read when `--config` is not given and the file exists.
pub const DEFAULT_CONFIG_FILE: &str = "docsync.toml";

/// Client configuration.
///
/// Read from TOML, every field optional:
///
/// ```toml
/// base_url = "http://localhost:8000"
/// connect_timeout_secs = 5
/// state_db = "docsync_state.db"
/// log_filter = "info"
/// ```
///
/// `DOCSYNC_API_URL` and `DOCSYNC_STATE_DB` override the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend base URL, without a trailing slash.
    pub base_url: String,
    pub connect_timeout_secs: u64,
    /// SQLite file holding the transcript, last comparison and reports.
    pub state_db: PathBuf,
    /// `tracing-subscriber` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: "http://localhost:8000".to_string(),
            connect_timeout_secs: 5,
            state_db: PathBuf::from("docsync_state.db"),
            log_filter: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(s).map_err(|e| ChatError::Config(e.to_string()))?;
        Ok(config.normalized())
    }

    /// Load from `path` (which must exist) or from [`DEFAULT_CONFIG_FILE`] if
    /// present, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_file = match path {
            Some(p) => Some(read_config_file(p)?),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Some(read_config_file(default)?)
                } else {
                    None
                }
            }
        };
        let config = match from_file {
            Some(text) => Self::from_toml_str(&text)?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides(|name| std::env::var(name).ok()))
    }

    /// Apply `DOCSYNC_*` overrides using `lookup` to read variables.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DOCSYNC_API_URL").filter(|v| !v.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(db) = lookup("DOCSYNC_STATE_DB").filter(|v| !v.trim().is_empty()) {
            self.state_db = PathBuf::from(db);
        }
        self.normalized()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Absolute URL for an endpoint path such as `/chat`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn normalized(mut self) -> Self {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        self
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| ChatError::Config(format!("cannot read {}: {}", path.display(), e)))
}
