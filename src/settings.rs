use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batcher::BatchSettings;
use crate::compression::CompressionThresholds;
use crate::spree::SpreeSettings;
use crate::sync::SyncSettings;
use crate::transport::{ReconnectPolicy, TransportSettings};

pub const ENV_LOG_PATH: &str = "LOGSYNC_LOG_PATH";
pub const ENV_SERVER_URL: &str = "LOGSYNC_SERVER_URL";
pub const ENV_AUTH_TOKEN: &str = "LOGSYNC_AUTH_TOKEN";
pub const ENV_USER_ID: &str = "LOGSYNC_USER_ID";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub log_path: Option<PathBuf>,
    pub store_directory: PathBuf,
    pub store_id: String,
    pub server_url: Option<String>,
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub idle_flush_ms: u64,
    pub compress_above_events: usize,
    pub compress_above_bytes: usize,
    pub spree_window_secs: u64,
    pub excluded_damage_types: Vec<String>,
    pub regex_budget_ms: u64,
    pub max_events: usize,
    pub request_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub cursor_debounce_ms: u64,
    pub sync_page_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let spree = SpreeSettings::default();
        let compression = CompressionThresholds::default();

        Self {
            log_path: None,
            store_directory: default_store_directory(),
            store_id: "logs-store".to_string(),
            server_url: None,
            auth_token: None,
            user_id: None,
            poll_interval_ms: 5_000,
            batch_size: 8,
            idle_flush_ms: 2_500,
            compress_above_events: compression.max_plain_events,
            compress_above_bytes: compression.max_plain_bytes,
            spree_window_secs: spree.window.as_secs(),
            excluded_damage_types: spree.excluded_damage_types,
            regex_budget_ms: 150,
            max_events: 1_000,
            request_timeout_ms: 30_000,
            send_timeout_ms: 5_000,
            reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            cursor_debounce_ms: 2_000,
            sync_page_size: 100,
        }
    }
}

fn default_store_directory() -> PathBuf {
    std::env::var("USERPROFILE")
        .or_else(|_| std::env::var("HOME"))
        .map(|home_dir| Path::new(&home_dir).join(".logsync"))
        .unwrap_or_else(|_| PathBuf::from(".logsync"))
}

impl EngineSettings {
    /// Reads settings from a JSON file (missing file means defaults), then
    /// applies `LOGSYNC_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, String> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<EngineSettings>(&content).map_err(|error| {
                format!("Failed to parse settings '{}': {error}", path.display())
            })?,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No settings file, using defaults");
                EngineSettings::default()
            }
            Err(error) => {
                return Err(format!("Failed to read settings '{}': {error}", path.display()));
            }
        };

        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(log_path) = non_empty(ENV_LOG_PATH) {
            self.log_path = Some(PathBuf::from(log_path));
        }
        if let Some(server_url) = non_empty(ENV_SERVER_URL) {
            self.server_url = Some(server_url);
        }
        if let Some(auth_token) = non_empty(ENV_AUTH_TOKEN) {
            self.auth_token = Some(auth_token);
        }
        if let Some(user_id) = non_empty(ENV_USER_ID) {
            self.user_id = Some(user_id);
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn regex_budget(&self) -> Duration {
        Duration::from_millis(self.regex_budget_ms)
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            size_threshold: self.batch_size.max(1),
            idle_delay: Duration::from_millis(self.idle_flush_ms),
            compression: CompressionThresholds {
                max_plain_events: self.compress_above_events,
                max_plain_bytes: self.compress_above_bytes,
            },
        }
    }

    pub fn spree_settings(&self) -> SpreeSettings {
        SpreeSettings {
            window: Duration::from_secs(self.spree_window_secs),
            excluded_damage_types: self.excluded_damage_types.clone(),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            page_size: self.sync_page_size,
            cursor_debounce: Duration::from_millis(self.cursor_debounce_ms),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    /// `None` until a server URL, token and user id are all configured.
    pub fn transport_settings(&self) -> Option<TransportSettings> {
        Some(TransportSettings {
            server_url: self.server_url.clone()?,
            auth_token: self.auth_token.clone()?,
            user_id: self.user_id.clone()?,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            reconnect: self.reconnect_policy(),
        })
    }
}
