//! Hub settings.
//! Read from the platform-specific config directory via `directories::ProjectDirs`,
//! with environment variables taking precedence over the file.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::actions::CoordinateSystem;
use crate::agent::AgentConfig;
use crate::ledger::LedgerConfig;
use crate::model::ModelConfig;
use crate::server::ServerConfig;

/// Settings for the whole hub process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address the HTTP server binds to
    pub bind_addr: String,
    /// API key -> account id
    pub api_keys: HashMap<String, String>,
    /// Seconds a new socket has to send `auth`
    pub auth_timeout_secs: u64,
    /// Seconds between keepalive pings
    pub ping_interval_secs: u64,
    /// Deadline for one device command
    pub command_timeout_secs: u64,
    pub max_devices_per_account: usize,
    pub max_dashboards_per_account: usize,
    /// Model API base URL
    pub base_url: String,
    /// Model API key
    pub api_key: String,
    /// Model name
    pub model_name: String,
    /// Maximum retries for model requests
    pub max_retries: u32,
    /// Retry delay in seconds
    pub retry_delay: u64,
    /// Language code ("en" or "zh")
    pub lang: String,
    /// Coordinate system ("absolute" or "relative")
    pub coordinate_system: String,
    /// Maximum steps per session
    pub max_steps: u32,
    /// Consecutive unchanged screens before the stuck hint
    pub stuck_threshold: u32,
    /// Pause after each step in milliseconds
    pub step_settle_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            api_keys: HashMap::new(),
            auth_timeout_secs: 10,
            ping_interval_secs: 30,
            command_timeout_secs: 30,
            max_devices_per_account: 10,
            max_dashboards_per_account: 16,
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "autoglm-phone-9b".to_string(),
            max_retries: 3,
            retry_delay: 2,
            lang: "en".to_string(),
            coordinate_system: "absolute".to_string(),
            max_steps: 30,
            stuck_threshold: 3,
            step_settle_ms: 800,
        }
    }
}

/// Parse `key=account,key2=account2`. Malformed pairs are skipped.
pub fn parse_api_keys(value: &str) -> HashMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| {
            let (key, account) = pair.split_once('=')?;
            let (key, account) = (key.trim(), account.trim());
            if key.is_empty() || account.is_empty() {
                None
            } else {
                Some((key.to_string(), account.to_string()))
            }
        })
        .collect()
}

impl ServerSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "moderras", "phone-agent-hub")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load the settings file (or defaults), then apply the process environment.
    pub fn load() -> Self {
        let mut settings: Self = Self::settings_path()
            .and_then(|path| fs::read_to_string(&path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings
    }

    /// Apply overrides from a variable lookup. Unparseable numbers are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(key: &str, raw: Option<String>, target: &mut T) {
            if let Some(raw) = raw {
                match raw.trim().parse() {
                    Ok(value) => *target = value,
                    Err(_) => warn!(key, value = %raw, "Ignoring unparseable setting"),
                }
            }
        }

        if let Some(addr) = lookup("HUB_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(keys) = lookup("HUB_API_KEYS") {
            self.api_keys = parse_api_keys(&keys);
        }
        if let Some(url) = lookup("MODEL_BASE_URL") {
            self.base_url = url;
        }
        if let Some(key) = lookup("MODEL_API_KEY") {
            self.api_key = key;
        }
        if let Some(name) = lookup("MODEL_NAME") {
            self.model_name = name;
        }
        if let Some(lang) = lookup("AGENT_LANG") {
            self.lang = lang;
        }
        if let Some(coords) = lookup("COORDINATE_SYSTEM") {
            self.coordinate_system = coords;
        }
        number("MODEL_MAX_RETRIES", lookup("MODEL_MAX_RETRIES"), &mut self.max_retries);
        number("MODEL_RETRY_DELAY", lookup("MODEL_RETRY_DELAY"), &mut self.retry_delay);
        number("AGENT_MAX_STEPS", lookup("AGENT_MAX_STEPS"), &mut self.max_steps);
        number(
            "AGENT_STUCK_THRESHOLD",
            lookup("AGENT_STUCK_THRESHOLD"),
            &mut self.stuck_threshold,
        );
        number(
            "COMMAND_TIMEOUT_SECS",
            lookup("COMMAND_TIMEOUT_SECS"),
            &mut self.command_timeout_secs,
        );
        number("STEP_SETTLE_MS", lookup("STEP_SETTLE_MS"), &mut self.step_settle_ms);
    }

    /// Coordinate system, falling back to absolute on unknown values.
    pub fn coordinates(&self) -> CoordinateSystem {
        self.coordinate_system.parse().unwrap_or_else(|e: String| {
            warn!(error = %e, "Falling back to absolute coordinates");
            CoordinateSystem::Absolute
        })
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig::default()
            .with_max_steps(self.max_steps)
            .with_stuck_threshold(self.stuck_threshold)
            .with_settle_delay(Duration::from_millis(self.step_settle_ms))
            .with_coordinates(self.coordinates())
            .with_lang(&self.lang)
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::default()
            .with_base_url(&self.base_url)
            .with_api_key(&self.api_key)
            .with_model_name(&self.model_name)
            .with_max_retries(self.max_retries)
            .with_retry_delay(self.retry_delay)
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig::default()
            .with_command_timeout(Duration::from_secs(self.command_timeout_secs))
            .with_max_devices(self.max_devices_per_account)
            .with_max_dashboards(self.max_dashboards_per_account)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::default()
            .with_auth_timeout(Duration::from_secs(self.auth_timeout_secs))
            .with_ping_interval(Duration::from_secs(self.ping_interval_secs.max(1)))
    }
}
