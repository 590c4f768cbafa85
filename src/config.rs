use crate::constants::{DEFAULT_QUOTA_REFRESH_S, DEFAULT_RETRY_DELAY_MS};
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Accepts a JSON array or a comma-separated string in config.json.
    #[serde(deserialize_with = "deserialize_api_keys")]
    pub api_keys: Vec<String>,
    pub proxy_enabled: bool,
    pub proxy_url: String,
    pub debug: bool,
    pub retry_delay_ms: u64,
    pub quota_refresh_s: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8045,
            api_keys: Vec::new(),
            proxy_enabled: false,
            proxy_url: String::new(),
            debug: false,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            quota_refresh_s: DEFAULT_QUOTA_REFRESH_S,
        }
    }
}

fn deserialize_api_keys<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Keys {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Keys::deserialize(deserializer)? {
        Keys::List(list) => normalize_keys(list),
        Keys::Joined(s) => parse_key_string(&s),
    })
}

fn normalize_keys(keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

fn parse_key_string(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
            return normalize_keys(list);
        }
    }
    normalize_keys(trimmed.split(',').map(|s| s.to_string()).collect())
}

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AppConfig {
    /// Reads config.json from the working directory when present, then lets
    /// AG2API_* environment variables win over file values.
    pub fn load() -> AppResult<Self> {
        let mut config = Self::load_file(Path::new(CONFIG_FILE))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_file(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("AG2API_HOST") {
            if !host.trim().is_empty() {
                self.host = host.trim().to_string();
            }
        }

        if let Ok(port) = std::env::var("AG2API_PORT") {
            match port.trim().parse::<u16>() {
                Ok(p) if p > 0 => {
                    info!("Using port from environment: {}", p);
                    self.port = p;
                }
                _ => warn!("Ignoring invalid AG2API_PORT value: {}", port),
            }
        }

        if let Ok(keys) = std::env::var("AG2API_API_KEYS") {
            self.api_keys = parse_key_string(&keys);
        }

        if let Ok(enabled) = std::env::var("AG2API_PROXY_ENABLED") {
            match parse_env_bool(&enabled) {
                Some(v) => self.proxy_enabled = v,
                None => warn!("Ignoring invalid AG2API_PROXY_ENABLED value: {}", enabled),
            }
        }

        if let Ok(url) = std::env::var("AG2API_PROXY_URL") {
            if !url.trim().is_empty() {
                self.proxy_url = url.trim().to_string();
            }
        }

        if let Ok(debug) = std::env::var("AG2API_DEBUG") {
            if let Some(v) = parse_env_bool(&debug) {
                self.debug = v;
            }
        }

        if let Ok(delay) = std::env::var("AG2API_RETRY_DELAY_MS") {
            match delay.trim().parse::<u64>() {
                Ok(ms) => self.retry_delay_ms = ms,
                Err(_) => warn!("Ignoring invalid AG2API_RETRY_DELAY_MS value: {}", delay),
            }
        }

        if let Ok(interval) = std::env::var("AG2API_QUOTA_REFRESH_S") {
            match interval.trim().parse::<u64>() {
                Ok(s) if s > 0 => self.quota_refresh_s = s,
                _ => warn!("Ignoring invalid AG2API_QUOTA_REFRESH_S value: {}", interval),
            }
        }
    }
}
