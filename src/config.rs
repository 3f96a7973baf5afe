//! Runtime configuration from the process environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::client::ProxySettings;
use crate::services::presets::MatchRule;

pub const DEFAULT_REGISTRY_FILE: &str = "climate-tray.json";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PROXY_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct Config {
    /// JSON file with the configured devices and presets.
    pub registry_file: PathBuf,
    /// Recurring poll cadence; the scheduler clamps it to its minimum.
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub proxy: Option<ProxySettings>,
    pub match_rule: MatchRule,
    pub version_check_enabled: bool,
    /// Where published build info is fetched from. No check without it.
    pub version_check_url: Option<String>,
    /// Talk to the in-process simulator instead of real controllers.
    pub simulate: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let non_empty = |key: &str| var(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let registry_file = non_empty("REGISTRY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_FILE));

        let poll_secs = parse_or("POLL_INTERVAL_SECS", non_empty("POLL_INTERVAL_SECS"), DEFAULT_POLL_INTERVAL_SECS)?;
        let timeout_secs = parse_or("HTTP_TIMEOUT_SECS", non_empty("HTTP_TIMEOUT_SECS"), DEFAULT_HTTP_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err("HTTP_TIMEOUT_SECS must be greater than zero".to_string());
        }

        let proxy = match non_empty("PROXY_HOST") {
            Some(host) => Some(ProxySettings {
                host,
                port: parse_or("PROXY_PORT", non_empty("PROXY_PORT"), DEFAULT_PROXY_PORT)?,
                user: non_empty("PROXY_USER"),
                password: non_empty("PROXY_PASSWORD"),
            }),
            None => None,
        };

        let match_rule = match non_empty("PRESET_MATCH_RULE") {
            Some(s) => s.parse::<MatchRule>().map_err(|e| format!("PRESET_MATCH_RULE: {}", e))?,
            None => MatchRule::default(),
        };

        Ok(Config {
            registry_file,
            poll_interval: Duration::from_secs(poll_secs),
            http_timeout: Duration::from_secs(timeout_secs),
            proxy,
            match_rule,
            version_check_enabled: non_empty("VERSION_CHECK_ENABLED").map(|s| parse_flag(&s)).unwrap_or(true),
            version_check_url: non_empty("VERSION_CHECK_URL"),
            simulate: non_empty("SIMULATE").map(|s| parse_flag(&s)).unwrap_or(false),
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes")
}

fn parse_or<T: std::str::FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, String> {
    match value {
        Some(s) => s.parse::<T>().map_err(|_| format!("{} must be a non-negative integer, got {:?}", key, s)),
        None => Ok(default),
    }
}
