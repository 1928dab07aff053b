// =============================================================================
// Runtime Configuration — relay settings and upstream credentials
// =============================================================================
//
// Settings are read from an optional JSON file and then overridden from the
// environment.  All fields carry `#[serde(default)]` so that a partial file
// (or none at all) still yields a usable configuration.
//
// Credentials are kept apart from the serialisable settings so they are never
// written back or logged.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Environment variable holding the upstream API key.
pub const API_KEY_VAR: &str = "BINANCE_API_KEY";
/// Environment variable holding the upstream API secret.
pub const API_SECRET_VAR: &str = "BINANCE_API_SECRET";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()]
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_history_limit() -> usize {
    30
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_subscriber_queue() -> usize {
    256
}

// =============================================================================
// Errors
// =============================================================================

/// Configuration problems detected at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing upstream credentials: {0} is not set")]
    MissingCredential(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level settings for the relay process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols relayed to subscribers, uppercase tickers.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Candle interval shared by every symbol (e.g. "1m").
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Number of candles retained per symbol.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Address the HTTP / WebSocket listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bounded outbound queue per subscriber.  A subscriber whose queue fills
    /// up is dropped.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            interval: default_interval(),
            history_limit: default_history_limit(),
            bind_addr: default_bind_addr(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read relay config from {}", path.display()))?;

        let config = Self::from_json(&content)
            .with_context(|| format!("failed to parse relay config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            interval = %config.interval,
            "relay config loaded"
        );

        Ok(config)
    }

    /// Parse a JSON document.  Symbols are uppercased and deduplicated the
    /// same way `RELAY_SYMBOLS` is, since upstream ticks always carry
    /// uppercase tickers.
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(content)?;
        config.symbols = normalise_symbols(config.symbols.iter().map(String::as_str));
        Ok(config)
    }

    /// Apply `RELAY_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source.  Split out from
    /// [`apply_env`](Self::apply_env) so tests do not touch process globals.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(syms) = lookup("RELAY_SYMBOLS") {
            self.symbols = parse_symbols(&syms);
        }
        if let Some(interval) = lookup("RELAY_INTERVAL") {
            self.interval = interval.trim().to_string();
        }
        if let Some(limit) = lookup("RELAY_HISTORY_LIMIT") {
            self.history_limit = limit
                .trim()
                .parse()
                .with_context(|| format!("RELAY_HISTORY_LIMIT is not a number: {limit}"))?;
        }
        if let Some(addr) = lookup("RELAY_BIND_ADDR") {
            self.bind_addr = addr.trim().to_string();
        }
        if let Some(queue) = lookup("RELAY_SUBSCRIBER_QUEUE") {
            self.subscriber_queue = queue
                .trim()
                .parse()
                .with_context(|| format!("RELAY_SUBSCRIBER_QUEUE is not a number: {queue}"))?;
        }
        Ok(())
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("symbol list is empty".into()));
        }
        if self.interval.is_empty() {
            return Err(ConfigError::Invalid("interval is empty".into()));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::Invalid("history_limit must be at least 1".into()));
        }
        if self.subscriber_queue == 0 {
            return Err(ConfigError::Invalid("subscriber_queue must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_symbols(raw: &str) -> Vec<String> {
    normalise_symbols(raw.split(','))
}

fn normalise_symbols<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for sym in raw.into_iter().map(|s| s.trim().to_uppercase()) {
        if !sym.is_empty() && !symbols.contains(&sym) {
            symbols.push(sym);
        }
    }
    symbols
}

// =============================================================================
// Credentials
// =============================================================================

/// Upstream API credentials.  Both values are required by the live feed.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &'static str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingCredential(name))
        };

        Ok(Self {
            api_key: read(API_KEY_VAR)?,
            api_secret: read(API_SECRET_VAR)?,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "SOLUSDT"]);
        assert_eq!(cfg.interval, "1m");
        assert_eq!(cfg.history_limit, 30);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "history_limit": 5 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.history_limit, 5);
        assert_eq!(cfg.interval, "1m");
        assert_eq!(cfg.bind_addr, "0.0.0.0:3001");
    }

    #[test]
    fn file_symbols_are_uppercased_and_deduplicated() {
        let json = r#"{ "symbols": ["btcusdt", " solusdt ", "BTCUSDT", ""] }"#;
        let cfg = RuntimeConfig::from_json(json).unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "SOLUSDT"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_normalised() {
        let env = vars(&[
            ("RELAY_SYMBOLS", " btcusdt, ethusdt,,BTCUSDT "),
            ("RELAY_HISTORY_LIMIT", "12"),
        ]);
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(|k| env.get(k).cloned()).unwrap();

        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.history_limit, 12);
        assert_eq!(cfg.interval, "1m");
    }

    #[test]
    fn bad_numeric_override_is_an_error() {
        let env = vars(&[("RELAY_HISTORY_LIMIT", "thirty")]);
        let mut cfg = RuntimeConfig::default();
        assert!(cfg.apply_overrides(|k| env.get(k).cloned()).is_err());
    }

    #[test]
    fn validate_rejects_zero_history() {
        let cfg = RuntimeConfig {
            history_limit: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn credentials_require_both_secrets() {
        let env = vars(&[(API_KEY_VAR, "key")]);
        let err = Credentials::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert_eq!(err, ConfigError::MissingCredential(API_SECRET_VAR));

        let env = vars(&[(API_KEY_VAR, "key"), (API_SECRET_VAR, "  ")]);
        assert!(Credentials::from_lookup(|k| env.get(k).cloned()).is_err());

        let env = vars(&[(API_KEY_VAR, "key"), (API_SECRET_VAR, "hunter2")]);
        let creds = Credentials::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert_eq!(creds.api_key, "key");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
