//! Process-wide tunables, constructed once at startup and shared by `Arc`.
//!
//! Mirrors the enumerated configuration surface: heartbeat cadence, TTL,
//! replay window size, auth/scan timeouts and the broadcast MAC key. No
//! component reads these from a process global; they are injected.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading or validating a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Fully-resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub ttl_default: u8,
    pub replay_window_size: u32,
    pub auth_timeout: Duration,
    pub scan_timeout: Duration,
    pub broadcast_mac_key: [u8; 32],
    /// Tick granularity for watchdog/timer loops.
    pub tick_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_miss_threshold: 3,
            ttl_default: 8,
            replay_window_size: 100,
            auth_timeout: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(10),
            broadcast_mac_key: DEFAULT_BROADCAST_MAC_KEY,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Process-wide default for the broadcast MAC key.
///
/// Real deployments should override this via [`Config::load`]; it is
/// baked in here only so `Config::default()` is usable in tests without
/// a TOML file.
const DEFAULT_BROADCAST_MAC_KEY: [u8; 32] = *b"canopy-default-broadcast-mac-key";

/// All-`Option` mirror of [`Config`] used to parse a partial TOML document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    heartbeat_interval_secs: Option<u64>,
    heartbeat_miss_threshold: Option<u32>,
    ttl_default: Option<u8>,
    replay_window_size: Option<u32>,
    auth_timeout_secs: Option<u64>,
    scan_timeout_secs: Option<u64>,
    broadcast_mac_key_hex: Option<String>,
    tick_interval_secs: Option<u64>,
}

impl Config {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// any field the document omits.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parses a TOML document, merging it over [`Config::default`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let base = Self::default();

        let broadcast_mac_key = match raw.broadcast_mac_key_hex {
            Some(hex_str) => parse_mac_key_hex(&hex_str)?,
            None => base.broadcast_mac_key,
        };

        let cfg = Self {
            heartbeat_interval: raw
                .heartbeat_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(base.heartbeat_interval),
            heartbeat_miss_threshold: raw
                .heartbeat_miss_threshold
                .unwrap_or(base.heartbeat_miss_threshold),
            ttl_default: raw.ttl_default.unwrap_or(base.ttl_default),
            replay_window_size: raw.replay_window_size.unwrap_or(base.replay_window_size),
            auth_timeout: raw
                .auth_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.auth_timeout),
            scan_timeout: raw
                .scan_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.scan_timeout),
            broadcast_mac_key,
            tick_interval: raw
                .tick_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(base.tick_interval),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.replay_window_size == 0 {
            return Err(ConfigError::InvalidValue(
                "replay_window_size must be > 0".into(),
            ));
        }
        if self.ttl_default == 0 {
            return Err(ConfigError::InvalidValue("ttl_default must be >= 1".into()));
        }
        if self.heartbeat_miss_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_miss_threshold must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_mac_key_hex(s: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(s.get(i..i + 2).unwrap_or(""), 16)
                .map_err(|_| ConfigError::InvalidValue("broadcast_mac_key_hex not hex".into()))
        })
        .collect::<Result<Vec<u8>, _>>()?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidValue("broadcast_mac_key_hex must be 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat_miss_threshold, 3);
        assert_eq!(cfg.ttl_default, 8);
        assert_eq!(cfg.replay_window_size, 100);
        assert_eq!(cfg.auth_timeout, Duration::from_secs(10));
        assert_eq!(cfg.scan_timeout, Duration::from_secs(10));
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg = Config::from_toml_str("ttl_default = 4\nheartbeat_miss_threshold = 5\n").unwrap();
        assert_eq!(cfg.ttl_default, 4);
        assert_eq!(cfg.heartbeat_miss_threshold, 5);
        assert_eq!(cfg.replay_window_size, 100);
    }

    #[test]
    fn zero_replay_window_is_rejected() {
        let err = Config::from_toml_str("replay_window_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn broadcast_mac_key_hex_round_trips() {
        let hex_key = "11".repeat(32);
        let cfg = Config::from_toml_str(&format!("broadcast_mac_key_hex = \"{hex_key}\"\n")).unwrap();
        assert_eq!(cfg.broadcast_mac_key, [0x11u8; 32]);
    }
}
