// Client-side defaults and configuration overrides.
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub(crate) const DEFAULT_MIN_RECONNECT_DELAY_MS: u64 = 100;
pub(crate) const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 60_000;
pub(crate) const DEFAULT_MAX_SEND_ATTEMPTS: u64 = 5;
pub(crate) const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 1024;

// Floors keep a mistyped override from spinning the reconnect loop.
pub(crate) const MIN_RECONNECT_DELAY_FLOOR_MS: u64 = 10;
pub(crate) const MAX_RECONNECT_DELAY_FLOOR_MS: u64 = 1_000;

/// Hard safety cap for any single inbound frame.
///
/// Rationale: inbound frames are decoded into owned buffers sized by the
/// frame length. Without a cap, a malicious or buggy peer can advertise an
/// enormous frame and trigger OOM or allocator churn.
///
/// Override with `MURMUR_MAX_FRAME_BYTES`.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// First reconnect delay; doubles per failed attempt.
    pub min_reconnect_delay: Duration,
    /// Backoff ceiling.
    pub max_reconnect_delay: Duration,
    /// Connection attempts a parked send may consume before it fails.
    pub max_send_attempts: u64,
    /// Capacity of the inbound/error broadcast channels.
    pub inbound_queue_capacity: usize,
    /// Inbound frames above this size are dropped and reported.
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_reconnect_delay: Duration::from_millis(DEFAULT_MIN_RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(DEFAULT_MAX_RECONNECT_DELAY_MS),
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    min_reconnect_delay_ms: Option<u64>,
    max_reconnect_delay_ms: Option<u64>,
    max_send_attempts: Option<u64>,
    inbound_queue_capacity: Option<usize>,
    max_frame_bytes: Option<usize>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_u64_env("MURMUR_MIN_RECONNECT_DELAY_MS") {
            config.min_reconnect_delay = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("MURMUR_MAX_RECONNECT_DELAY_MS") {
            config.max_reconnect_delay = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("MURMUR_MAX_SEND_ATTEMPTS") {
            config.max_send_attempts = value;
        }
        if let Some(value) = read_usize_env("MURMUR_INBOUND_QUEUE_CAPACITY") {
            config.inbound_queue_capacity = value;
        }
        if let Some(value) = read_usize_env("MURMUR_MAX_FRAME_BYTES") {
            config.max_frame_bytes = value;
        }
        config
    }

    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("MURMUR_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    // Clamp to floors so every configuration the supervisor sees is sane.
    pub(crate) fn normalized(mut self) -> Self {
        let min_floor = Duration::from_millis(MIN_RECONNECT_DELAY_FLOOR_MS);
        let max_floor = Duration::from_millis(MAX_RECONNECT_DELAY_FLOOR_MS);
        self.min_reconnect_delay = self.min_reconnect_delay.max(min_floor);
        self.max_reconnect_delay = self
            .max_reconnect_delay
            .max(max_floor)
            .max(self.min_reconnect_delay);
        self.max_send_attempts = self.max_send_attempts.max(1);
        self.inbound_queue_capacity = self.inbound_queue_capacity.max(1);
        self
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.min_reconnect_delay_ms
            && value > 0
        {
            config.min_reconnect_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.max_reconnect_delay_ms
            && value > 0
        {
            config.max_reconnect_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.max_send_attempts
            && value > 0
        {
            config.max_send_attempts = value;
        }
        if let Some(value) = self.inbound_queue_capacity
            && value > 0
        {
            config.inbound_queue_capacity = value;
        }
        if let Some(value) = self.max_frame_bytes
            && value > 0
        {
            config.max_frame_bytes = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ClientConfig::default().normalized();
        assert!(config.min_reconnect_delay <= config.max_reconnect_delay);
        assert!(config.max_send_attempts >= 1);
        assert!(config.max_frame_bytes > 0);
    }

    #[test]
    fn normalization_applies_floors() {
        let config = ClientConfig {
            min_reconnect_delay: Duration::from_millis(1),
            max_reconnect_delay: Duration::from_millis(2),
            max_send_attempts: 0,
            inbound_queue_capacity: 0,
            max_frame_bytes: 1,
        }
        .normalized();
        assert_eq!(
            config.min_reconnect_delay,
            Duration::from_millis(MIN_RECONNECT_DELAY_FLOOR_MS)
        );
        assert_eq!(
            config.max_reconnect_delay,
            Duration::from_millis(MAX_RECONNECT_DELAY_FLOOR_MS)
        );
        assert_eq!(config.max_send_attempts, 1);
        assert_eq!(config.inbound_queue_capacity, 1);
    }

    #[test]
    fn normalization_keeps_max_above_min() {
        let config = ClientConfig {
            min_reconnect_delay: Duration::from_secs(120),
            max_reconnect_delay: Duration::from_secs(2),
            ..ClientConfig::default()
        }
        .normalized();
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(120));
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_are_applied() {
        struct EnvGuard;

        impl Drop for EnvGuard {
            fn drop(&mut self) {
                unsafe {
                    std::env::remove_var("MURMUR_MIN_RECONNECT_DELAY_MS");
                    std::env::remove_var("MURMUR_MAX_SEND_ATTEMPTS");
                }
            }
        }

        let _guard = EnvGuard;
        unsafe {
            std::env::set_var("MURMUR_MIN_RECONNECT_DELAY_MS", "250");
            std::env::set_var("MURMUR_MAX_SEND_ATTEMPTS", "9");
        }
        let config = ClientConfig::from_env();
        assert_eq!(config.min_reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.max_send_attempts, 9);
    }

    #[test]
    #[serial_test::serial]
    fn yaml_override_is_applied() {
        let dir = std::env::temp_dir();
        let path = dir.join("murmur-client-config-test.yaml");
        std::fs::write(&path, "max_send_attempts: 3\nmax_frame_bytes: 4096\n").expect("write");
        let config = ClientConfig::from_env_or_yaml(path.to_str()).expect("config");
        assert_eq!(config.max_send_attempts, 3);
        assert_eq!(config.max_frame_bytes, 4096);
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn missing_yaml_path_is_an_error() {
        assert!(ClientConfig::from_env_or_yaml(Some("/nonexistent/murmur.yaml")).is_err());
    }
}
