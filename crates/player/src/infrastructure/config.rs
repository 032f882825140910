//! Session engine configuration.
//!
//! Values come from the process environment, optionally seeded from
//! `.env.local` / `.env` at the repository root.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::infrastructure::backoff::BackoffPolicy;

pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;
pub const DEFAULT_HANDSHAKE_HEARTBEAT_SECS: u64 = 5;
pub const DEFAULT_ACTIVATION_THRESHOLD: f32 = 0.9;
pub const DEFAULT_SCENE: &str = "SessionMap01";
pub const DEFAULT_TICK_MS: u64 = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Host keep-alive period in the lobby
    pub heartbeat_period: Duration,
    /// Host keep-alive period once the start handshake runs
    pub handshake_heartbeat_period: Duration,
    /// Load progress at which the shared resource may be activated
    pub activation_threshold: f32,
    /// Shared resource loaded when the game starts
    pub scene: String,
    pub auto_reconnect: bool,
    pub reconnect: BackoffPolicy,
    /// Period of the driving tick loop
    pub tick_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            handshake_heartbeat_period: Duration::from_secs(DEFAULT_HANDSHAKE_HEARTBEAT_SECS),
            activation_threshold: DEFAULT_ACTIVATION_THRESHOLD,
            scene: DEFAULT_SCENE.to_string(),
            auto_reconnect: true,
            reconnect: BackoffPolicy::default(),
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let heartbeat_secs: u64 =
            parse_or(&lookup, "LOBBYSYNC_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)?;
        let handshake_heartbeat_secs: u64 = parse_or(
            &lookup,
            "LOBBYSYNC_HANDSHAKE_HEARTBEAT_SECS",
            DEFAULT_HANDSHAKE_HEARTBEAT_SECS,
        )?;
        let activation_threshold: f32 = parse_or(
            &lookup,
            "LOBBYSYNC_ACTIVATION_THRESHOLD",
            DEFAULT_ACTIVATION_THRESHOLD,
        )?;
        if !(0.0..=1.0).contains(&activation_threshold) {
            anyhow::bail!(
                "LOBBYSYNC_ACTIVATION_THRESHOLD must be within 0.0..=1.0, got {}",
                activation_threshold
            );
        }
        if heartbeat_secs == 0 || handshake_heartbeat_secs == 0 {
            anyhow::bail!("heartbeat periods must be at least one second");
        }

        let scene = lookup("LOBBYSYNC_SCENE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.scene);

        let auto_reconnect = match lookup("LOBBYSYNC_AUTO_RECONNECT") {
            Some(raw) => parse_bool(&raw)
                .with_context(|| format!("Invalid LOBBYSYNC_AUTO_RECONNECT: {}", raw))?,
            None => defaults.auto_reconnect,
        };

        let reconnect = BackoffPolicy {
            initial_delay_ms: parse_or(
                &lookup,
                "LOBBYSYNC_RECONNECT_INITIAL_MS",
                defaults.reconnect.initial_delay_ms,
            )?,
            max_delay_ms: parse_or(
                &lookup,
                "LOBBYSYNC_RECONNECT_MAX_MS",
                defaults.reconnect.max_delay_ms,
            )?,
            max_attempts: parse_or(
                &lookup,
                "LOBBYSYNC_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            )?,
        };

        let tick_ms: u64 = parse_or(&lookup, "LOBBYSYNC_TICK_MS", DEFAULT_TICK_MS)?;

        Ok(Self {
            heartbeat_period: Duration::from_secs(heartbeat_secs),
            handshake_heartbeat_period: Duration::from_secs(handshake_heartbeat_secs),
            activation_threshold,
            scene,
            auto_reconnect,
            reconnect,
            tick_interval: Duration::from_millis(tick_ms.max(1)),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {}: {}", key, raw)),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {}", other),
    }
}

/// Load `.env.local` then `.env` from the repository root, if present.
pub fn load_dotenv_from_repo_root() {
    let repo_root = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..");

    // Prefer local overrides.
    for filename in [".env.local", ".env"] {
        let path = repo_root.join(filename);
        if path.exists() {
            let _ = dotenvy::from_path(path);
        }
    }
}
