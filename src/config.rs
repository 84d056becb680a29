use crate::error::ConfigError;
use argon2::{Algorithm, Argon2, Params, Version};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Token lifetime used when `default_token_age` is missing or unparsable (30 days)
pub const DEFAULT_TOKEN_AGE: Duration = Duration::from_secs(720 * 60 * 60);

/// Token lifetime cap used when `max_token_age` is missing or unparsable (1 year)
pub const DEFAULT_MAX_TOKEN_AGE: Duration = Duration::from_secs(24 * 365 * 60 * 60);

/// Salt used when the configured one is too short for Argon2
const FALLBACK_SALT: &[u8] = b"hostgate-signing-salt";

/// Argon2 refuses salts shorter than this
const MIN_SALT_LEN: usize = 8;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Process-wide settings, loaded once at boot
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Primary management hostname. Always part of the certificate domains.
    #[serde(default)]
    pub hostname: String,

    /// Contact email for certificate issuance
    pub email: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[serde(default)]
    pub staging: bool,

    /// Token-signing secret
    #[serde(default)]
    pub secret: String,

    /// Salt mixed into the signing key derivation
    #[serde(default)]
    pub salt: String,

    /// Log verbosity: trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub loglevel: String,

    /// Location of the host registry database
    #[serde(default = "default_database_path", alias = "databasepath")]
    pub database_path: String,

    /// Default session lifetime, e.g. "720h"
    pub default_token_age: Option<String>,

    /// Maximum session lifetime, e.g. "8760h"
    pub max_token_age: Option<String>,

    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where TLS material comes from
    #[serde(default)]
    pub tls: TlsConfig,

    /// Control interface endpoint
    #[serde(default)]
    pub control: ControlConfig,
}

/// What the reload controller does when a rebuild fails
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadFailurePolicy {
    /// Stop the process with the error (the historical behavior)
    #[default]
    Abort,
    /// Re-bind the last working routing table and keep serving
    KeepPrevious,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address of the public listener (default: 0.0.0.0:443)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Grace period for in-flight connections when a server is drained
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Reaction to a failed reload: "abort" or "keep-previous"
    #[serde(default)]
    pub on_reload_failure: ReloadFailurePolicy,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|e| {
            ConfigError::Invalid(vec![format!("server.listen '{}': {}", self.listen, e)])
        })
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            drain_timeout_secs: default_drain_timeout(),
            on_reload_failure: ReloadFailurePolicy::default(),
        }
    }
}

/// Source of the public listener's certificates
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// Certificates issued by Let's Encrypt via TLS-ALPN-01
    #[default]
    Acme,
    /// One self-signed certificate covering all domains (development only)
    SelfSigned,
    /// Plain HTTP, for running behind another TLS terminator
    Off,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,

    /// Local directory for certificate and account cache
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: TlsMode::default(),
            cache_dir: default_acme_cache_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Control endpoint address (default: 127.0.0.1:1234).
    /// The endpoint is unauthenticated; keep it on loopback or a private network.
    #[serde(default = "default_control_listen")]
    pub listen: String,
}

impl ControlConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|e| {
            ConfigError::Invalid(vec![format!("control.listen '{}': {}", self.listen, e)])
        })
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_control_listen(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> String {
    "./hostgate.db".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:443".to_string()
}

fn default_drain_timeout() -> u64 {
    60
}

fn default_acme_cache_dir() -> String {
    "./acme_cache".to_string()
}

fn default_control_listen() -> String {
    "127.0.0.1:1234".to_string()
}

/// Signing key and lifetimes handed to the access decision layer
#[derive(Clone)]
pub struct SessionSettings {
    pub signing_key: [u8; 32],
    pub default_age: Duration,
    pub max_age: Duration,
}

impl SessionSettings {
    /// Lifetime for a new session: the requested one (or the default), capped at max
    pub fn lifetime(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default_age).min(self.max_age)
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("signing_key", &"<redacted>")
            .field("default_age", &self.default_age)
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.hostname.trim().is_empty() {
            errors.push("'hostname' is required".to_string());
        } else if !self
            .hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            errors.push(format!("'hostname' is not a valid DNS name: {}", self.hostname));
        }

        if self.secret.is_empty() {
            errors.push("'secret' is required".to_string());
        }

        if self.tls.mode == TlsMode::Acme && self.email.as_deref().unwrap_or("").is_empty() {
            errors.push("'email' is required when tls.mode is acme".to_string());
        }

        if self.server.drain_timeout_secs == 0 {
            errors.push("server.drain_timeout_secs must be greater than 0".to_string());
        }

        for result in [self.server.listen_addr(), self.control.listen_addr()] {
            if let Err(ConfigError::Invalid(mut e)) = result {
                errors.append(&mut e);
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }

    /// Effective log level; unknown values fall back to info
    pub fn log_level(&self) -> &str {
        let level = self.loglevel.trim();
        LOG_LEVELS
            .iter()
            .find(|l| l.eq_ignore_ascii_case(level))
            .copied()
            .unwrap_or("info")
    }

    /// Derive the token-signing key and resolve session lifetimes
    pub fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        let salt = if self.salt.len() >= MIN_SALT_LEN {
            self.salt.as_bytes()
        } else {
            FALLBACK_SALT
        };

        let params = Params::new(4 * 1024, 4, 2, Some(32))
            .map_err(|e| ConfigError::KeyDerivation(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut signing_key = [0u8; 32];
        argon2
            .hash_password_into(self.secret.as_bytes(), salt, &mut signing_key)
            .map_err(|e| ConfigError::KeyDerivation(e.to_string()))?;

        let max_age = token_age(
            "max_token_age",
            self.max_token_age.as_deref(),
            DEFAULT_MAX_TOKEN_AGE,
        );
        let default_age = token_age(
            "default_token_age",
            self.default_token_age.as_deref(),
            DEFAULT_TOKEN_AGE,
        )
        .min(max_age);

        Ok(SessionSettings {
            signing_key,
            default_age,
            max_age,
        })
    }
}

/// Configured token age, or `fallback` when missing or unparsable
fn token_age(key: &str, value: Option<&str>, fallback: Duration) -> Duration {
    let Some(value) = value else {
        return fallback;
    };
    match parse_duration(value) {
        Some(age) => age,
        None => {
            warn!(
                key,
                value,
                fallback_secs = fallback.as_secs(),
                "Unparsable token age, using default"
            );
            fallback
        }
    }
}

/// Parse durations like "720h", "1h30m", "7days" or "1.5h"
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if let Ok(duration) = humantime::parse_duration(input) {
        return Some(duration);
    }

    // humantime only takes integers; accept a single fractional value too
    let split = input.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (number, unit) = input.split_at(split);
    let value: f64 = number.parse().ok()?;
    let unit = humantime::parse_duration(&format!("1{}", unit)).ok()?;
    Duration::try_from_secs_f64(unit.as_secs_f64() * value).ok()
}
