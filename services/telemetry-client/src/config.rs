//! Telemetry client configuration loading.
//!
//! TOML is the sole config source. Default config path:
//! `/etc/telemetry-client/client.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Every other section is optional and falls back to the defaults of
//! [`ClientConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use tl_protocol::{FallbackPolicy, ProbeFormat};

use crate::backoff::BackoffPolicy;
use crate::cache::DEFAULT_TICK;
use crate::session::SessionConfig;
use crate::supervisor::{DEFAULT_SETTLE_DELAY, SupervisorConfig};
use crate::target::TELEMETRY_WS_PATH;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/telemetry-client/client.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub supervisor: SupervisorConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// None means the local development target.
    pub base_url: Option<String>,
    pub ws_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub token_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub tick: Duration,
    pub clear_on_disable: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                base_url: None,
                ws_path: TELEMETRY_WS_PATH.to_owned(),
            },
            auth: AuthConfig::default(),
            supervisor: SupervisorConfig::default(),
            session: SessionConfig::default(),
            cache: CacheConfig {
                tick: DEFAULT_TICK,
                clear_on_disable: false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    reconnect: Option<RawReconnectConfig>,
    session: Option<RawSessionConfig>,
    cache: Option<RawCacheConfig>,
    decoder: Option<RawDecoderConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServerConfig {
    base_url: Option<String>,
    ws_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAuthConfig {
    token_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReconnectConfig {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
    settle_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSessionConfig {
    keepalive_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    probe: Option<ProbeFormat>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCacheConfig {
    tick_ms: Option<u64>,
    clear_on_disable: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDecoderConfig {
    fallback: Option<FallbackPolicy>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(format!("reading config file '{}': {}", path.display(), e))
    })?;
    load_config_from_str(&toml_str)
}

/// Load client config from the default path.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_config_from_str(toml_str: &str) -> Result<ClientConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let defaults = ClientConfig::default();

    let server = raw.server.unwrap_or_default();
    let ws_path = server.ws_path.unwrap_or(defaults.server.ws_path);
    if !ws_path.starts_with('/') {
        return Err(ConfigError::InvalidValue(format!(
            "server.ws_path must start with '/', got '{}'",
            ws_path
        )));
    }
    let base_url = server.base_url.filter(|s| !s.trim().is_empty());

    let auth = AuthConfig {
        token_file: raw
            .auth
            .unwrap_or_default()
            .token_file
            .map(PathBuf::from),
    };

    // Reconnect policy
    let reconnect = raw.reconnect.unwrap_or_default();
    let backoff = BackoffPolicy {
        base_delay: reconnect
            .base_delay_ms
            .map_or(defaults.supervisor.backoff.base_delay, Duration::from_millis),
        max_delay: reconnect
            .max_delay_ms
            .map_or(defaults.supervisor.backoff.max_delay, Duration::from_millis),
        max_attempts: reconnect
            .max_attempts
            .unwrap_or(defaults.supervisor.backoff.max_attempts),
    };
    if backoff.base_delay.is_zero() {
        return Err(ConfigError::InvalidValue(
            "reconnect.base_delay_ms must be greater than 0".to_owned(),
        ));
    }
    if backoff.max_delay < backoff.base_delay {
        return Err(ConfigError::InvalidValue(format!(
            "reconnect.max_delay_ms ({}) must not be less than base_delay_ms ({})",
            backoff.max_delay.as_millis(),
            backoff.base_delay.as_millis()
        )));
    }
    if backoff.max_attempts == 0 {
        return Err(ConfigError::InvalidValue(
            "reconnect.max_attempts must be at least 1".to_owned(),
        ));
    }
    let settle_delay = reconnect
        .settle_delay_ms
        .map_or(DEFAULT_SETTLE_DELAY, Duration::from_millis);

    // Session
    let raw_session = raw.session.unwrap_or_default();
    let session = SessionConfig {
        keepalive_interval: positive_secs(
            raw_session.keepalive_secs,
            defaults.session.keepalive_interval,
            "session.keepalive_secs",
        )?,
        connect_timeout: positive_secs(
            raw_session.connect_timeout_secs,
            defaults.session.connect_timeout,
            "session.connect_timeout_secs",
        )?,
        probe: raw_session.probe.unwrap_or_default(),
    };

    // Cache
    let raw_cache = raw.cache.unwrap_or_default();
    let tick = raw_cache
        .tick_ms
        .map_or(defaults.cache.tick, Duration::from_millis);
    if tick.is_zero() {
        return Err(ConfigError::InvalidValue(
            "cache.tick_ms must be greater than 0".to_owned(),
        ));
    }
    let cache = CacheConfig {
        tick,
        clear_on_disable: raw_cache.clear_on_disable.unwrap_or(false),
    };

    Ok(ClientConfig {
        server: ServerConfig { base_url, ws_path },
        auth,
        supervisor: SupervisorConfig {
            backoff,
            settle_delay,
            fallback: raw.decoder.unwrap_or_default().fallback.unwrap_or_default(),
            clear_on_disable: cache.clear_on_disable,
        },
        session,
        cache,
    })
}

fn positive_secs(value: Option<u64>, default: Duration, field: &str) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(0) => Err(ConfigError::InvalidValue(format!(
            "{} must be greater than 0",
            field
        ))),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
