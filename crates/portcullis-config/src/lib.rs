//! # Portcullis Config
//!
//! Configuration loading for the identity broker. Values come from an
//! optional YAML file layered under environment variables with the
//! `PORTCULLIS` prefix (`__` as the section separator), so
//! `PORTCULLIS__TOKEN__USER_TTL_SECS=600` overrides `token.user_ttl_secs`.
//!
//! The one flat environment variable with no section is
//! `PORTCULLIS_AUTHENTICATORS`: the comma-separated whitelist of enabled
//! authenticator instances (`authn-jwt/prod,authn-ldap`). When unset, only
//! the default `authn` authenticator is enabled.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// The always-available authenticator name used when no whitelist is
/// configured.
pub const DEFAULT_AUTHENTICATOR_NAME: &str = "authn";

/// Root configuration for the authentication service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_logging")]
    pub logging: String,

    /// Comma-separated whitelist of enabled authenticators
    /// (`{type}/{service_id}` entries). `None` enables only `authn`.
    #[serde(default)]
    pub authenticators: Option<String>,

    /// Access token issuance settings
    #[serde(default)]
    pub token: TokenConfig,

    /// JWKS cache settings
    #[serde(default)]
    pub jwks: JwksConfig,

    /// Upstream HTTP settings
    #[serde(default)]
    pub http: HttpConfig,
}

/// Access token issuance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// TTL for tokens issued to users, in seconds
    #[serde(default = "default_user_ttl")]
    pub user_ttl_secs: u64,

    /// TTL for tokens issued to hosts, in seconds
    #[serde(default = "default_host_ttl")]
    pub host_ttl_secs: u64,

    /// Clock skew tolerance for inbound credential timestamps, in seconds
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Maximum accepted age of inbound credentials, in seconds
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            user_ttl_secs: default_user_ttl(),
            host_ttl_secs: default_host_ttl(),
            clock_skew_secs: default_clock_skew(),
            max_age_secs: default_max_age(),
        }
    }
}

/// JWKS cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksConfig {
    /// Time-to-live of cached key sets, in seconds
    #[serde(default = "default_jwks_ttl")]
    pub cache_ttl_secs: u64,

    /// Maximum number of cached key sets
    #[serde(default = "default_jwks_capacity")]
    pub cache_capacity: u64,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: default_jwks_ttl(), cache_capacity: default_jwks_capacity() }
    }
}

/// Upstream HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Default request timeout for IdP/STS calls, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Read timeout for Jenkins REST calls, in seconds
    #[serde(default = "default_jenkins_timeout")]
    pub jenkins_read_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            jenkins_read_timeout_secs: default_jenkins_timeout(),
        }
    }
}

fn default_logging() -> String {
    "info".to_string()
}

fn default_user_ttl() -> u64 {
    480 // 8 minutes
}

fn default_host_ttl() -> u64 {
    480
}

fn default_clock_skew() -> u64 {
    60
}

fn default_max_age() -> u64 {
    86400
}

fn default_jwks_ttl() -> u64 {
    300
}

fn default_jwks_capacity() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    10
}

fn default_jenkins_timeout() -> u64 {
    5
}

impl Config {
    /// Load configuration from an optional file plus the environment.
    ///
    /// Environment variables win over file values. The whitelist honours the
    /// flat `PORTCULLIS_AUTHENTICATORS` variable for compatibility with
    /// container deployments that cannot express nested keys.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file exists but cannot be parsed, or
    /// if a value fails to deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("PORTCULLIS").separator("__"));

        let mut config: Config = builder.build()?.try_deserialize()?;

        if config.authenticators.is_none() {
            if let Ok(whitelist) = std::env::var("PORTCULLIS_AUTHENTICATORS") {
                config.authenticators = Some(whitelist);
            }
        }

        tracing::debug!(
            authenticators = config.authenticators.as_deref().unwrap_or(DEFAULT_AUTHENTICATOR_NAME),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// The configured whitelist string, falling back to the default
    /// singleton authenticator.
    pub fn enabled_authenticators(&self) -> &str {
        self.authenticators.as_deref().unwrap_or(DEFAULT_AUTHENTICATOR_NAME)
    }
}
