//! Gateway configuration.
//!
//! Configuration is merged from two sources (later overrides earlier):
//! 1. Type defaults
//! 2. Environment variables (`WATCH_NAMESPACE`, `ZAP_LOG_LEVEL`,
//!    `LISTEN_ADDR`)
//!
//! Loading does not validate; callers must run [`GatewayConfig::validate`]
//! before using the configuration. A missing namespace is the only fatal
//! validation failure.

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Namespace whose clusters, events and operator pods are observed.
    /// Required; the process refuses to start without it.
    pub watch_namespace: String,

    /// Log verbosity: debug/info/warn/error/fatal/panic, case-insensitive.
    /// `fatal` and `panic` collapse to the closest tracing level.
    pub zap_log_level: String,

    /// Address the HTTP/WebSocket listener binds to.
    pub listen_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            watch_namespace: String::new(),
            zap_log_level: "info".to_string(),
            listen_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from defaults and environment variables.
    pub fn load() -> Result<Self> {
        let settings: Self = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(Environment::default().ignore_empty(true))
            .build()?
            .try_deserialize()
            .map_err(crate::Error::Config)?;
        Ok(settings)
    }

    /// Validates the configuration and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        if self.watch_namespace.is_empty() {
            return Err(crate::Error::Config(ConfigError::Message(
                "WATCH_NAMESPACE environment variable not set".to_string(),
            )));
        }
        Ok(self)
    }

    /// Maps the configured level string onto a tracing level.
    ///
    /// Unknown strings fall back to `info`, matching the behavior of the
    /// operator deployments this gateway runs next to.
    pub fn log_level(&self) -> Level {
        match self.zap_log_level.to_lowercase().as_str() {
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            // tracing has no fatal/panic levels; error is the closest
            "error" | "fatal" | "panic" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}
