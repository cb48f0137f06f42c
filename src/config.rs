//! Configuration management for Turnstile.
//!
//! Settings come from an optional file (format inferred from its extension)
//! overlaid with `TURNSTILE__`-prefixed environment variables, e.g.
//! `TURNSTILE__RULES__PATH=/etc/turnstile/rules.conf`.

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::WhitelistScope;

const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Rule loading and matching
    #[serde(default)]
    pub rules: RulesConfig,

    /// Limiter registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rule configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Path to the rule file
    pub path: Option<PathBuf>,

    /// Which whitelist exempts a client from a rule
    #[serde(default)]
    pub whitelist_scope: WhitelistScope,
}

/// Limiter registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Warn each time the number of limiter keys reaches a multiple of this;
    /// zero disables the warning
    #[serde(default = "default_key_warning_threshold")]
    pub key_warning_threshold: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_warning_threshold: default_key_warning_threshold(),
        }
    }
}

fn default_key_warning_threshold() -> usize {
    100_000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level for the `turnstile` target
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: TurnstileConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = config::Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the type system cannot.
    pub fn validate(&self) -> Result<()> {
        if self.logging.level.trim().is_empty() {
            return Err(TurnstileError::Config("logging.level must not be empty".to_string()));
        }
        Ok(())
    }
}
