//! Runtime Configuration
//!
//! Configuration for a [`Runtime`](crate::runtime::Runtime). Values can be
//! set programmatically through the builder or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All variables use the `MARROW_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MARROW_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `MARROW_LOG_FORMAT` | Log output format (plain/json) | plain |
//! | `MARROW_DEFAULT_CONCURRENCY` | Root concurrency policy ("unbounded" or a positive integer) | unbounded |
//!
//! # Example
//!
//! ```rust,ignore
//! use marrow_runtime::config::RuntimeConfig;
//!
//! // Load from the environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder
//! let config = RuntimeConfig::builder()
//!     .default_concurrency(marrow_runtime::Concurrency::Limit(8))
//!     .build();
//! ```

use std::env;

use crate::concurrency::Concurrency;
use crate::log::{LogFormat, LogLevel};

/// Configuration applied when a runtime is created.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Minimum level for runtime-internal logging.
    pub log_level: LogLevel,
    /// Output format for runtime-internal logging.
    pub log_format: LogFormat,
    /// Concurrency policy installed in the root environment, read by
    /// `for_each` when asked to inherit.
    pub default_concurrency: Concurrency,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            log_level: LogLevel::Info,
            log_format: LogFormat::Plain,
            default_concurrency: Concurrency::Unbounded,
        }
    }
}

impl RuntimeConfig {
    /// Start building a configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder {
            config: RuntimeConfig::default(),
        }
    }

    /// Load configuration from `MARROW_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();
        if let Ok(value) = env::var("MARROW_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&value) {
                config.log_level = level;
            }
        }
        if let Ok(value) = env::var("MARROW_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&value) {
                config.log_format = format;
            }
        }
        if let Ok(value) = env::var("MARROW_DEFAULT_CONCURRENCY") {
            if let Some(concurrency) = parse_concurrency(&value) {
                config.default_concurrency = concurrency;
            }
        }
        config
    }
}

fn parse_concurrency(s: &str) -> Option<Concurrency> {
    if s.eq_ignore_ascii_case("unbounded") {
        return Some(Concurrency::Unbounded);
    }
    match s.parse::<usize>() {
        Ok(n) if n > 0 => Some(Concurrency::Limit(n)),
        _ => None,
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Set the log output format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log_format = format;
        self
    }

    /// Set the root concurrency policy.
    pub fn default_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.config.default_concurrency = concurrency;
        self
    }

    /// Finish building.
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Plain);
        assert!(matches!(
            config.default_concurrency,
            Concurrency::Unbounded
        ));
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .log_level(LogLevel::Debug)
            .log_format(LogFormat::Json)
            .default_concurrency(Concurrency::Limit(4))
            .build();

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(matches!(config.default_concurrency, Concurrency::Limit(4)));
    }

    #[test]
    fn test_parse_concurrency() {
        assert!(matches!(
            parse_concurrency("unbounded"),
            Some(Concurrency::Unbounded)
        ));
        assert!(matches!(
            parse_concurrency("16"),
            Some(Concurrency::Limit(16))
        ));
        assert!(parse_concurrency("0").is_none());
        assert!(parse_concurrency("lots").is_none());
    }
}
