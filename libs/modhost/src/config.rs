//! Host and module configuration.
//!
//! Values are layered with `figment`: compiled defaults first, then `MODHOST_*`
//! keys from the container [`Environment`]. Module sections use their own
//! prefix, so `MODHOST_SCRIPTS_PATH` is the `path` key of section `scripts`.
//!
//! Module loading is lenient: a missing section falls back to `T::default()`,
//! an invalid one is an error. Environment values stay strings; typed fields
//! need a string-accepting deserializer (durations use
//! `modhost_utils::duration`).

use std::time::Duration;

use figment::Figment;
use figment::providers::Serialized;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::records::LogLevel;

pub const ENV_PREFIX: &str = "MODHOST_";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid host configuration")]
    InvalidHost {
        #[source]
        source: Box<figment::Error>,
    },
    #[error("invalid config for section '{section}'")]
    InvalidSection {
        section: String,
        #[source]
        source: Box<figment::Error>,
    },
}

impl ConfigError {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::InvalidHost { .. } => "invalid_host_config",
            ConfigError::InvalidSection { .. } => "invalid_section_config",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Container name; workers receive their worker name here.
    pub name: String,
    /// `tracing` filter directive; its first level also sets the bus threshold.
    pub log_level: String,
    pub log_format: LogFormat,
    #[serde(with = "modhost_utils::duration")]
    pub up_timeout: Duration,
    #[serde(with = "modhost_utils::duration")]
    pub down_timeout: Duration,
    /// Heartbeat period of a worker's `process.status` event.
    #[serde(with = "modhost_utils::duration")]
    pub status_interval: Duration,
    /// Set by the supervisor for child processes.
    pub worker_name: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "modhost".to_owned(),
            log_level: "info".to_owned(),
            log_format: LogFormat::Text,
            up_timeout: Duration::from_secs(30),
            down_timeout: Duration::from_secs(30),
            status_interval: Duration::from_secs(1),
            worker_name: None,
        }
    }
}

impl HostConfig {
    #[must_use]
    pub fn figment(env: &Environment) -> Figment {
        Figment::from(Serialized::defaults(HostConfig::default()))
            .merge(Serialized::defaults(env.with_prefix(ENV_PREFIX)))
    }

    /// # Errors
    /// `ConfigError::InvalidHost` when a `MODHOST_*` value does not parse.
    pub fn load(env: &Environment) -> Result<Self, ConfigError> {
        Self::figment(env)
            .extract()
            .map_err(|e| ConfigError::InvalidHost {
                source: Box::new(e),
            })
    }

    /// Bus threshold derived from `log_level`. `"warn,my_crate=debug"` yields
    /// `Warning`; anything unparseable yields `Informational`.
    #[must_use]
    pub fn log_threshold(&self) -> LogLevel {
        self.log_level
            .split(',')
            .find(|directive| !directive.contains('='))
            .and_then(|level| level.parse().ok())
            .unwrap_or(LogLevel::Informational)
    }

    #[must_use]
    pub fn is_worker(&self) -> bool {
        self.worker_name.is_some()
    }
}

/// Lenient loader for a module section keyed by `MODHOST_<SECTION>_*`.
///
/// # Errors
/// `ConfigError::InvalidSection` when present keys do not deserialize into `T`.
pub fn module_config_or_default<T>(env: &Environment, section: &str) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned + Default,
{
    let prefix = format!("{ENV_PREFIX}{}_", section.to_ascii_uppercase());
    Figment::from(Serialized::defaults(T::default()))
        .merge(Serialized::defaults(env.with_prefix(&prefix)))
        .extract()
        .map_err(|e| ConfigError::InvalidSection {
            section: section.to_owned(),
            source: Box::new(e),
        })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = HostConfig::load(&Environment::new()).unwrap();
        assert_eq!(cfg, HostConfig::default());
        assert!(!cfg.is_worker());
        assert_eq!(cfg.log_threshold(), LogLevel::Informational);
    }

    #[test]
    fn env_overrides_defaults() {
        let env = Environment::from_pairs([
            ("MODHOST_NAME", "billing"),
            ("MODHOST_LOG_LEVEL", "debug"),
            ("MODHOST_LOG_FORMAT", "json"),
            ("MODHOST_UP_TIMEOUT", "PT5S"),
            ("MODHOST_STATUS_INTERVAL", "250ms"),
            ("MODHOST_WORKER_NAME", "w1"),
            ("MODHOST_SCRIPTS_PATH", "/opt/scripts"),
        ]);
        let cfg = HostConfig::load(&env).unwrap();
        assert_eq!(cfg.name, "billing");
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.up_timeout, Duration::from_secs(5));
        assert_eq!(cfg.down_timeout, Duration::from_secs(30));
        assert_eq!(cfg.status_interval, Duration::from_millis(250));
        assert_eq!(cfg.worker_name.as_deref(), Some("w1"));
        assert_eq!(cfg.log_threshold(), LogLevel::Debug);
    }

    #[test]
    fn bad_duration_is_reported() {
        let env = Environment::from_pairs([("MODHOST_UP_TIMEOUT", "whenever")]);
        let err = HostConfig::load(&env).unwrap_err();
        assert_eq!(err.as_label(), "invalid_host_config");
    }

    #[test]
    fn threshold_ignores_targets() {
        let cfg = HostConfig {
            log_level: "my_crate=debug,warn".into(),
            ..HostConfig::default()
        };
        assert_eq!(cfg.log_threshold(), LogLevel::Warning);
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct CacheConfig {
        namespace: String,
        #[serde(with = "modhost_utils::duration")]
        ttl: Duration,
    }

    #[test]
    fn module_section_by_prefix() {
        let env = Environment::from_pairs([
            ("MODHOST_CACHE_NAMESPACE", "orders"),
            ("MODHOST_CACHE_TTL", "1m"),
            ("MODHOST_OTHER_NAMESPACE", "x"),
        ]);
        let cfg: CacheConfig = module_config_or_default(&env, "cache").unwrap();
        assert_eq!(
            cfg,
            CacheConfig {
                namespace: "orders".into(),
                ttl: Duration::from_secs(60)
            }
        );

        let missing: CacheConfig = module_config_or_default(&Environment::new(), "cache").unwrap();
        assert_eq!(missing, CacheConfig::default());
    }

    #[test]
    fn module_section_invalid_value() {
        let env = Environment::from_pairs([("MODHOST_CACHE_TTL", "lots")]);
        let err = module_config_or_default::<CacheConfig>(&env, "cache").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSection { ref section, .. } if section == "cache"));
    }
}
