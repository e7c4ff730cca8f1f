//! Pool configuration structures.

use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Behaviour of acquisition when every resource is leased.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ExhaustionPolicy {
    /// Fail immediately with [`Error::PoolExhausted`].
    ///
    /// [`Error::PoolExhausted`]: crate::Error::PoolExhausted
    #[default]
    Reject,
    /// Queue the caller until a resource is released.
    ///
    /// Bounded by [`PoolConfig::wait_timeout`], if set.
    Wait,
}

/// Pool configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of resources the pool will ever create.
    pub capacity: NonZeroUsize,
    /// What to do when all resources are leased.
    #[serde(default)]
    pub on_exhausted: ExhaustionPolicy,
    /// Longest time a caller is allowed to wait under [`ExhaustionPolicy::Wait`].
    ///
    /// Waits indefinitely if unset, or if too long to represent as a point in time.
    /// Has no effect under [`ExhaustionPolicy::Reject`], which [`Self::validate`] reports.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub wait_timeout: Option<Duration>,
    /// Pool name used in traces and metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Minimum interval between refreshes of pool state gauges.
    #[serde(
        default = "PoolConfig::default_metrics_interval",
        with = "humantime_serde"
    )]
    pub metrics_interval: Duration,
}

impl PoolConfig {
    /// Create configuration for a pool of `capacity` resources, rejecting excess demand.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            on_exhausted: ExhaustionPolicy::Reject,
            wait_timeout: None,
            label: None,
            metrics_interval: Self::default_metrics_interval(),
        }
    }

    /// Default value for [`Self::metrics_interval`].
    #[must_use]
    #[inline]
    fn default_metrics_interval() -> Duration {
        Duration::from_secs(15)
    }

    /// Fail acquisition right away when the pool is exhausted.
    #[must_use]
    pub fn rejecting(mut self) -> Self {
        self.on_exhausted = ExhaustionPolicy::Reject;
        self.wait_timeout = None;
        self
    }

    /// Make callers wait for a released resource, up to `timeout` if set.
    #[must_use]
    pub fn waiting(mut self, timeout: Option<Duration>) -> Self {
        self.on_exhausted = ExhaustionPolicy::Wait;
        self.wait_timeout = timeout;
        self
    }

    /// Set pool name used in traces and metrics.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set minimum interval between refreshes of pool state gauges.
    #[must_use]
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Pool name used in traces and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or("default")
    }

    /// Check settings for consistency.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a wait timeout is set while the policy is to reject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.on_exhausted == ExhaustionPolicy::Reject && self.wait_timeout.is_some() {
            return Err(ConfigError::Invalid(
                "wait_timeout requires on_exhausted: wait",
            ));
        }
        Ok(())
    }
}

/// Pool configuration error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Configuration builder error.
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    /// Configuration loaded, but settings contradict each other.
    #[error("Invalid pool configuration: {0}")]
    Invalid(&'static str),
}

/// Loader for pool configuration from files and environment.
#[must_use]
pub struct PoolConfigLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl PoolConfigLoader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
        }
    }

    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// See [`config::builder::ConfigBuilder::build`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful, or if loaded
    /// settings fail [`PoolConfig::validate`].
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let cfg: PoolConfig = self.builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Add a custom object implementing [`Source`] trait as a source of pool configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of pool configuration.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add environment variables as a source of pool configuration.
    ///
    /// Variables are expected as `{PREFIX}__{FIELD}`, e.g. `WORKERS__WAIT_TIMEOUT=250ms`.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(
            config::Environment::with_prefix(prefix.as_ref())
                .separator("__")
                .prefix_separator("__")
                .try_parsing(true),
        )
    }
}

impl Default for PoolConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{from_str, json, to_value};

    use super::*;

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    /// Deserialize - minimal.
    #[test]
    fn config_de_minimal() {
        let cfg: PoolConfig = from_str(r#"{"capacity": 5}"#).unwrap();
        assert_eq!(cfg, PoolConfig::new(cap(5)));
        assert_eq!(cfg.name(), "default");
    }

    /// Deserialize - waiting with timeout.
    #[test]
    fn config_de_wait() {
        let serialized = r#"{
            "capacity": 1,
            "on_exhausted": "wait",
            "wait_timeout": "100ms",
            "label": "workers"
        }"#;
        let cfg: PoolConfig = from_str(serialized).unwrap();
        assert_eq!(
            cfg,
            PoolConfig::new(cap(1))
                .waiting(Some(Duration::from_millis(100)))
                .with_label("workers")
        );
        assert!(cfg.validate().is_ok());
    }

    /// Deserialize - zero capacity.
    #[test]
    fn config_de_zero_capacity() {
        assert!(from_str::<PoolConfig>(r#"{"capacity": 0}"#).is_err());
    }

    /// Deserialize - unknown policy.
    #[test]
    fn config_de_invalid_policy() {
        assert!(from_str::<PoolConfig>(r#"{"capacity": 2, "on_exhausted": "drop"}"#).is_err());
    }

    /// Serialize - defaults.
    #[test]
    fn config_ser_default() {
        let serialized = to_value(PoolConfig::new(cap(3))).unwrap();
        assert_eq!(
            serialized,
            json!({
                "capacity": 3,
                "on_exhausted": "reject",
                "metrics_interval": "15s"
            })
        );
    }

    /// Validation - timeout without waiting.
    #[test]
    fn config_timeout_requires_wait() {
        let mut cfg = PoolConfig::new(cap(2));
        cfg.wait_timeout = Some(Duration::from_secs(1));
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        assert!(cfg.rejecting().validate().is_ok());
    }

    /// Loader - YAML source.
    #[test]
    fn loader_yaml() {
        let yaml = "capacity: 4\non_exhausted: wait\nwait_timeout: 2s\n";
        let cfg = PoolConfigLoader::new()
            .with_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap();
        assert_eq!(
            cfg,
            PoolConfig::new(cap(4)).waiting(Some(Duration::from_secs(2)))
        );
    }

    /// Loader - contradictory settings.
    #[test]
    fn loader_rejects_invalid() {
        let yaml = "capacity: 4\nwait_timeout: 2s\n";
        let res = PoolConfigLoader::new()
            .with_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build();
        assert!(matches!(res, Err(ConfigError::Invalid(_))));
    }
}
