mod duration;

pub use duration::Duration;

use crate::session::{PoolMode, SessionOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub access: AccessConfig,
    #[serde(default)]
    pub analytics: Option<AnalyticsConfig>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub udp: UdpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Base URL of the access authority.
    pub url: Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Collector endpoint events are posted to.
    pub url: Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub timeout: Duration,
    pub worker_max_count: usize,
    pub pool_mode: PoolMode,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            worker_max_count: 32,
            pool_mode: PoolMode::PerSession,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path:?}"))?;
        let config: Config =
            serde_yml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.udp.worker_max_count == 0 {
            anyhow::bail!("udp.worker_max_count must be at least 1");
        }
        if self.udp.timeout.as_std().is_zero() {
            anyhow::bail!("udp.timeout must be positive");
        }
        if self.session.timeout.as_std().is_zero() {
            anyhow::bail!("session.timeout must be positive");
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            session_timeout: self.session.timeout.as_std(),
            cleanup_interval: self.session.cleanup_interval.as_std(),
            udp_timeout: self.udp.timeout.as_std(),
            worker_max_count: self.udp.worker_max_count,
            pool_mode: self.udp.pool_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config =
            serde_yml::from_str("access:\n  url: https://access.example.com/api/\n").unwrap();
        config.validate().unwrap();

        assert!(config.analytics.is_none());
        let options = config.session_options();
        assert_eq!(options.session_timeout.as_secs(), 3600);
        assert_eq!(options.cleanup_interval.as_secs(), 30);
        assert_eq!(options.udp_timeout.as_secs(), 120);
        assert_eq!(options.worker_max_count, 32);
        assert_eq!(options.pool_mode, PoolMode::PerSession);
    }

    #[test]
    fn test_full_config() {
        let text = r#"
access:
  url: https://access.example.com/api/
analytics:
  url: https://stats.example.com/collect
session:
  timeout: 30m
  cleanup_interval: 10s
udp:
  timeout: 90s
  worker_max_count: 8
  pool_mode: shared
"#;
        let config: Config = serde_yml::from_str(text).unwrap();
        config.validate().unwrap();

        let options = config.session_options();
        assert_eq!(options.session_timeout.as_secs(), 1800);
        assert_eq!(options.udp_timeout.as_secs(), 90);
        assert_eq!(options.worker_max_count, 8);
        assert_eq!(options.pool_mode, PoolMode::Shared);
    }

    #[test]
    fn test_zero_worker_count_rejected() {
        let text = "access:\n  url: https://a.example.com/\nudp:\n  worker_max_count: 0\n";
        let config: Config = serde_yml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }
}
