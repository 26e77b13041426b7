//! Launcher TOML configuration.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::MAX_INTERVAL;

/// Upper bound for every configured interval, in seconds.
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

/// Slowest accepted provider rate: one call per `MAX_INTERVAL`.
pub const MIN_RATE: f64 = 1.0 / MAX_INTERVAL.as_secs() as f64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub launcher: LauncherSettings,
    #[serde(default)]
    pub labels: Vec<LabelConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherSettings {
    /// Pause between pool worker iterations.
    #[serde(default = "default_watermark_sleep")]
    pub watermark_sleep_secs: f64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: f64,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            watermark_sleep_secs: default_watermark_sleep(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl LauncherSettings {
    pub fn watermark_sleep(&self) -> Duration {
        secs_or(self.watermark_sleep_secs, default_watermark_sleep())
    }

    pub fn cleanup_interval(&self) -> Duration {
        secs_or(self.cleanup_interval_secs, default_cleanup_interval())
    }
}

/// Per-label policy shared by every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    pub name: String,
    /// READY, unallocated nodes to keep around.
    #[serde(default)]
    pub min_ready: u32,
    /// Unallocated READY nodes older than this are retired.
    pub max_ready_age_secs: Option<u64>,
}

impl LabelConfig {
    pub fn max_ready_age(&self) -> Option<Duration> {
        self.max_ready_age_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Driver implementing this provider, e.g. `fake`.
    pub driver: String,
    /// Provider API calls per second.
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Maximum node launches in flight across all pools of the provider.
    pub max_concurrency: Option<u32>,
    #[serde(default = "default_launch_retries")]
    pub launch_retries: u32,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Maximum nodes (any state) this pool may hold.
    pub max_servers: u32,
    /// Labels this pool can boot.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl PoolConfig {
    pub fn serves(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

fn default_watermark_sleep() -> f64 {
    10.0
}

fn default_cleanup_interval() -> f64 {
    60.0
}

fn default_rate() -> f64 {
    1.0
}

fn default_launch_retries() -> u32 {
    3
}

/// `value` seconds, or `fallback` if `value` is not a usable interval.
fn secs_or(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero() && value <= MAX_INTERVAL_SECS)
        .unwrap_or_else(|| Duration::from_secs_f64(fallback))
}

fn check_interval(name: &str, value: f64) -> anyhow::Result<()> {
    if !(value.is_finite() && value > 0.0 && value <= MAX_INTERVAL_SECS) {
        anyhow::bail!("{name} must be between 0 and {MAX_INTERVAL_SECS} seconds, got {value}");
    }
    Ok(())
}

impl LauncherConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LauncherConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Labels served by at least one pool.
    pub fn served_labels(&self) -> HashSet<&str> {
        self.providers
            .iter()
            .flat_map(|p| &p.pools)
            .flat_map(|pool| pool.labels.iter().map(String::as_str))
            .collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        check_interval("watermark_sleep_secs", self.launcher.watermark_sleep_secs)?;
        check_interval("cleanup_interval_secs", self.launcher.cleanup_interval_secs)?;

        let mut labels = HashSet::new();
        for label in &self.labels {
            if !labels.insert(label.name.as_str()) {
                anyhow::bail!("duplicate label {}", label.name);
            }
        }

        let mut providers = HashSet::new();
        for provider in &self.providers {
            if !providers.insert(provider.name.as_str()) {
                anyhow::bail!("duplicate provider {}", provider.name);
            }
            if !(provider.rate.is_finite() && provider.rate >= MIN_RATE) {
                anyhow::bail!(
                    "provider {}: rate must be a finite number of at least {MIN_RATE} calls per second",
                    provider.name
                );
            }
            if provider.launch_retries == 0 {
                anyhow::bail!("provider {}: launch_retries must be at least 1", provider.name);
            }
            if provider.max_concurrency == Some(0) {
                anyhow::bail!("provider {}: max_concurrency must be at least 1", provider.name);
            }
            let mut pools = HashSet::new();
            for pool in &provider.pools {
                if !pools.insert(pool.name.as_str()) {
                    anyhow::bail!("provider {}: duplicate pool {}", provider.name, pool.name);
                }
            }
        }
        tracing::debug!(providers = self.providers.len(), "launcher config validated");
        Ok(())
    }
}
