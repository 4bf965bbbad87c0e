use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Largest accepted `rollup.top_n`.
pub const MAX_TOP_N: usize = 100;

/// Largest accepted `synthetic.rate`, in events per second.
pub const MAX_SYNTHETIC_RATE: u32 = 1_000_000;

/// Top-level configuration for the rollupd daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Throttle dispatcher configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Rollup computation configuration.
    #[serde(default)]
    pub rollup: RollupConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Synthetic event generator for local runs.
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

/// Throttle dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Number of concurrent drain workers. Default: 4.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Capacity of the submission channel. Default: 1024.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Minimum spacing between two runs of the same key. Default: 5s.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Run every pending key once when the dispatcher is cancelled. Default: false.
    #[serde(default)]
    pub flush_on_shutdown: bool,
}

/// Rollup computation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    /// Entries kept per breakdown list. Default: 5.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Synthetic event generator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyntheticConfig {
    /// Generate fake events. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Number of fake projects. Default: 3.
    #[serde(default = "default_synthetic_projects")]
    pub projects: usize,

    /// Number of fake owning users. Default: 1.
    #[serde(default = "default_synthetic_users")]
    pub users: usize,

    /// Events per second across all projects. Default: 20.
    #[serde(default = "default_synthetic_rate")]
    pub rate: u32,

    /// RNG seed so runs are reproducible. Default: 1.
    #[serde(default = "default_synthetic_seed")]
    pub seed: u64,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_buffer_size() -> usize {
    1024
}

fn default_window() -> Duration {
    Duration::from_secs(5)
}

fn default_top_n() -> usize {
    5
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_synthetic_projects() -> usize {
    3
}

fn default_synthetic_users() -> usize {
    1
}

fn default_synthetic_rate() -> u32 {
    20
}

fn default_synthetic_seed() -> u64 {
    1
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dispatcher: DispatcherConfig::default(),
            rollup: RollupConfig::default(),
            health: HealthConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            buffer_size: default_buffer_size(),
            window: default_window(),
            flush_on_shutdown: false,
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            projects: default_synthetic_projects(),
            users: default_synthetic_users(),
            rate: default_synthetic_rate(),
            seed: default_synthetic_seed(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.dispatcher.validate()?;

        if self.rollup.top_n == 0 || self.rollup.top_n > MAX_TOP_N {
            bail!("rollup.top_n must be between 1 and {MAX_TOP_N}");
        }

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        if self.synthetic.enabled {
            if self.synthetic.projects == 0 {
                bail!("synthetic.projects must be positive when enabled");
            }

            if self.synthetic.users == 0 {
                bail!("synthetic.users must be positive when enabled");
            }

            if self.synthetic.rate == 0 || self.synthetic.rate > MAX_SYNTHETIC_RATE {
                bail!("synthetic.rate must be between 1 and {MAX_SYNTHETIC_RATE} when enabled");
            }
        }

        Ok(())
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("dispatcher.pool_size must be positive");
        }

        if self.buffer_size == 0 {
            bail!("dispatcher.buffer_size must be positive");
        }

        if self.window.is_zero() {
            bail!("dispatcher.window must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.dispatcher.pool_size, 4);
        assert_eq!(cfg.dispatcher.buffer_size, 1024);
        assert_eq!(cfg.dispatcher.window, Duration::from_secs(5));
        assert!(!cfg.dispatcher.flush_on_shutdown);
        assert_eq!(cfg.rollup.top_n, 5);
        assert_eq!(cfg.health.addr, ":9090");
        assert!(!cfg.synthetic.enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
log_level: debug
dispatcher:
  pool_size: 8
  window: 250ms
  flush_on_shutdown: true
rollup:
  top_n: 10
synthetic:
  enabled: true
  rate: 50
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.dispatcher.pool_size, 8);
        assert_eq!(cfg.dispatcher.buffer_size, 1024);
        assert_eq!(cfg.dispatcher.window, Duration::from_millis(250));
        assert!(cfg.dispatcher.flush_on_shutdown);
        assert_eq!(cfg.rollup.top_n, 10);
        assert_eq!(cfg.synthetic.projects, 3);
        assert_eq!(cfg.synthetic.rate, 50);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_pool_size() {
        let mut cfg = Config::default();
        cfg.dispatcher.pool_size = 0;

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("dispatcher.pool_size"));
    }

    #[test]
    fn test_validation_zero_buffer_size() {
        let mut cfg = Config::default();
        cfg.dispatcher.buffer_size = 0;

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("dispatcher.buffer_size"));
    }

    #[test]
    fn test_validation_zero_window() {
        let mut cfg = Config::default();
        cfg.dispatcher.window = Duration::ZERO;

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("dispatcher.window"));
    }

    #[test]
    fn test_validation_top_n_out_of_range() {
        let mut cfg = Config::default();
        cfg.rollup.top_n = 0;
        assert!(cfg.validate().is_err());

        cfg.rollup.top_n = MAX_TOP_N + 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("rollup.top_n"));
    }

    #[test]
    fn test_validation_synthetic_only_checked_when_enabled() {
        let mut cfg = Config::default();
        cfg.synthetic.rate = 0;
        assert!(cfg.validate().is_ok());

        cfg.synthetic.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("synthetic.rate"));
    }

    #[test]
    fn test_validation_synthetic_rate_upper_bound() {
        let mut cfg = Config::default();
        cfg.synthetic.enabled = true;

        cfg.synthetic.rate = MAX_SYNTHETIC_RATE;
        assert!(cfg.validate().is_ok());

        cfg.synthetic.rate = u32::MAX;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("synthetic.rate"));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dispatcher:\n  pool_size: 0").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("dispatcher.pool_size"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/rollupd.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
