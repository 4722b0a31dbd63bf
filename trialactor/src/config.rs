/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for trialactor.
//!
//! Process-wide settings live in [`Config`], which is loaded from
//! environment variables or a YAML file and kept in a global store
//! ([`global`]) that tests may temporarily override. Per-trial settings
//! live in [`TrialConfig`] and are passed to each trial at creation.

use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

const INVALID_HP_KILL_DELAY_SECS: &str = "TRIALACTOR_INVALID_HP_KILL_DELAY_SECS";
const REATTACH_ENABLED: &str = "TRIALACTOR_REATTACH_ENABLED";
const REATTACH_RESOURCE_POOLS: &str = "TRIALACTOR_REATTACH_RESOURCE_POOLS";
const TASK_LOG_BATCH_SIZE: &str = "TRIALACTOR_TASK_LOG_BATCH_SIZE";
const TASK_LOG_FLUSH_INTERVAL_MS: &str = "TRIALACTOR_TASK_LOG_FLUSH_INTERVAL_MS";
const SSH_RSA_SIZE: &str = "TRIALACTOR_SSH_RSA_SIZE";

/// Process-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a trial waits for a workload that reported invalid
    /// hyperparameters to exit on its own before killing it.
    pub invalid_hp_kill_delay: Duration,
    /// Reattachment of allocations that survived a master restart.
    pub reattach: ReattachConfig,
    /// Task log batching.
    pub task_log: TaskLogConfig,
    /// Size, in bits, of the RSA keys generated for trials.
    pub ssh_rsa_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            invalid_hp_kill_delay: Duration::from_secs(10),
            reattach: ReattachConfig::default(),
            task_log: TaskLogConfig::default(),
            ssh_rsa_size: 4096,
        }
    }
}

/// Reattachment settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReattachConfig {
    /// Whether reattachment is enabled at all.
    pub enabled: bool,
    /// The pools for which reattachment is enabled. Empty means all.
    pub resource_pools: Vec<String>,
}

impl ReattachConfig {
    /// Whether allocations in `pool` may be reattached.
    pub fn is_enabled_for_pool(&self, pool: &str) -> bool {
        self.enabled
            && (self.resource_pools.is_empty() || self.resource_pools.iter().any(|p| p == pool))
    }
}

/// Task log batching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLogConfig {
    /// Maximum number of logs written to the backend at once.
    pub batch_size: usize,
    /// Maximum time a log waits in the queue before being written.
    pub flush_interval: Duration,
}

impl Default for TaskLogConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(1),
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring unparsable configuration value");
            None
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = parse_env::<u64>(INVALID_HP_KILL_DELAY_SECS) {
            config.invalid_hp_kill_delay = Duration::from_secs(secs);
        }
        if let Some(enabled) = parse_env::<bool>(REATTACH_ENABLED) {
            config.reattach.enabled = enabled;
        }
        if let Ok(pools) = env::var(REATTACH_RESOURCE_POOLS) {
            config.reattach.resource_pools = pools
                .split(',')
                .map(str::trim)
                .filter(|pool| !pool.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(batch_size) = parse_env::<usize>(TASK_LOG_BATCH_SIZE) {
            config.task_log.batch_size = batch_size;
        }
        if let Some(ms) = parse_env::<u64>(TASK_LOG_FLUSH_INTERVAL_MS) {
            config.task_log.flush_interval = Duration::from_millis(ms);
        }
        if let Some(bits) = parse_env::<usize>(SSH_RSA_SIZE) {
            config.ssh_rsa_size = bits;
        }

        config
    }

    /// Load configuration from a YAML file. Missing keys take their
    /// default values.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Save configuration to a YAML file
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Merge with another configuration: every value of `other` that
    /// differs from its default takes precedence.
    pub fn merge(&mut self, other: &Self) {
        let defaults = Self::default();
        if other.invalid_hp_kill_delay != defaults.invalid_hp_kill_delay {
            self.invalid_hp_kill_delay = other.invalid_hp_kill_delay;
        }
        if other.reattach.enabled != defaults.reattach.enabled {
            self.reattach.enabled = other.reattach.enabled;
        }
        if other.reattach.resource_pools != defaults.reattach.resource_pools {
            self.reattach.resource_pools = other.reattach.resource_pools.clone();
        }
        if other.task_log.batch_size != defaults.task_log.batch_size {
            self.task_log.batch_size = other.task_log.batch_size;
        }
        if other.task_log.flush_interval != defaults.task_log.flush_interval {
            self.task_log.flush_interval = other.task_log.flush_interval;
        }
        if other.ssh_rsa_size != defaults.ssh_rsa_size {
            self.ssh_rsa_size = other.ssh_rsa_size;
        }
    }
}

/// Per-trial configuration, fixed by the experiment that creates the
/// trial (except for the resource pool, which may be changed while the
/// trial runs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialConfig {
    /// Number of ordinary failures tolerated before the trial errors.
    pub max_restarts: u32,
    /// Resources requested for each allocation.
    pub resources: ResourcesConfig,
    /// Free-form labels, passed through to the task spec.
    pub labels: BTreeMap<String, String>,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            resources: ResourcesConfig::default(),
            labels: BTreeMap::new(),
        }
    }
}

/// Resource requirements of a trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Slots needed by each allocation.
    pub slots_per_trial: usize,
    /// The pool to allocate from.
    pub resource_pool: String,
    /// Scheduling label constraining which agents may be used.
    pub agent_label: String,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            slots_per_trial: 1,
            resource_pool: "default".to_string(),
            agent_label: String::new(),
        }
    }
}

/// Global configuration functions
///
/// Tests that depend on specific global values acquire [`global::lock`]
/// and override through the returned [`global::ConfigLock`]; this
/// serializes such tests and restores the configuration afterwards.
///
/// ```ignore rust
/// let config = trialactor::config::global::lock();
/// let _guard = config.override_config(|c| c.reattach.enabled = true);
/// ```
pub mod global {
    use std::sync::Mutex;
    use std::sync::MutexGuard;

    use super::*;

    /// Global configuration instance, initialized from environment variables.
    static CONFIG: LazyLock<Arc<RwLock<Config>>> =
        LazyLock::new(|| Arc::new(RwLock::new(Config::from_env())));

    /// Acquire the global configuration lock for testing.
    pub fn lock() -> ConfigLock {
        static MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));
        ConfigLock {
            // A test that panicked while holding the lock has already
            // restored the configuration through its guard.
            _guard: MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Initialize the global configuration from environment variables
    pub fn init_from_env() {
        *CONFIG.write().unwrap() = Config::from_env();
    }

    /// Initialize the global configuration from a YAML file
    pub fn init_from_yaml<P: AsRef<Path>>(path: P) -> Result<(), anyhow::Error> {
        let config = Config::from_yaml(path)?;
        *CONFIG.write().unwrap() = config;
        Ok(())
    }

    /// A snapshot of the global configuration.
    pub fn get() -> Config {
        CONFIG.read().unwrap().clone()
    }

    /// Reset the global configuration to defaults (for testing only)
    pub fn reset_to_defaults() {
        *CONFIG.write().unwrap() = Config::default();
    }

    /// Holds the global configuration lock; the only way to create
    /// overrides.
    pub struct ConfigLock {
        _guard: MutexGuard<'static, ()>,
    }

    impl ConfigLock {
        /// Modify the global configuration until the returned guard is
        /// dropped.
        pub fn override_config(&self, modify: impl FnOnce(&mut Config)) -> ConfigGuard<'_> {
            let mut config = CONFIG.write().unwrap();
            let orig = (*config).clone();
            modify(&mut *config);
            ConfigGuard {
                orig: Some(orig),
                _lock: self,
            }
        }
    }

    /// Restores the global configuration when dropped.
    pub struct ConfigGuard<'a> {
        orig: Option<Config>,
        _lock: &'a ConfigLock,
    }

    impl Drop for ConfigGuard<'_> {
        fn drop(&mut self) {
            if let Some(orig) = self.orig.take() {
                let mut config = CONFIG
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *config = orig;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.invalid_hp_kill_delay, Duration::from_secs(10));
        assert!(!config.reattach.enabled);
        assert_eq!(config.task_log.batch_size, 1000);
        assert_eq!(config.task_log.flush_interval, Duration::from_secs(1));
        assert_eq!(config.ssh_rsa_size, 4096);
    }

    #[test]
    fn test_from_env() {
        let _config = global::lock();
        env::set_var(INVALID_HP_KILL_DELAY_SECS, "3");
        env::set_var(REATTACH_ENABLED, "true");
        env::set_var(REATTACH_RESOURCE_POOLS, "gpu, cpu,");
        env::set_var(TASK_LOG_BATCH_SIZE, "not-a-number");

        let config = Config::from_env();
        assert_eq!(config.invalid_hp_kill_delay, Duration::from_secs(3));
        assert!(config.reattach.enabled);
        assert_eq!(config.reattach.resource_pools, vec!["gpu", "cpu"]);
        // Unparsable values fall back to defaults.
        assert_eq!(config.task_log.batch_size, 1000);

        env::remove_var(INVALID_HP_KILL_DELAY_SECS);
        env::remove_var(REATTACH_ENABLED);
        env::remove_var(REATTACH_RESOURCE_POOLS);
        env::remove_var(TASK_LOG_BATCH_SIZE);
    }

    #[test]
    fn test_reattach_pools() {
        let mut reattach = ReattachConfig::default();
        assert!(!reattach.is_enabled_for_pool("gpu"));
        reattach.enabled = true;
        assert!(reattach.is_enabled_for_pool("gpu"));
        reattach.resource_pools = vec!["cpu".to_string()];
        assert!(!reattach.is_enabled_for_pool("gpu"));
        assert!(reattach.is_enabled_for_pool("cpu"));
    }

    #[test]
    fn test_merge() {
        let mut config1 = Config::default();
        config1.ssh_rsa_size = 2048;
        let mut config2 = Config::default();
        config2.invalid_hp_kill_delay = Duration::from_secs(1);

        config1.merge(&config2);

        assert_eq!(config1.invalid_hp_kill_delay, Duration::from_secs(1));
        assert_eq!(config1.ssh_rsa_size, 2048);
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.reattach.enabled = true;
        config.to_yaml(&path).unwrap();
        assert_eq!(Config::from_yaml(&path).unwrap(), config);

        std::fs::write(&path, "ssh_rsa_size: 1024\n").unwrap();
        let partial = Config::from_yaml(&path).unwrap();
        assert_eq!(partial.ssh_rsa_size, 1024);
        assert_eq!(partial.task_log, TaskLogConfig::default());
    }

    #[test]
    fn test_global_config() {
        let config = global::lock();
        global::reset_to_defaults();

        {
            let _guard = config.override_config(|c| c.reattach.enabled = true);
            assert!(global::get().reattach.enabled);
        }

        assert!(!global::get().reattach.enabled);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "ssh_rsa_size: 2048\n").unwrap();
        global::init_from_yaml(&path).unwrap();
        assert_eq!(global::get().ssh_rsa_size, 2048);
        assert!(global::init_from_yaml(dir.path().join("missing.yaml")).is_err());
        assert_eq!(global::get().ssh_rsa_size, 2048);

        global::init_from_env();
        assert_eq!(global::get(), Config::from_env());
        global::reset_to_defaults();
    }
}
