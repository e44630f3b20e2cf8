use std::path::Path;
use std::time::Duration;

use hongbao_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::types::AllocatorError;

/// Top-level configuration, usually loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HongbaoConfig {
    /// Seed for partitions and packet ids. Unset means seeded from OS entropy.
    pub rng_seed: Option<u64>,
    pub allocator: AllocatorConfig,
    pub store: StoreConfig,
}

/// Claim allocator tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Minimum read-decide-write attempts per call before giving up with a
    /// transient failure. A claim always gets at least `share_count + 1`.
    pub max_attempts: u32,
    /// Base backoff between conflicting attempts, in microseconds.
    /// Zero means just yield to the scheduler.
    pub backoff_base_us: u64,
    /// Upper bound on a single backoff, in microseconds.
    pub backoff_max_us: u64,
    /// Largest share count a packet may be created with.
    pub max_share_count: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 64,
            backoff_base_us: 0,
            backoff_max_us: 2_000,
            max_share_count: 10_000,
        }
    }
}

impl AllocatorConfig {
    /// Backoff ceiling for the given 1-based attempt: exponential in the attempt
    /// number, capped at `backoff_max_us`. `None` when backoff is disabled.
    pub fn backoff_ceiling(&self, attempt: u32) -> Option<Duration> {
        if self.backoff_base_us == 0 {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(16);
        let us = self
            .backoff_base_us
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_us);
        Some(Duration::from_micros(us))
    }

    /// Reject packets larger than `max_share_count`.
    pub fn check_share_count(&self, share_count: usize) -> Result<(), AllocatorError> {
        if share_count > self.max_share_count as usize {
            return Err(AllocatorError::InvalidConfiguration(format!(
                "share count {share_count} exceeds limit of {}",
                self.max_share_count
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AllocatorError> {
        if self.max_attempts == 0 {
            return Err(AllocatorError::Config("max_attempts must be > 0".into()));
        }
        if self.max_share_count == 0 {
            return Err(AllocatorError::Config("max_share_count must be > 0".into()));
        }
        if self.backoff_base_us > self.backoff_max_us {
            return Err(AllocatorError::Config(format!(
                "backoff_base_us ({}) exceeds backoff_max_us ({})",
                self.backoff_base_us, self.backoff_max_us
            )));
        }
        Ok(())
    }
}

impl HongbaoConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, AllocatorError> {
        let config: HongbaoConfig =
            toml::from_str(s).map_err(|e| AllocatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, AllocatorError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AllocatorError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Write the config as TOML.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), AllocatorError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| AllocatorError::Config(e.to_string()))?;
        std::fs::write(path, contents)
            .map_err(|e| AllocatorError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), AllocatorError> {
        self.allocator.validate()
    }
}
