//! Runtime configuration
//!
//! Loaded from the `[hostcall]` table of a TOML file by the tooling, or
//! built in code. Every field has a default so an empty table is valid.

use serde::{Deserialize, Serialize};

use crate::error::{HostcallError, Result};

/// What a caller does when every slot is busy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Backpressure {
    /// Report exhaustion immediately
    #[default]
    FailFast,
    /// Retry up to `attempts` times with backoff, then report exhaustion
    Bounded { attempts: u32 },
    /// Retry until a slot frees up
    Unbounded,
}

/// Settings for the slot table and the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostcallConfig {
    /// Number of slots in the table
    pub capacity: usize,
    /// Worker threads serving claimed slots, `0` serves on the poller thread
    pub workers: usize,
    pub backpressure: Backpressure,
    /// How long the poller parks after a fruitless sweep
    pub idle_sleep_us: u64,
}

impl Default for HostcallConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            workers: 4,
            backpressure: Backpressure::default(),
            idle_sleep_us: 50,
        }
    }
}

impl HostcallConfig {
    /// Check the values are usable
    ///
    /// # Errors
    /// Returns `HostcallError::InvalidCapacity` if `capacity` is zero
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(HostcallError::InvalidCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostcallConfig::default();
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.backpressure, Backpressure::FailFast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: HostcallConfig = toml::from_str(
            r#"
            capacity = 8
            backpressure = { policy = "bounded", attempts = 16 }
            "#,
        )
        .unwrap();
        assert_eq!(config.capacity, 8);
        assert_eq!(config.workers, 4);
        assert_eq!(config.backpressure, Backpressure::Bounded { attempts: 16 });
    }

    #[test]
    fn test_zero_capacity_invalid() {
        let config = HostcallConfig {
            capacity: 0,
            ..HostcallConfig::default()
        };
        assert_eq!(config.validate(), Err(HostcallError::InvalidCapacity));
    }
}
