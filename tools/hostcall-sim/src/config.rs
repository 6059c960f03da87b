//! Simulator configuration file
//!
//! ```toml
//! threads = 16
//! calls = 2000
//! printf_every = 250
//!
//! [hostcall]
//! capacity = 64
//! workers = 4
//! backpressure = { policy = "bounded", attempts = 1000 }
//! ```

use std::fs;
use std::path::Path;

use anyhow::Context;
use kaal_hostcall::HostcallConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Simulated device threads
    pub threads: usize,
    /// Calls issued by each thread
    pub calls: usize,
    /// Every Nth call is a printf, `0` disables printf traffic
    pub printf_every: usize,
    /// Send printf output to stdout instead of an in-memory buffer
    pub printf_to_stdout: bool,
    pub hostcall: HostcallConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            calls: 1000,
            printf_every: 100,
            printf_to_stdout: false,
            hostcall: HostcallConfig {
                capacity: 64,
                ..HostcallConfig::default()
            },
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: SimConfig = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.hostcall.validate()?;
        if self.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }
        Ok(())
    }
}
