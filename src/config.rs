use crate::collector::collapse::MAX_CAS_RETRIES;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads per core
    pub concurrency: usize,
    /// Distinct (query, field) pairs whose per-segment key bitsets are remembered
    pub key_cache_queries: usize,
    /// Attach per-phase timings to responses
    pub record_timings: bool,
    /// Compare-and-swap attempts allowed per collapse update; 0 fails every update
    pub cas_retry_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            key_cache_queries: 256,
            record_timings: true,
            cas_retry_budget: MAX_CAS_RETRIES,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file; absent keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.key_cache_queries == 0 {
            return Err(Error::Config(
                "key_cache_queries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
