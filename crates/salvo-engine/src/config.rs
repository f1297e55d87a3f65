//! Simulation configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration.
//!
//! ```
//! use salvo_engine::config::SimulationConfig;
//!
//! let config = SimulationConfig::from_json_str(r#"{ "chunk_size": 64 }"#).unwrap();
//! assert_eq!(config.chunk_size, 64);
//! assert_eq!(config.fixed_dt, 1.0 / 60.0);
//! ```

use std::path::{Path, PathBuf};

use glam::Vec3;
use salvo_ecs::schedule::PipelineConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("fixed_dt must be positive and finite, got {0}")]
    InvalidFixedDt(f64),

    #[error("chunk_size must be at least 1")]
    ZeroChunkSize,

    #[error("worker_threads must be at least 1 when set")]
    ZeroWorkerThreads,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Seconds per tick.
    pub fixed_dt: f64,
    /// Maximum rows per chunk.
    pub chunk_size: usize,
    pub parallel: bool,
    /// Dedicated worker pool size; `None` uses the global rayon pool.
    pub worker_threads: Option<usize>,
    /// World gravity in units per second squared.
    pub world_gravity: [f32; 3],
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            chunk_size: 128,
            parallel: true,
            worker_threads: None,
            world_gravity: [0.0, 0.0, -980.0],
        }
    }
}

impl SimulationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fixed_dt > 0.0 && self.fixed_dt.is_finite()) {
            return Err(ConfigError::InvalidFixedDt(self.fixed_dt));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::ZeroWorkerThreads);
        }
        Ok(())
    }

    pub fn gravity(&self) -> Vec3 {
        Vec3::from_array(self.world_gravity)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            chunk_size: self.chunk_size,
            parallel: self.parallel,
            worker_threads: self.worker_threads,
        }
    }
}
