//! Parallel grain compression.
//!
//! Compression of the grains of one image runs on a rayon pool. Results
//! come back in input order so grains are written sequentially.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compression level for image grains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Fast compression (zlib level 1).
    Fast,
    /// Balanced compression (zlib level 6).
    #[default]
    Balanced,
    /// Maximum compression (zlib level 9).
    Max,
}

impl CompressionLevel {
    pub fn to_zlib_level(self) -> u32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 6,
            CompressionLevel::Max => 9,
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineConfig {
    pub compression: CompressionLevel,
    /// Worker threads; 0 uses rayon's global pool.
    pub num_threads: usize,
}

impl PipelineConfig {
    pub fn new(compression: CompressionLevel, num_threads: usize) -> Self {
        Self {
            compression,
            num_threads,
        }
    }
}

/// Order-preserving parallel map over byte chunks.
pub struct Pipeline {
    config: PipelineConfig,
    pool: Option<rayon::ThreadPool>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let pool = if config.num_threads == 0 {
            None
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_threads)
                .thread_name(|i| format!("ovfexport-grain-{}", i))
                .build()
                .map_err(|e| Error::pipeline(format!("failed to build thread pool: {}", e)))?;
            Some(pool)
        };
        Ok(Self { config, pool })
    }

    pub fn compression_level(&self) -> u32 {
        self.config.compression.to_zlib_level()
    }

    /// Apply `f` to every chunk in parallel, returning results in input order.
    ///
    /// The first error aborts the batch.
    pub fn process<T, F>(&self, chunks: Vec<Vec<u8>>, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize, Vec<u8>) -> Result<T> + Sync + Send,
    {
        let run = || {
            chunks
                .into_par_iter()
                .enumerate()
                .map(|(idx, chunk)| f(idx, chunk))
                .collect::<Result<Vec<T>>>()
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("config", &self.config).finish()
    }
}
