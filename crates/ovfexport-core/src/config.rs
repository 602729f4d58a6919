//! Export configuration.
//!
//! Settings are read from a TOML file; every field has a default so an
//! empty file is a valid configuration.
//!
//! ```toml
//! chunk_size = 1048576
//! compression = "balanced"
//! threads = 0
//! default_boot_policy = "BIOS order"
//!
//! [transfer]
//! network_id = "net-storage"
//! static_ip = true
//! address = "10.0.0.5"
//! mask = "255.255.255.0"
//! gateway = "10.0.0.1"
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pipeline::{CompressionLevel, PipelineConfig};
use crate::transfer::TransferNetwork;

/// Default streaming chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Boot policy that marks a VM as booting through emulated firmware.
pub const DEFAULT_BOOT_POLICY: &str = "BIOS order";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Bytes read from the transfer stream per chunk.
    pub chunk_size: usize,
    pub compression: CompressionLevel,
    /// Compression threads; 0 uses rayon's default.
    pub threads: usize,
    pub default_boot_policy: String,
    pub transfer: TransferNetwork,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: CompressionLevel::default(),
            threads: 0,
            default_boot_policy: DEFAULT_BOOT_POLICY.to_string(),
            transfer: TransferNetwork::default(),
        }
    }
}

impl ExportConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::config(format!("invalid TOML in '{}': {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size must be greater than zero"));
        }
        self.transfer.validate()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new(self.compression, self.threads)
    }
}
