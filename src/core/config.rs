//! Manager configuration
//!
//! ```toml
//! memory_prefix = "mem"
//! max_block_size = 268435456
//! initial_name_capacity = 256
//!
//! [[disk]]
//! prefix = "disk"
//! root = "assets"
//! extension = "rbdl"
//! mmap = true
//! ```

use crate::error::{BundleError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One directory of bundle files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStorageConfig {
    pub prefix: String,
    pub root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default)]
    pub mmap: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub disk: Vec<DiskStorageConfig>,
    pub memory_prefix: String,
    /// Largest single resident block, in bytes
    pub max_block_size: usize,
    pub initial_name_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            disk: Vec::new(),
            memory_prefix: "mem".to_string(),
            max_block_size: 1 << 30,
            initial_name_capacity: 64,
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ManagerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let mut prefixes: Vec<&str> = self.disk.iter().map(|d| d.prefix.as_str()).collect();
        if !self.memory_prefix.is_empty() {
            prefixes.push(&self.memory_prefix);
        }
        for (i, prefix) in prefixes.iter().enumerate() {
            if prefix.is_empty() || prefix.contains('$') {
                return Err(BundleError::Config(format!(
                    "Storage prefix '{}' must be non-empty and free of '$'",
                    prefix
                )));
            }
            if prefixes[..i].contains(prefix) {
                return Err(BundleError::Config(format!(
                    "Storage prefix '{}' is configured twice",
                    prefix
                )));
            }
        }
        if self.max_block_size == 0 {
            return Err(BundleError::Config("max_block_size must be positive".to_string()));
        }
        Ok(())
    }
}
