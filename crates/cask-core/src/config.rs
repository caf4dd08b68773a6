use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CaskError, Result};

fn default_min_fragment_size() -> u32 {
    4096
}

fn default_max_fragment_bits() -> u32 {
    19
}

fn default_avg_fragment_size() -> u32 {
    6 // 6 = 64 KiB mean, 7 = 128 KiB mean
}

fn default_include_zero_size() -> bool {
    true
}

fn default_sort_memory_budget() -> usize {
    256 * 1024 * 1024
}

/// Parameters of the content-defined chunker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default = "default_min_fragment_size")]
    pub min_fragment_size: u32,
    #[serde(default = "default_max_fragment_bits")]
    pub max_fragment_bits: u32,
    #[serde(default = "default_avg_fragment_size")]
    pub avg_fragment_size: u32,
    /// Shrink the maximum fragment by one byte so lengths stay
    /// representable in the 19-bit size field of a key.
    #[serde(default = "default_include_zero_size")]
    pub include_zero_size: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_fragment_size: default_min_fragment_size(),
            max_fragment_bits: default_max_fragment_bits(),
            avg_fragment_size: default_avg_fragment_size(),
            include_zero_size: default_include_zero_size(),
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(19..=20).contains(&self.max_fragment_bits) {
            return Err(CaskError::config(format!(
                "max_fragment_bits must be 19 or 20, got {}",
                self.max_fragment_bits
            )));
        }
        if !(6..=7).contains(&self.avg_fragment_size) {
            return Err(CaskError::config(format!(
                "avg_fragment_size must be 6 (64 KiB) or 7 (128 KiB), got {}",
                self.avg_fragment_size
            )));
        }
        let buffer_size = 1u32 << self.max_fragment_bits;
        if self.min_fragment_size == 0
            || self.min_fragment_size % 1024 != 0
            || self.min_fragment_size > buffer_size / 2
        {
            return Err(CaskError::config(format!(
                "min_fragment_size must be a multiple of 1024 and at most {}, got {}",
                buffer_size / 2,
                self.min_fragment_size
            )));
        }
        Ok(())
    }
}

/// Parameters of the key store and its on-disk logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for `fi.log` and `lk.dat`. Unset means the current
    /// working directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Memory budget of the external sorts over the fragment log.
    #[serde(default = "default_sort_memory_budget")]
    pub sort_memory_budget: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            sort_memory_budget: default_sort_memory_budget(),
        }
    }
}

impl StoreConfig {
    pub fn with_log_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: Some(dir.into()),
            sort_memory_budget: default_sort_memory_budget(),
        }
    }
}
