//! Store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// Validation constants
const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 65_536;
const MIN_GC_INTERVAL_MS: u64 = 10;
const MAX_LID_PREFIX_LENGTH: usize = 64;

/// Default chunk size for batched collection pushes.
pub const DEFAULT_BATCH_SIZE: usize = 1200;

/// Default prefix for generated lids.
pub const DEFAULT_LID_PREFIX: &str = "@lid:";

/// Default interval between automatic GC passes.
pub const DEFAULT_GC_INTERVAL_MS: u64 = 30_000;

/// How garbage collection passes are triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    /// Only when the caller invokes `Store::collect_garbage`.
    #[default]
    Manual,
    /// On a fixed interval via `Store::spawn_gc`.
    Auto,
}

/// Garbage collector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcConfig {
    /// Trigger mode.
    #[serde(default)]
    pub mode: GcMode,

    /// Interval between passes in auto mode.
    #[serde(default = "default_gc_interval_ms")]
    pub interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            mode: GcMode::Manual,
            interval_ms: DEFAULT_GC_INTERVAL_MS,
        }
    }
}

impl GcConfig {
    /// The auto-mode interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_gc_interval_ms() -> u64 {
    DEFAULT_GC_INTERVAL_MS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_lid_prefix() -> String {
    DEFAULT_LID_PREFIX.to_string()
}

/// Configuration for a [`Store`](crate::Store).
///
/// # Examples
///
/// ```rust
/// use cairn_store::{GcMode, StoreConfig};
///
/// let config = StoreConfig::builder()
///     .gc_mode(GcMode::Auto)
///     .gc_interval_ms(5_000)
///     .collection_batch_size(512)
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Garbage collector settings.
    #[serde(default)]
    pub gc: GcConfig,

    /// Chunk size used when appending to collections.
    #[serde(default = "default_batch_size")]
    pub collection_batch_size: usize,

    /// Prefix for lids generated by the identity registry.
    #[serde(default = "default_lid_prefix")]
    pub lid_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            collection_batch_size: DEFAULT_BATCH_SIZE,
            lid_prefix: DEFAULT_LID_PREFIX.to_string(),
        }
    }
}

impl StoreConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check the configuration against its bounds.
    pub fn validate(&self) -> Result<(), StoreError> {
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.collection_batch_size) {
            return Err(StoreError::InvalidConfig(format!(
                "collection_batch_size must be between {} and {}, got {}",
                MIN_BATCH_SIZE, MAX_BATCH_SIZE, self.collection_batch_size
            )));
        }

        if self.gc.mode == GcMode::Auto && self.gc.interval_ms < MIN_GC_INTERVAL_MS {
            return Err(StoreError::InvalidConfig(format!(
                "gc.interval_ms must be at least {}ms in auto mode, got {}",
                MIN_GC_INTERVAL_MS, self.gc.interval_ms
            )));
        }

        if self.lid_prefix.len() > MAX_LID_PREFIX_LENGTH {
            return Err(StoreError::InvalidConfig(format!(
                "lid_prefix exceeds {} bytes",
                MAX_LID_PREFIX_LENGTH
            )));
        }

        Ok(())
    }
}

/// Builder for [`StoreConfig`].
#[derive(Debug, Clone)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn gc_mode(mut self, mode: GcMode) -> Self {
        self.config.gc.mode = mode;
        self
    }

    pub fn gc_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.gc.interval_ms = interval_ms;
        self
    }

    pub fn collection_batch_size(mut self, size: usize) -> Self {
        self.config.collection_batch_size = size;
        self
    }

    pub fn lid_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.lid_prefix = prefix.into();
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.collection_batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.gc.mode, GcMode::Manual);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = StoreConfig::builder().collection_batch_size(0).build();
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_auto_gc_interval_bound() {
        let config = StoreConfig::builder()
            .gc_mode(GcMode::Auto)
            .gc_interval_ms(1)
            .build();
        assert!(config.validate().is_err());

        // Manual mode ignores the interval
        let config = StoreConfig::builder().gc_interval_ms(1).build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"gc": {"mode": "auto"}}"#).unwrap();
        assert_eq!(config.gc.mode, GcMode::Auto);
        assert_eq!(config.gc.interval_ms, DEFAULT_GC_INTERVAL_MS);
        assert_eq!(config.lid_prefix, DEFAULT_LID_PREFIX);
    }
}
