//! Configuration for muxstore
//!
//! Centralized configuration with sensible defaults. Directory-level
//! tunables live in [`DirectoryConfig`]; the cache wraps one of those plus
//! its own capacity limits in [`CacheConfig`].

use std::time::Duration;

use crate::error::{MuxError, Result};

/// Configuration applied to every multiplexed directory
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    // -------------------------------------------------------------------------
    // Write Closure
    // -------------------------------------------------------------------------
    /// Inactivity interval before an open write session is closed
    pub write_close_grace: Duration,

    /// Maximum time `wait_for_write_closure` waits for sessions to close
    pub exit_closure_timeout: Duration,

    /// Close remaining sessions unconditionally once the exit timeout passes
    pub exit_closure_force: bool,

    // -------------------------------------------------------------------------
    // Physical Storage
    // -------------------------------------------------------------------------
    /// Size after which the current data file is rolled over (in bytes)
    pub max_data_file_size: u64,

    // -------------------------------------------------------------------------
    // Compaction
    // -------------------------------------------------------------------------
    /// Deleted bytes that trigger a LOG_COMPACT event
    pub compact_threshold_bytes: u64,

    /// Sealed data files with a lower live/total ratio get rewritten
    pub compact_live_ratio: f64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            write_close_grace: Duration::from_millis(1000),
            exit_closure_timeout: Duration::from_secs(30),
            exit_closure_force: false,
            max_data_file_size: 64 * 1024 * 1024, // 64 MB
            compact_threshold_bytes: 16 * 1024 * 1024, // 16 MB
            compact_live_ratio: 0.5,
        }
    }
}

impl DirectoryConfig {
    /// Create a new config builder
    pub fn builder() -> DirectoryConfigBuilder {
        DirectoryConfigBuilder::default()
    }

    /// Check the config for values that would stall or corrupt a directory
    pub fn validate(&self) -> Result<()> {
        if self.max_data_file_size == 0 {
            return Err(MuxError::Config(
                "max_data_file_size must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.compact_live_ratio) {
            return Err(MuxError::Config(format!(
                "compact_live_ratio must be within [0, 1], got {}",
                self.compact_live_ratio
            )));
        }
        Ok(())
    }
}

/// Builder for DirectoryConfig
#[derive(Default)]
pub struct DirectoryConfigBuilder {
    config: DirectoryConfig,
}

impl DirectoryConfigBuilder {
    /// Set the write-close grace interval
    pub fn write_close_grace(mut self, grace: Duration) -> Self {
        self.config.write_close_grace = grace;
        self
    }

    /// Set the exit-closure timeout
    pub fn exit_closure_timeout(mut self, timeout: Duration) -> Self {
        self.config.exit_closure_timeout = timeout;
        self
    }

    /// Force closure once the exit timeout is exceeded
    pub fn exit_closure_force(mut self, force: bool) -> Self {
        self.config.exit_closure_force = force;
        self
    }

    /// Set the data file roll-over size (in bytes)
    pub fn max_data_file_size(mut self, size: u64) -> Self {
        self.config.max_data_file_size = size;
        self
    }

    /// Set the garbage threshold that emits LOG_COMPACT (in bytes)
    pub fn compact_threshold_bytes(mut self, bytes: u64) -> Self {
        self.config.compact_threshold_bytes = bytes;
        self
    }

    /// Set the live ratio below which sealed data files are rewritten
    pub fn compact_live_ratio(mut self, ratio: f64) -> Self {
        self.config.compact_live_ratio = ratio;
        self
    }

    pub fn build(self) -> DirectoryConfig {
        self.config
    }
}

/// Configuration for the directory cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    // -------------------------------------------------------------------------
    // Capacity
    // -------------------------------------------------------------------------
    /// Soft limit on resident directories
    pub cache_dir_max: usize,

    /// Soft limit on streams summed over resident directories
    pub cache_stream_max: usize,

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------
    /// Interval of the background eviction sweep
    pub cache_timer: Duration,

    /// Maximum directories evicted by one sweep pass
    pub write_cache_dir_liner: usize,

    /// Delay between a LOG_COMPACT event and the cache releasing the directory
    pub release_delay: Duration,

    // -------------------------------------------------------------------------
    // Directories
    // -------------------------------------------------------------------------
    /// Config for every directory the cache constructs
    pub directory: DirectoryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir_max: 100,
            cache_stream_max: 100_000,
            cache_timer: Duration::from_secs(1),
            write_cache_dir_liner: 10,
            release_delay: Duration::from_millis(1000),
            directory: DirectoryConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new config builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate cache limits and the nested directory config
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir_max == 0 {
            return Err(MuxError::Config("cache_dir_max must be non-zero".to_string()));
        }
        if self.write_cache_dir_liner == 0 {
            return Err(MuxError::Config(
                "write_cache_dir_liner must be non-zero".to_string(),
            ));
        }
        if self.cache_timer.is_zero() {
            return Err(MuxError::Config("cache_timer must be non-zero".to_string()));
        }
        self.directory.validate()
    }
}

/// Builder for CacheConfig
#[derive(Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Set the sweep interval
    pub fn cache_timer(mut self, interval: Duration) -> Self {
        self.config.cache_timer = interval;
        self
    }

    /// Set the resident directory limit
    pub fn cache_dir_max(mut self, count: usize) -> Self {
        self.config.cache_dir_max = count;
        self
    }

    /// Set the resident stream limit
    pub fn cache_stream_max(mut self, count: usize) -> Self {
        self.config.cache_stream_max = count;
        self
    }

    /// Set the maximum evictions per sweep
    pub fn write_cache_dir_liner(mut self, count: usize) -> Self {
        self.config.write_cache_dir_liner = count;
        self
    }

    /// Set the LOG_COMPACT release delay
    pub fn release_delay(mut self, delay: Duration) -> Self {
        self.config.release_delay = delay;
        self
    }

    /// Set the config used for constructed directories
    pub fn directory(mut self, directory: DirectoryConfig) -> Self {
        self.config.directory = directory;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}
