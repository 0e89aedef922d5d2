//! Configuration options for tablecache.

/// Default number of descriptors kept before the unused list is trimmed.
pub const DEFAULT_DESCRIPTOR_CACHE_SIZE: usize = 400;

/// Default handle capacity of a single accounting instance.
pub const DEFAULT_HANDLE_CACHE_SIZE: usize = 250;

/// Default number of accounting instances that may be activated.
pub const DEFAULT_MAX_INSTANCES: usize = 8;

/// Hard upper bound for `max_instances`.
pub const MAX_INSTANCES: usize = 64;

/// Blocking acquisitions that complete one contention sample.
pub const DEFAULT_CONTENTION_STALL_THRESHOLD: u32 = 20_000;

/// Non-blocking acquisitions after which the sample is discarded.
pub const DEFAULT_CONTENTION_SAMPLE_WINDOW: u32 = 80_000;

/// Cache configuration options.
///
/// Sizes may be changed on a live cache; the instance count and the
/// contention constants are fixed once the cache is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    // === Descriptors ===
    /// Number of cached descriptors above which unused ones are deleted.
    pub descriptor_cache_size: usize,

    // === Handles ===
    /// Capacity of each accounting instance (idle + in-use handles).
    pub handle_cache_size: usize,

    /// Maximum number of accounting instances.
    pub max_instances: usize,

    // === Contention ===
    /// Blocking lock acquisitions that trigger instance activation.
    pub contention_stall_threshold: u32,

    /// Non-blocking acquisitions that reset the sample.
    pub contention_sample_window: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            descriptor_cache_size: DEFAULT_DESCRIPTOR_CACHE_SIZE,
            handle_cache_size: DEFAULT_HANDLE_CACHE_SIZE,
            max_instances: DEFAULT_MAX_INSTANCES,
            contention_stall_threshold: DEFAULT_CONTENTION_STALL_THRESHOLD,
            contention_sample_window: DEFAULT_CONTENTION_SAMPLE_WINDOW,
        }
    }
}

impl CacheOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_instances == 0 || self.max_instances > MAX_INSTANCES {
            return Err(crate::Error::InvalidConfiguration(format!(
                "max_instances must be between 1 and {}",
                MAX_INSTANCES
            )));
        }

        if self.contention_stall_threshold == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "contention_stall_threshold must be positive".into(),
            ));
        }

        if self.contention_sample_window == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "contention_sample_window must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Check that `next` only changes settings that may change live.
    pub(crate) fn check_live_update(&self, next: &CacheOptions) -> crate::Result<()> {
        next.validate()?;

        if next.max_instances != self.max_instances {
            return Err(crate::Error::InvalidConfiguration(
                "max_instances cannot be changed on a running cache".into(),
            ));
        }

        if next.contention_stall_threshold != self.contention_stall_threshold
            || next.contention_sample_window != self.contention_sample_window
        {
            return Err(crate::Error::InvalidConfiguration(
                "contention thresholds cannot be changed on a running cache".into(),
            ));
        }

        Ok(())
    }
}

/// Builder for CacheOptions.
#[derive(Debug, Clone, Default)]
pub struct CacheOptionsBuilder {
    options: CacheOptions,
}

impl CacheOptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set descriptor_cache_size.
    pub fn descriptor_cache_size(mut self, size: usize) -> Self {
        self.options.descriptor_cache_size = size;
        self
    }

    /// Set handle_cache_size.
    pub fn handle_cache_size(mut self, size: usize) -> Self {
        self.options.handle_cache_size = size;
        self
    }

    /// Set max_instances.
    pub fn max_instances(mut self, instances: usize) -> Self {
        self.options.max_instances = instances;
        self
    }

    /// Set both contention constants.
    pub fn contention(mut self, stall_threshold: u32, sample_window: u32) -> Self {
        self.options.contention_stall_threshold = stall_threshold;
        self.options.contention_sample_window = sample_window;
        self
    }

    /// Build the options.
    pub fn build(self) -> crate::Result<CacheOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}
