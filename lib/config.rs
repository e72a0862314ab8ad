//! Mount-wide configuration.

use std::time::Duration;

/// How aggressively file data is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Refresh on every access; no listing cache.
    None,
    /// Cache locally and never talk to the server for file data —
    /// creates and writes stay in memory and are never uploaded.
    Memory,
    /// Normal write-back caching.
    #[default]
    Normal,
}

/// Options for one mount.
#[derive(Debug, Clone)]
pub struct ConfigOptions {
    /// File data cache behavior.
    pub cache_mode: CacheMode,
    /// Size of file data pages. Fixed per file at open.
    pub page_size: usize,
    /// How long a folder listing stays fresh before a refresh.
    pub refresh_interval: Duration,
    /// Reject all writes regardless of server-side permissions.
    pub read_only: bool,
    /// Pretend `chmod` succeeds instead of returning ENOTSUP.
    pub fake_chmod: bool,
    /// Pretend `chown` succeeds instead of returning ENOTSUP.
    pub fake_chown: bool,
    /// Target wall-clock time for one read-ahead transfer; the bandwidth
    /// meter sizes the read-ahead window to hit this.
    pub read_ahead_time: Duration,
    /// A single read-ahead may use at most `1/read_max_cache_frac` of the
    /// cache memory limit.
    pub read_max_cache_frac: u32,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Normal,
            page_size: 128 * 1024,
            refresh_interval: Duration::from_secs(15),
            read_only: false,
            fake_chmod: false,
            fake_chown: false,
            read_ahead_time: Duration::from_millis(1000),
            read_max_cache_frac: 4,
        }
    }
}

/// Budgets for the process-wide cache manager.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Target upper bound for total page bytes in memory.
    pub memory_limit: u64,
    /// Eviction aims to bring memory below `limit - limit/margin_frac`.
    pub margin_frac: u32,
    /// The dirty-byte budget expressed as transfer time; bandwidth
    /// measurements convert it to bytes on every flush.
    pub max_dirty_time: Duration,
    /// Dirty-byte budget before the first bandwidth measurement lands.
    pub initial_dirty_limit: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            memory_limit: 256 * 1024 * 1024,
            margin_frac: 16,
            max_dirty_time: Duration::from_millis(1000),
            initial_dirty_limit: 4 * 1024 * 1024,
        }
    }
}
