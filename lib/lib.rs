//! nimbus-fs shared library.
//!
//! Mounts a remote nimbus object-storage server through FUSE. The heart
//! of the crate is the file-data caching subsystem in [`filedata`]: a
//! write-back page cache between the kernel bridge and the server API,
//! coordinating reads, writes, evictions, flushes and read-ahead across
//! many open files. The [`item`] tree mirrors the remote folder/file
//! hierarchy and [`fuse`] adapts kernel callbacks onto both.

/// Mount-wide configuration options.
pub mod config;
/// Error type shared across the filesystem layers.
pub mod error;
/// The page cache: page manager, cache manager, page backend.
pub mod filedata;
/// Per-filesystem storage configuration registry.
pub mod fsconfig;
/// FUSE adapter: maps kernel callbacks to item-tree calls.
pub mod fuse;
/// The in-memory folder/file tree.
pub mod item;

use std::sync::Arc;

use nimbus_api::ObjectApi;

use crate::config::ConfigOptions;
use crate::filedata::cache_manager::CacheManager;
use crate::filedata::page_backend::ChunkSizer;
use crate::fsconfig::FsConfigRegistry;

/// Shared state for one mount: the API facade, the mount options, the
/// process-wide cache manager and the storage-config registry.
///
/// The cache manager is deliberately an explicit field rather than a
/// process global; every page manager receives it at construction.
pub struct Mount {
    /// The typed server API.
    pub api: Arc<dyn ObjectApi>,
    /// Options this mount was started with.
    pub options: ConfigOptions,
    /// Process-wide page cache budgets and workers.
    pub cache: Arc<CacheManager>,
    /// Per-filesystem immutable storage configs.
    pub configs: FsConfigRegistry,
    /// Upload chunk sizing shared by all page backends.
    pub chunker: Arc<ChunkSizer>,
}

impl Mount {
    /// Assemble the shared mount state.
    #[must_use]
    pub fn new(
        api: Arc<dyn ObjectApi>,
        options: ConfigOptions,
        cache: Arc<CacheManager>,
        upload_maxbytes: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            options,
            cache,
            configs: FsConfigRegistry::new(),
            chunker: Arc::new(ChunkSizer::new(upload_maxbytes)),
        })
    }
}
