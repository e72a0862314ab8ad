//! File operations: read, write, truncate, flush.
//!
//! Thin policy layer over the page manager: write-mode enforcement for
//! append-only and whole-file storages, read-only enforcement, and the
//! append-alignment write-through. All data movement lives in
//! [`crate::filedata`].

use std::sync::Arc;
use std::time::SystemTime;

use nimbus_api::FileRecord;
use tracing::warn;

use crate::config::CacheMode;
use crate::error::FsError;
use crate::filedata::page_backend::PageBackend;
use crate::filedata::page_manager::PageManager;
use crate::fsconfig::{FsConfig, WriteMode};
use crate::item::{time_from_epoch, FileData, Item, ItemKind, ItemMeta};
use crate::Mount;
use tokio::sync::RwLock;

impl Item {
    /// Build a file item from a server record.
    #[must_use]
    pub fn file_from_record(
        mount: &Arc<Mount>,
        parent: &Arc<Item>,
        parent_id: &str,
        record: &FileRecord,
        config: Arc<FsConfig>,
    ) -> Arc<Item> {
        let backend = PageBackend::for_existing(
            Arc::clone(&mount.api),
            mount.options.page_size,
            config.write_mode,
            Arc::clone(&mount.chunker),
            record.id.clone(),
            parent_id.to_owned(),
            record.name.clone(),
            record.size,
        );
        Self::file_with_backend(mount, parent, record, config, backend, record.size)
    }

    /// Build a file that exists in memory only; the server learns about
    /// it on the first flush.
    #[must_use]
    pub fn file_pending(
        mount: &Arc<Mount>,
        parent: &Arc<Item>,
        parent_id: &str,
        name: &str,
        config: Arc<FsConfig>,
    ) -> Arc<Item> {
        let backend = PageBackend::for_pending(
            Arc::clone(&mount.api),
            mount.options.page_size,
            config.write_mode,
            Arc::clone(&mount.chunker),
            parent_id.to_owned(),
            name.to_owned(),
        );

        let now = SystemTime::now();
        Arc::new(Item {
            mount: Arc::clone(mount),
            kind: ItemKind::File(FileData {
                pages: Self::new_pages(mount, backend, 0),
                config,
            }),
            meta: RwLock::new(ItemMeta {
                id: String::new(),
                name: name.to_owned(),
                filesystem: String::new(),
                created: now,
                modified: Some(now),
                accessed: None,
                read_only: false,
                deleted: false,
                parent: Arc::downgrade(parent),
            }),
        })
    }

    fn file_with_backend(
        mount: &Arc<Mount>,
        parent: &Arc<Item>,
        record: &FileRecord,
        config: Arc<FsConfig>,
        backend: PageBackend,
        size: u64,
    ) -> Arc<Item> {
        Arc::new(Item {
            mount: Arc::clone(mount),
            kind: ItemKind::File(FileData {
                pages: Self::new_pages(mount, backend, size),
                config,
            }),
            meta: RwLock::new(ItemMeta {
                id: record.id.clone(),
                name: record.name.clone(),
                filesystem: record.filesystem.clone(),
                created: time_from_epoch(record.dates.created),
                modified: record.dates.modified.map(time_from_epoch),
                accessed: record.dates.accessed.map(time_from_epoch),
                read_only: false,
                deleted: false,
                parent: Arc::downgrade(parent),
            }),
        })
    }

    fn new_pages(mount: &Arc<Mount>, backend: PageBackend, size: u64) -> Arc<PageManager> {
        let max_fetch = mount.cache.memory_limit() / u64::from(mount.options.read_max_cache_frac);
        PageManager::new(
            Arc::clone(&mount.cache),
            backend,
            size,
            mount.options.page_size,
            mount.options.read_ahead_time,
            usize::try_from(max_fetch).unwrap_or(usize::MAX),
            mount.options.cache_mode == CacheMode::Memory,
        )
    }

    /// Re-apply a server record to this file (a polled listing changed).
    pub async fn refresh_file(self: &Arc<Self>, record: &FileRecord) -> Result<(), FsError> {
        let data = self.as_file()?;

        {
            let mut meta = self.meta.write().await;
            meta.id = record.id.clone();
            meta.filesystem = record.filesystem.clone();
            meta.created = time_from_epoch(record.dates.created);
            meta.modified = record.dates.modified.map(time_from_epoch);
            meta.accessed = record.dates.accessed.map(time_from_epoch);
        }

        data.pages.remote_changed(record.size).await;
        Ok(())
    }

    /// Total file size, the larger of the server-known size and the
    /// highest offset reached by dirty writes.
    pub fn file_size(&self) -> Result<u64, FsError> {
        Ok(self.as_file()?.pages.file_size())
    }

    /// Read up to `len` bytes at `offset`; short only at end of file.
    pub async fn read_bytes(self: &Arc<Self>, offset: u64, len: usize) -> Result<Vec<u8>, FsError> {
        let data = self.as_file()?;
        data.pages.read_bytes(offset, len).await
    }

    /// Write `buf` at `offset`, enforcing the storage's write mode.
    pub async fn write_bytes(self: &Arc<Self>, offset: u64, buf: &[u8]) -> Result<(), FsError> {
        let data = self.as_file()?;
        if self.effective_read_only().await {
            return Err(FsError::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(());
        }

        // Memory mode never uploads, so any write pattern is fine.
        if self.mount.options.cache_mode == CacheMode::Memory {
            return data.pages.write_bytes(offset, buf).await;
        }

        match data.config.write_mode {
            WriteMode::Random => data.pages.write_bytes(offset, buf).await,
            WriteMode::Upload => {
                if data.pages.backend().exists_on_backend() {
                    // Whole-file storage: the object cannot be modified
                    // in place once uploaded.
                    return Err(FsError::WriteType);
                }
                data.pages.write_bytes(offset, buf).await
            }
            WriteMode::Append => {
                let size = data.pages.file_size();
                if offset != size {
                    return Err(FsError::WriteType);
                }

                // A flushed partial tail page cannot be rewritten on an
                // append-only store, so consume up to the next page
                // boundary with a direct write first.
                let mut consumed = 0;
                let backend = data.pages.backend();
                if backend.exists_on_backend()
                    && offset == backend.backend_size()
                    && offset % data.pages.page_size() as u64 != 0
                {
                    consumed = data.pages.write_through_tail(offset, buf).await?;
                }

                if consumed < buf.len() {
                    data.pages
                        .write_bytes(offset + consumed as u64, &buf[consumed..])
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Set the file size.
    pub async fn truncate_file(self: &Arc<Self>, new_size: u64) -> Result<(), FsError> {
        let data = self.as_file()?;
        if self.effective_read_only().await {
            return Err(FsError::ReadOnly);
        }
        if new_size == data.pages.file_size() {
            return Ok(());
        }

        if self.mount.options.cache_mode != CacheMode::Memory {
            match data.config.write_mode {
                WriteMode::Random => {}
                WriteMode::Upload => return Err(FsError::WriteType),
                WriteMode::Append if new_size != 0 => return Err(FsError::WriteType),
                WriteMode::Append => {}
            }
        }

        data.pages.truncate(new_size).await
    }

    /// Write back all dirty pages, creating the file on the server if it
    /// does not exist yet. With `nothrow`, failures are logged and
    /// swallowed so teardown can complete.
    pub async fn flush_file(self: &Arc<Self>, nothrow: bool) -> Result<(), FsError> {
        let data = self.as_file()?;
        if self.mount.options.cache_mode == CacheMode::Memory {
            return Ok(());
        }

        match data.pages.flush().await {
            Ok(()) => Ok(()),
            Err(e) if nothrow => {
                warn!(error = %e, "flush during teardown failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
