//! Per-file translation between page ranges and server calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use nimbus_api::ObjectApi;
use tracing::{debug, info};

use crate::error::FsError;
use crate::fsconfig::WriteMode;

/// Smallest upload chunk the sizer will fall back to.
const CHUNK_FLOOR: u64 = 4096;

/// Adaptive upload chunk sizing, shared across all page backends.
///
/// Starts from the server-advertised maximum (0 = unconstrained). When a
/// write comes back with a size-limit failure the chunk size halves,
/// flooring at 4 KiB, and the write retries — the only adaptive HTTP
/// behavior in the client.
pub struct ChunkSizer {
    max_bytes: AtomicU64,
}

impl ChunkSizer {
    /// Create a sizer from the advertised limit.
    #[must_use]
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            max_bytes: AtomicU64::new(limit.unwrap_or(0)),
        }
    }

    /// Largest chunk to attempt for a payload of `remaining` bytes.
    #[must_use]
    pub fn chunk_len(&self, remaining: usize) -> usize {
        let max = self.max_bytes.load(Ordering::Relaxed);
        if max == 0 {
            remaining
        } else {
            remaining.min(usize::try_from(max).unwrap_or(remaining))
        }
    }

    /// Shrink the chunk size below a payload that was just rejected.
    ///
    /// Returns false when already at the floor, in which case the caller
    /// must surface the failure.
    pub fn shrink_below(&self, attempted: u64) -> bool {
        let current = self.max_bytes.load(Ordering::Relaxed);
        let base = if current == 0 || current > attempted {
            attempted
        } else {
            current
        };
        if base <= CHUNK_FLOOR {
            return false;
        }
        let halved = (base / 2).max(CHUNK_FLOOR);
        info!(from = base, to = halved, "shrinking upload chunk size");
        self.max_bytes.store(halved, Ordering::Relaxed);
        true
    }

    /// The current limit, 0 = unconstrained. Test hook.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.max_bytes.load(Ordering::Relaxed)
    }
}

/// Where the file lives (or will live) on the server.
#[derive(Debug, Clone)]
struct Target {
    /// Server id; empty until created.
    file_id: String,
    /// Parent folder id for the deferred create.
    parent_id: String,
    /// Name for the deferred create.
    name: String,
    /// Whether the server knows this file yet.
    exists: bool,
    /// The server-side size.
    size: u64,
}

/// Translates page-index ranges into ranged downloads and consecutive
/// page uploads for one file, tracking whether the file exists on the
/// server yet and performing the deferred create on first flush.
///
/// Never mutates page-manager state; the page manager is the sole caller
/// and holds its own locks across these calls.
pub struct PageBackend {
    api: Arc<dyn ObjectApi>,
    page_size: usize,
    write_mode: WriteMode,
    chunker: Arc<ChunkSizer>,
    target: Mutex<Target>,
}

impl PageBackend {
    /// Backend for a file the server already knows.
    #[must_use]
    pub fn for_existing(
        api: Arc<dyn ObjectApi>,
        page_size: usize,
        write_mode: WriteMode,
        chunker: Arc<ChunkSizer>,
        file_id: String,
        parent_id: String,
        name: String,
        size: u64,
    ) -> Self {
        Self {
            api,
            page_size,
            write_mode,
            chunker,
            target: Mutex::new(Target {
                file_id,
                parent_id,
                name,
                exists: true,
                size,
            }),
        }
    }

    /// Backend for a freshly created file that exists in memory only;
    /// the server learns about it on the first flush.
    #[must_use]
    pub fn for_pending(
        api: Arc<dyn ObjectApi>,
        page_size: usize,
        write_mode: WriteMode,
        chunker: Arc<ChunkSizer>,
        parent_id: String,
        name: String,
    ) -> Self {
        Self {
            api,
            page_size,
            write_mode,
            chunker,
            target: Mutex::new(Target {
                file_id: String::new(),
                parent_id,
                name,
                exists: false,
                size: 0,
            }),
        }
    }

    /// Whether the server knows this file.
    #[must_use]
    pub fn exists_on_backend(&self) -> bool {
        self.target.lock().expect("target lock").exists
    }

    /// The size the server knows (dirty writes may exceed it).
    #[must_use]
    pub fn backend_size(&self) -> u64 {
        self.target.lock().expect("target lock").size
    }

    /// The server id, empty until created.
    #[must_use]
    pub fn file_id(&self) -> String {
        self.target.lock().expect("target lock").file_id.clone()
    }

    /// Record a rename observed or performed at the item layer.
    pub fn set_name(&self, name: &str) {
        self.target.lock().expect("target lock").name = name.to_owned();
    }

    /// Record a move observed or performed at the item layer.
    pub fn set_parent(&self, parent_id: &str) {
        self.target.lock().expect("target lock").parent_id = parent_id.to_owned();
    }

    /// Record a size change observed on the server.
    pub fn set_backend_size(&self, size: u64) {
        self.target.lock().expect("target lock").size = size;
    }

    /// Download the byte range covering `count` pages starting at
    /// `start`, returning `(index, bytes)` slices in order. Yields
    /// nothing when the file is unknown on the server or the range is
    /// wholly past its end.
    pub async fn read_pages(
        &self,
        start: u64,
        count: usize,
    ) -> Result<Vec<(u64, Bytes)>, FsError> {
        let target = self.target.lock().expect("target lock").clone();
        if !target.exists {
            return Ok(Vec::new());
        }

        let page_size = self.page_size as u64;
        let first_byte = start * page_size;
        let last_byte = target.size.min(first_byte + count as u64 * page_size);
        if first_byte >= last_byte {
            return Ok(Vec::new());
        }

        debug!(
            file = %target.file_id,
            start,
            count,
            bytes = last_byte - first_byte,
            "ranged download"
        );

        let body = self
            .api
            .download(&target.file_id, first_byte, last_byte - 1)
            .await?;

        let mut out = Vec::with_capacity(count);
        let mut offset = 0usize;
        let mut index = start;
        while offset < body.len() {
            let len = self.page_size.min(body.len() - offset);
            out.push((index, body.slice(offset..offset + len)));
            offset += len;
            index += 1;
        }
        Ok(out)
    }

    /// Upload a contiguous run of pages starting at `start_index` and
    /// return the new backend size.
    ///
    /// Performs the deferred create when the file does not exist yet: an
    /// empty payload at index 0 creates via `createfile`; a non-empty
    /// payload at index 0 goes out through `upload`, which accepts the
    /// body inline. Runs beginning past index 0 create an empty file
    /// first and then write at the offset.
    pub async fn write_pages(&self, start_index: u64, data: Bytes) -> Result<u64, FsError> {
        let target = self.target.lock().expect("target lock").clone();
        let start_byte = start_index * self.page_size as u64;

        if !target.exists {
            if start_index == 0 {
                self.create_or_upload(&target, data).await?;
            } else {
                let record = self.api.create_file(&target.parent_id, &target.name).await?;
                {
                    let mut t = self.target.lock().expect("target lock");
                    t.file_id = record.id;
                    t.exists = true;
                    t.size = 0;
                }
                let file_id = self.file_id();
                self.write_chunked(&file_id, start_byte, data).await?;
            }
        } else if self.write_mode == WriteMode::Upload {
            // Whole-file replacement; the page manager only hands us runs
            // from index 0 for upload-mode storage.
            self.create_or_upload(&target, data).await?;
        } else {
            self.write_chunked(&target.file_id, start_byte, data).await?;
        }

        Ok(self.backend_size())
    }

    /// Write bytes straight to the backend at a byte offset, bypassing
    /// any page bookkeeping. Used for append-alignment writes; the file
    /// must already exist.
    pub async fn write_raw(&self, offset: u64, data: Bytes) -> Result<u64, FsError> {
        let file_id = self.file_id();
        debug_assert!(!file_id.is_empty(), "raw write before create");
        self.write_chunked(&file_id, offset, data).await?;
        Ok(self.backend_size())
    }

    /// Set the server-side size. The caller only invokes this when the
    /// file exists on the backend; otherwise the truncate is deferred to
    /// the flush that creates it.
    pub async fn truncate(&self, new_size: u64) -> Result<(), FsError> {
        let target = self.target.lock().expect("target lock").clone();
        debug_assert!(target.exists, "truncate before create");

        self.api.truncate_file(&target.file_id, new_size).await?;
        self.target.lock().expect("target lock").size = new_size;
        Ok(())
    }

    async fn create_or_upload(&self, target: &Target, data: Bytes) -> Result<(), FsError> {
        if data.is_empty() {
            let record = self.api.create_file(&target.parent_id, &target.name).await?;
            let mut t = self.target.lock().expect("target lock");
            t.file_id = record.id;
            t.exists = true;
            t.size = 0;
            return Ok(());
        }

        // The first chunk rides on the upload call itself; anything the
        // chunk limit cut off follows through writefile.
        let mut first_len = self.chunker.chunk_len(data.len());
        let record = loop {
            match self
                .api
                .upload(
                    &target.parent_id,
                    &target.name,
                    data.slice(0..first_len),
                    true,
                )
                .await
            {
                Ok(record) => break record,
                Err(e) if e.is_size_limit() && self.chunker.shrink_below(first_len as u64) => {
                    first_len = self.chunker.chunk_len(data.len());
                }
                Err(e) => return Err(e.into()),
            }
        };

        {
            let mut t = self.target.lock().expect("target lock");
            t.file_id = record.id;
            t.exists = true;
            t.size = first_len as u64;
        }

        if first_len < data.len() {
            let file_id = self.file_id();
            self.write_chunked(&file_id, first_len as u64, data.slice(first_len..))
                .await?;
        }
        Ok(())
    }

    async fn write_chunked(
        &self,
        file_id: &str,
        start_byte: u64,
        data: Bytes,
    ) -> Result<(), FsError> {
        let mut pos = 0usize;
        while pos < data.len() {
            let len = self.chunker.chunk_len(data.len() - pos);
            match self
                .api
                .write_file(file_id, start_byte + pos as u64, data.slice(pos..pos + len))
                .await
            {
                Ok(_) => pos += len,
                Err(e) if e.is_size_limit() && self.chunker.shrink_below(len as u64) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut t = self.target.lock().expect("target lock");
        t.size = t.size.max(start_byte + data.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizer_halves_to_floor() {
        let sizer = ChunkSizer::new(None);
        assert_eq!(sizer.chunk_len(1 << 24), 1 << 24);

        assert!(sizer.shrink_below(1 << 24));
        assert_eq!(sizer.chunk_len(1 << 24), 1 << 23);

        while sizer.shrink_below(sizer.current()) {}
        assert_eq!(sizer.current(), CHUNK_FLOOR);
        assert!(!sizer.shrink_below(CHUNK_FLOOR));
    }

    #[test]
    fn advertised_limit_bounds_chunks() {
        let sizer = ChunkSizer::new(Some(8192));
        assert_eq!(sizer.chunk_len(100_000), 8192);
        assert_eq!(sizer.chunk_len(100), 100);
    }
}
