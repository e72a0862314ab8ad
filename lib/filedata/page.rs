//! A file data page.

use std::collections::BTreeMap;

use crate::filedata::alloc::PageBuf;

/// A fixed-size byte region of a file's logical address space.
///
/// Every page except the last holds exactly the file's page size; the
/// last may be shorter. `dirty` means the buffered bytes differ from the
/// server copy.
pub struct Page {
    buf: PageBuf,
    /// True when the page holds unflushed writes.
    pub dirty: bool,
}

impl Page {
    /// Wrap an allocated buffer as a clean page.
    #[must_use]
    pub fn new(buf: PageBuf) -> Self {
        Self { buf, dirty: false }
    }

    /// Current logical size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// The page contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Mutable page contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }

    /// Grow or shrink the page, zero-filling growth.
    pub fn resize(&mut self, size: usize) {
        self.buf.resize(size);
    }
}

/// Index-ordered map of cached pages; ordered iteration drives flush
/// scans over consecutive dirty runs.
pub type PageMap = BTreeMap<u64, Page>;

/// The `usize` minimum of a `u64` and a `usize`.
#[must_use]
pub fn min64(a: u64, b: usize) -> usize {
    usize::try_from(a.min(b as u64)).unwrap_or(b)
}
