//! Recycling allocator for page buffers.
//!
//! Page churn is constant — every eviction frees a buffer and every miss
//! allocates one of the same size — so freed buffers are pooled per byte
//! count and reissued. The pool is bounded so it approximates the churn
//! surface without growing past the cache's own budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

struct PoolState {
    /// Free buffers grouped by capacity.
    classes: HashMap<usize, Vec<Vec<u8>>>,
    /// Total bytes currently pooled.
    pooled: usize,
}

/// A bounded pool of page-sized byte buffers.
pub struct PagePool {
    state: Mutex<PoolState>,
    /// Upper bound on pooled bytes.
    max_pooled: usize,
}

impl PagePool {
    /// Create a pool that retains at most `max_pooled` bytes of freed
    /// buffers.
    #[must_use]
    pub fn new(max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                classes: HashMap::new(),
                pooled: 0,
            }),
            max_pooled,
        })
    }

    /// Hand out a zeroed buffer of exactly `size` bytes, recycled when
    /// possible.
    #[must_use]
    pub fn alloc(self: &Arc<Self>, size: usize) -> PageBuf {
        let recycled = {
            let mut state = self.state.lock().expect("pool lock");
            let buf = state
                .classes
                .get_mut(&size)
                .and_then(Vec::pop);
            if buf.is_some() {
                state.pooled -= size;
            }
            buf
        };

        let mut data = recycled.unwrap_or_else(|| Vec::with_capacity(size));
        data.clear();
        data.resize(size, 0);

        PageBuf {
            data,
            pool: Arc::downgrade(self),
        }
    }

    /// Bytes currently held in the pool. Test hook.
    #[must_use]
    pub fn pooled_bytes(&self) -> usize {
        self.state.lock().expect("pool lock").pooled
    }

    fn give_back(&self, data: Vec<u8>) {
        let size = data.capacity();
        let mut state = self.state.lock().expect("pool lock");
        if state.pooled + size > self.max_pooled {
            return; // at capacity, let it drop
        }
        state.pooled += size;
        state.classes.entry(size).or_default().push(data);
    }
}

/// A buffer leased from a [`PagePool`]; returns to the pool on drop.
pub struct PageBuf {
    data: Vec<u8>,
    pool: Weak<PagePool>,
}

impl PageBuf {
    /// The buffer contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable buffer contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Current logical length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Grow or shrink the logical length, zero-filling growth.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(std::mem::take(&mut self.data));
        }
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_buffers_are_reissued() {
        let pool = PagePool::new(1024 * 1024);
        let buf = pool.alloc(4096);
        drop(buf);
        assert_eq!(pool.pooled_bytes(), 4096);

        let again = pool.alloc(4096);
        assert_eq!(pool.pooled_bytes(), 0);
        assert_eq!(again.len(), 4096);
    }

    #[test]
    fn recycled_buffers_come_back_zeroed() {
        let pool = PagePool::new(1024 * 1024);
        let mut buf = pool.alloc(64);
        buf.as_mut_slice().fill(0xAB);
        drop(buf);

        let again = pool.alloc(64);
        assert!(again.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn pool_is_bounded() {
        let pool = PagePool::new(4096);
        let a = pool.alloc(4096);
        let b = pool.alloc(4096);
        drop(a);
        drop(b); // second buffer exceeds the bound and is dropped
        assert_eq!(pool.pooled_bytes(), 4096);
    }

    #[test]
    fn size_classes_do_not_mix() {
        let pool = PagePool::new(1024 * 1024);
        drop(pool.alloc(4096));
        let small = pool.alloc(512);
        assert_eq!(small.len(), 512);
        assert_eq!(pool.pooled_bytes(), 4096);
    }
}
