//! Caching allocator (`core/CachingMemoryAllocator.{h,cc}`, spec §4.6.4):
//! preallocates `num_buffers = cached_memory / buffer_size` fixed-size
//! regions up front and lends them out non-blockingly from a thread-safe
//! free list, so a stage configured with one never touches the central
//! [`crate::allocator::memory_allocator::MemoryAllocator`] on its hot
//! path — the whole byte budget is paid once, at construction.

use std::sync::Mutex;

use crate::allocator::deadlock::MemoryRegion;

/// One fixed-size region on loan from a [`CachingAllocator`]. Returned to
/// the free list on drop, rather than requiring an explicit `put` call —
/// unlike the central allocator (whose `MemoryRegion` can escape to a
/// disk-backed resolver and so is handed back explicitly), every buffer a
/// caching allocator lends has exactly one legitimate fate: go back to
/// its own free list.
pub struct CachedBuffer<'a> {
    region: Option<MemoryRegion>,
    owner: &'a CachingAllocator,
}

impl<'a> CachedBuffer<'a> {
    /// The configured buffer size.
    pub fn size(&self) -> u64 {
        self.owner.buffer_size
    }
}

impl std::ops::Deref for CachedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.region.as_deref().expect("region present until drop")
    }
}

impl std::ops::DerefMut for CachedBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.region.as_deref_mut().expect("region present until drop")
    }
}

impl Drop for CachedBuffer<'_> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.owner.free.lock().unwrap().push(region);
        }
    }
}

/// A per-(phase, stage) pool of `num_buffers = cached_memory_bytes /
/// (num_workers * buffer_size_bytes)`-ish fixed-size regions (spec
/// §4.6.4 leaves the exact division to the caller; see
/// [`Self::new`]'s `num_buffers` parameter), handed out non-blockingly.
/// `try_get` returning `None` means the pool is momentarily exhausted —
/// the caller is expected to fall back to the central allocator or simply
/// wait for a buffer to be returned, per the stage's own design; the
/// caching allocator itself never blocks.
pub struct CachingAllocator {
    buffer_size: u64,
    total_buffers: usize,
    free: Mutex<Vec<MemoryRegion>>,
}

impl CachingAllocator {
    /// Preallocate `num_buffers` regions of `buffer_size_bytes` each. The
    /// whole `num_buffers * buffer_size_bytes` budget is paid for up
    /// front as real heap allocations.
    pub fn new(num_buffers: usize, buffer_size_bytes: u64) -> Self {
        let mut free = Vec::with_capacity(num_buffers);
        for id in 0..num_buffers as u64 {
            free.push(MemoryRegion::heap(id, buffer_size_bytes));
        }
        Self {
            buffer_size: buffer_size_bytes,
            total_buffers: num_buffers,
            free: Mutex::new(free),
        }
    }

    /// Configured per-buffer size.
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Total number of buffers this pool was constructed with.
    pub fn capacity(&self) -> usize {
        self.total_buffers
    }

    /// Number of buffers currently sitting in the free list (i.e. not on
    /// loan).
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Borrow a buffer, if one is free. Never blocks.
    pub fn try_get(&self) -> Option<CachedBuffer<'_>> {
        let region = self.free.lock().unwrap().pop()?;
        Some(CachedBuffer {
            region: Some(region),
            owner: self,
        })
    }
}

#[cfg(test)]
#[path = "caching_allocator.test.rs"]
mod tests;
