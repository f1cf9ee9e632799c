//! Deadlock resolution: a pluggable collaborator that can satisfy any
//! allocation request by producing a virtual region backed by disk (spec
//! §4.4.4). Preserved from the original's `MemoryMappedFileDeadlockResolver`
//! and `AbortingDeadlockResolver`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, ThemisError};
use crate::util::monotonic_tag;

/// Backing storage for an allocated region: either plain heap memory or a
/// memory-mapped, disk-backed region produced by the deadlock resolver.
enum RegionBacking {
    Heap(Vec<u8>),
    Disk {
        mmap: memmap2::MmapMut,
        #[allow(dead_code)] // keeps the fd's lifetime tied to the mapping for clarity
        file: File,
    },
}

/// An allocated region of memory, returned by
/// [`crate::allocator::memory_allocator::MemoryAllocator::allocate`].
///
/// Plays the role of the original's `void*` plus its allocation metadata:
/// Rust ownership replaces "give the pointer back to `deallocate`" with
/// "give the `MemoryRegion` back by value" (see `DESIGN.md`).
pub struct MemoryRegion {
    pub(crate) id: u64,
    pub(crate) size: u64,
    pub(crate) resolved_on_deadlock: bool,
    backing: RegionBacking,
}

impl MemoryRegion {
    pub(crate) fn heap(id: u64, size: u64) -> Self {
        Self {
            id,
            size,
            resolved_on_deadlock: false,
            backing: RegionBacking::Heap(vec![0u8; size as usize]),
        }
    }

    /// Build a heap-backed region from an already-allocated buffer (used
    /// by the allocator's fallible `try_reserve_exact` path).
    pub(crate) fn heap_from_bytes(id: u64, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            id,
            size,
            resolved_on_deadlock: false,
            backing: RegionBacking::Heap(bytes),
        }
    }

    pub(crate) fn disk(id: u64, size: u64, mmap: memmap2::MmapMut, file: File) -> Self {
        Self {
            id,
            size,
            resolved_on_deadlock: true,
            backing: RegionBacking::Disk { mmap, file },
        }
    }

    /// Opaque allocation id, stable for the lifetime of this region.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// `true` if this region's backing storage came from the deadlock
    /// resolver rather than the heap.
    pub fn resolved_on_deadlock(&self) -> bool {
        self.resolved_on_deadlock
    }

    /// For disk-backed regions, `msync` the mapping so a concurrent
    /// reader of the underlying file observes writes made through this
    /// region. A no-op for heap-backed regions. Best-effort: I/O failures
    /// here are logged rather than propagated, matching that flushing is
    /// an optimization, not a correctness requirement (the mapping is
    /// `MAP_SHARED`, so the page cache — and therefore any `read()` of the
    /// file on the same host — already sees the writes).
    pub fn flush_best_effort(&self) {
        if let RegionBacking::Disk { mmap, .. } = &self.backing {
            if let Err(err) = mmap.flush() {
                tracing::warn!(id = self.id, %err, "msync of deadlock-resolved region failed");
            }
        }
    }
}

impl Deref for MemoryRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.backing {
            RegionBacking::Heap(v) => v.as_slice(),
            RegionBacking::Disk { mmap, .. } => &mmap[..],
        }
    }
}

impl DerefMut for MemoryRegion {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            RegionBacking::Heap(v) => v.as_mut_slice(),
            RegionBacking::Disk { mmap, .. } => &mut mmap[..],
        }
    }
}

/// A collaborator that can satisfy an allocation request outside the
/// normal byte budget, as a deadlock-escape mechanism of last resort.
pub trait DeadlockResolver: Send + Sync {
    /// Produce a region of exactly `size` bytes for allocation `id`.
    fn resolve(&self, id: u64, size: u64) -> Result<MemoryRegion>;

    /// Release a region previously produced by `resolve`.
    fn release(&self, region: MemoryRegion) -> Result<()>;
}

/// Installed before a real resolver has been spawned. Resolving against it
/// is fatal: "a deadlock before the resolver has been spawned is detected
/// by the checker but not resolved; the process is expected to exit"
/// (spec §4.7).
pub struct AbortingDeadlockResolver;

impl DeadlockResolver for AbortingDeadlockResolver {
    fn resolve(&self, id: u64, size: u64) -> Result<MemoryRegion> {
        tracing::error!(
            id,
            size,
            "deadlock detected with no deadlock resolver spawned"
        );
        ThemisError::ResolverIo(std::io::Error::new(
            std::io::ErrorKind::Other,
            "deadlock resolution requested before a resolver was spawned",
        ))
        .abort()
    }

    fn release(&self, _region: MemoryRegion) -> Result<()> {
        unreachable!("AbortingDeadlockResolver never successfully resolves a region")
    }
}

struct DiskState {
    dir: PathBuf,
    mmap_dir: PathBuf,
    bytes_mapped: u64,
}

struct MappedFile {
    disk_index: usize,
    path: PathBuf,
    size: u64,
}

/// Maintains a set of directories (one per physical disk), each ordered
/// by bytes currently mapped, and serves allocation requests by
/// preallocating and mapping a fresh file in the least-loaded one (spec
/// §4.4.4).
pub struct DiskBackedResolver {
    disks: Mutex<Vec<DiskState>>,
    mapped: Mutex<HashMap<u64, MappedFile>>,
}

impl DiskBackedResolver {
    /// Create a resolver over `directories`. A `mmap/` subdirectory is
    /// created under each one immediately.
    pub fn new(directories: impl IntoIterator<Item = PathBuf>) -> Result<Self> {
        let mut disks = Vec::new();
        for dir in directories {
            let mmap_dir = dir.join("mmap");
            std::fs::create_dir_all(&mmap_dir)?;
            disks.push(DiskState {
                dir,
                mmap_dir,
                bytes_mapped: 0,
            });
        }
        assert!(!disks.is_empty(), "disk-backed resolver needs >= 1 disk");
        Ok(Self {
            disks: Mutex::new(disks),
            mapped: Mutex::new(HashMap::new()),
        })
    }

    fn least_loaded_disk(disks: &[DiskState]) -> usize {
        disks
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| d.bytes_mapped)
            .map(|(i, _)| i)
            .expect("non-empty by construction")
    }
}

impl DeadlockResolver for DiskBackedResolver {
    fn resolve(&self, id: u64, size: u64) -> Result<MemoryRegion> {
        let mut disks = self.disks.lock().unwrap();
        let disk_index = Self::least_loaded_disk(&disks);
        let path = disks[disk_index]
            .mmap_dir
            .join(format!("{:020}.themis_region", monotonic_tag()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(size)?;
        let mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };

        disks[disk_index].bytes_mapped += size;
        drop(disks);

        self.mapped.lock().unwrap().insert(
            id,
            MappedFile {
                disk_index,
                path: path.clone(),
                size,
            },
        );

        tracing::info!(id, size, path = %path.display(), "deadlock-resolved region mapped");
        Ok(MemoryRegion::disk(id, size, mmap, file))
    }

    fn release(&self, region: MemoryRegion) -> Result<()> {
        let id = region.id;
        let entry = self
            .mapped
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(ThemisError::UnknownAllocation { id })?;

        // Dropping `region` here unmaps the file; only then is it safe to
        // unlink it.
        drop(region);
        std::fs::remove_file(&entry.path)?;

        let mut disks = self.disks.lock().unwrap();
        disks[entry.disk_index].bytes_mapped = disks[entry.disk_index]
            .bytes_mapped
            .saturating_sub(entry.size);

        tracing::info!(id, path = %entry.path.display(), "deadlock-resolved region released");
        Ok(())
    }
}

impl Drop for DiskBackedResolver {
    fn drop(&mut self) {
        let mapped = self.mapped.get_mut().unwrap();
        for (_, entry) in mapped.drain() {
            let _ = std::fs::remove_file(&entry.path);
        }
        for disk in self.disks.get_mut().unwrap() {
            let _ = std::fs::remove_dir(&disk.mmap_dir);
            let _ = &disk.dir; // directory itself is the caller's to manage
        }
    }
}

#[cfg(test)]
#[path = "deadlock.test.rs"]
mod tests;
