//! Device memory management.
//!
//! Every [`CompNode`] owns a byte arena of fixed capacity. Raw allocation is
//! first-fit over that arena, so long-running workloads fragment it. Released
//! blobs are kept on a per-device free-list and handed out again to requests
//! they can satisfy (smallest sufficient region first); only when neither the
//! free-list nor the arena can serve a request is the device defragmented:
//! cached regions are returned to the arena and live regions are compacted
//! towards offset zero, after which the request is retried exactly once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::{CompNode, Error, Result, TensorLayout};

/// Default arena size of a device, 256 MiB.
pub const DEFAULT_DEVICE_CAPACITY: usize = 256 * 1024 * 1024;
/// Every region is a multiple of this many bytes.
pub const ALIGNMENT: usize = 64;

static BLOB_ID: AtomicU64 = AtomicU64::new(1);

static BLOB_MANAGER: Lazy<BlobManager> = Lazy::new(BlobManager::new);

/// Tracks pool usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobStats {
    /// Number of times a region was carved out of the raw arena.
    pub raw_allocs: usize,
    /// Number of times a cached region was reused instead of allocated.
    pub free_list_hits: usize,
    /// Number of requests the free-list could not serve.
    pub free_list_misses: usize,
    /// Number of cached regions returned to the arena due to the cache cap.
    pub drops: usize,
    /// Number of defragmentation passes.
    pub defrags: usize,
    /// Bytes held by live blobs.
    pub live_bytes: usize,
    /// Bytes held by cached (free-list) regions.
    pub cached_bytes: usize,
}

#[derive(Debug)]
struct Region {
    len: usize,
    /// Owning blob, `None` while the region sits on the free-list.
    owner: Option<(u64, Arc<AtomicUsize>)>,
}

#[derive(Debug)]
struct DevicePool {
    device: CompNode,
    capacity: usize,
    arena: Vec<u8>,
    /// Every region reserved from the arena, keyed by offset.
    regions: BTreeMap<usize, Region>,
    stats: BlobStats,
}

type SharedPool = Arc<Mutex<DevicePool>>;

fn lock(pool: &SharedPool) -> MutexGuard<'_, DevicePool> {
    // A panicking kernel cannot leave the pool half-updated: all mutations
    // below complete before any call that could panic.
    pool.lock().unwrap_or_else(|e| e.into_inner())
}

fn align_up(bytes: usize) -> usize {
    bytes.max(1).div_ceil(ALIGNMENT) * ALIGNMENT
}

impl DevicePool {
    fn new(device: CompNode, capacity: usize) -> Self {
        Self {
            device,
            capacity,
            arena: Vec::new(),
            regions: BTreeMap::new(),
            stats: BlobStats::default(),
        }
    }

    /// Cached bytes above which the largest cached regions go back to the arena.
    fn trim_threshold(&self) -> usize {
        self.capacity / 2
    }

    /// Find the smallest cached region that fits `len`.
    fn take_cached(&mut self, len: usize, id: u64, cell: &Arc<AtomicUsize>) -> bool {
        let found = self
            .regions
            .iter()
            .filter(|(_, r)| r.owner.is_none() && r.len >= len)
            .min_by_key(|(_, r)| r.len)
            .map(|(off, _)| *off);
        match found.and_then(|offset| self.regions.get_mut(&offset).map(|r| (offset, r))) {
            Some((offset, region)) => {
                region.owner = Some((id, cell.clone()));
                cell.store(offset, Ordering::SeqCst);
                let len = region.len;
                self.stats.free_list_hits += 1;
                self.stats.cached_bytes -= len;
                self.stats.live_bytes += len;
                true
            }
            None => {
                self.stats.free_list_misses += 1;
                false
            }
        }
    }

    /// First-fit search for a gap of `len` bytes in the arena.
    fn carve(&mut self, len: usize, id: u64, cell: &Arc<AtomicUsize>) -> bool {
        let mut cursor = 0;
        let mut found = None;
        for (off, region) in self.regions.iter() {
            if off - cursor >= len {
                found = Some(cursor);
                break;
            }
            cursor = off + region.len;
        }
        if found.is_none() && self.capacity.saturating_sub(cursor) >= len {
            found = Some(cursor);
        }
        let Some(offset) = found else {
            return false;
        };
        if self.arena.len() < offset + len {
            self.arena.resize(offset + len, 0);
        }
        self.regions.insert(
            offset,
            Region {
                len,
                owner: Some((id, cell.clone())),
            },
        );
        cell.store(offset, Ordering::SeqCst);
        self.stats.raw_allocs += 1;
        self.stats.live_bytes += len;
        true
    }

    fn recycle(&mut self, offset: usize, id: u64) {
        let Some(region) = self.regions.get_mut(&offset) else {
            warn!("{}: releasing unknown region at {offset}", self.device);
            return;
        };
        match &region.owner {
            Some((owner, _)) if *owner == id => {}
            _ => {
                warn!("{}: blob {id} does not own region at {offset}", self.device);
                return;
            }
        }
        region.owner = None;
        self.stats.live_bytes -= region.len;
        self.stats.cached_bytes += region.len;
        self.trim_excess();
    }

    /// Remove largest cached regions until cached bytes fall under the threshold.
    fn trim_excess(&mut self) {
        while self.stats.cached_bytes > self.trim_threshold() {
            let largest = self
                .regions
                .iter()
                .filter(|(_, r)| r.owner.is_none())
                .max_by_key(|(_, r)| r.len)
                .map(|(off, r)| (*off, r.len));
            let Some((offset, len)) = largest else {
                break;
            };
            self.regions.remove(&offset);
            self.stats.cached_bytes -= len;
            self.stats.drops += 1;
        }
    }

    /// Return cached regions to the arena and compact live regions.
    fn defragment(&mut self) {
        let cached: Vec<usize> = self
            .regions
            .iter()
            .filter(|(_, r)| r.owner.is_none())
            .map(|(off, _)| *off)
            .collect();
        for off in cached {
            self.regions.remove(&off);
        }
        self.stats.cached_bytes = 0;

        let live = std::mem::take(&mut self.regions);
        let mut cursor = 0;
        for (offset, region) in live {
            if offset != cursor {
                self.arena.copy_within(offset..offset + region.len, cursor);
                if let Some((_, cell)) = &region.owner {
                    cell.store(cursor, Ordering::SeqCst);
                }
            }
            let len = region.len;
            self.regions.insert(cursor, region);
            cursor += len;
        }
        self.arena.truncate(cursor);
        self.stats.defrags += 1;
    }
}

/// An exclusively owned device memory region.
///
/// Dropping a blob (or passing it to [`BlobManager::release`]) returns its
/// region to the device free-list. The region's offset may change while the
/// blob is alive because of defragmentation, so data is always accessed
/// through the blob under the pool lock.
#[derive(Debug)]
pub struct Blob {
    id: u64,
    device: CompNode,
    size: usize,
    offset: Arc<AtomicUsize>,
    pool: SharedPool,
}

impl Blob {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> CompNode {
        self.device
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy the blob's first `len` bytes out of device memory.
    pub fn read(&self, len: usize) -> Vec<u8> {
        let pool = lock(&self.pool);
        let off = self.offset.load(Ordering::SeqCst);
        pool.arena[off..off + len.min(self.size)].to_vec()
    }

    /// Copy `data` into the start of the blob.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.size {
            crate::bail!(
                "write of {} bytes overflows blob {} of {} bytes",
                data.len(),
                self.id,
                self.size
            );
        }
        let mut pool = lock(&self.pool);
        let off = self.offset.load(Ordering::SeqCst);
        pool.arena[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        let offset = self.offset.load(Ordering::SeqCst);
        lock(&self.pool).recycle(offset, self.id);
    }
}

/// Process-wide device memory manager.
pub struct BlobManager {
    pools: Mutex<HashMap<CompNode, SharedPool>>,
}

impl BlobManager {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide instance.
    pub fn inst() -> &'static BlobManager {
        &BLOB_MANAGER
    }

    fn pool(&self, device: CompNode) -> SharedPool {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools
            .entry(device)
            .or_insert_with(|| {
                Arc::new(Mutex::new(DevicePool::new(device, DEFAULT_DEVICE_CAPACITY)))
            })
            .clone()
    }

    /// Set the arena capacity of `device`. Fails if live data would not fit.
    pub fn set_capacity(&self, device: CompNode, bytes: usize) -> Result<()> {
        let pool = self.pool(device);
        let mut pool = lock(&pool);
        let used = pool.stats.live_bytes + pool.stats.cached_bytes;
        if used > bytes {
            return Err(Error::config(format!(
                "{device}: cannot shrink capacity to {bytes} bytes, {used} bytes in use"
            )));
        }
        pool.capacity = bytes;
        if pool.regions.keys().next_back().is_some_and(|off| {
            let len = pool.regions[off].len;
            off + len > bytes
        }) {
            pool.defragment();
        }
        Ok(())
    }

    pub fn capacity(&self, device: CompNode) -> usize {
        lock(&self.pool(device)).capacity
    }

    pub fn stats(&self, device: CompNode) -> BlobStats {
        lock(&self.pool(device)).stats.clone()
    }

    fn try_alloc(&self, pool: &SharedPool, bytes: usize) -> Option<Blob> {
        let len = align_up(bytes);
        let id = BLOB_ID.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(AtomicUsize::new(0));
        let mut guard = lock(pool);
        let ok = guard.take_cached(len, id, &cell) || guard.carve(len, id, &cell);
        let device = guard.device;
        drop(guard);
        ok.then(|| Blob {
            id,
            device,
            size: bytes,
            offset: cell,
            pool: pool.clone(),
        })
    }

    /// Allocate storage for `layout` on `device`, defragmenting once on failure.
    pub fn alloc_workspace(&self, device: CompNode, layout: &TensorLayout) -> Result<Blob> {
        self.alloc_with_defrag(device, layout.span_bytes(), &mut || 0)
    }

    /// Allocate `bytes` on `device`.
    ///
    /// On out-of-memory, `drain` is invoked first so the caller can execute
    /// pending work that frees blobs; then the device is defragmented and the
    /// allocation retried exactly once.
    pub fn alloc_with_defrag(
        &self,
        device: CompNode,
        bytes: usize,
        drain: &mut dyn FnMut() -> usize,
    ) -> Result<Blob> {
        let pool = self.pool(device);
        if let Some(blob) = self.try_alloc(&pool, bytes) {
            return Ok(blob);
        }
        let drained = drain();
        debug!("{device}: allocation of {bytes} bytes failed, drained {drained} commands, defragmenting");
        lock(&pool).defragment();
        if let Some(blob) = self.try_alloc(&pool, bytes) {
            return Ok(blob);
        }
        let guard = lock(&pool);
        warn!("{device}: out of memory for {bytes} bytes after defragmentation");
        Err(Error::OutOfMemory {
            device,
            requested: bytes,
            live: guard.stats.live_bytes,
            capacity: guard.capacity,
        })
    }

    /// Return `blob` to its device free-list.
    pub fn release(&self, blob: Blob) {
        drop(blob)
    }

    /// Compact `device` memory and return cached regions to the arena.
    pub fn defragment(&self, device: CompNode) {
        lock(&self.pool(device)).defragment();
        debug!("{device}: defragmented");
    }
}

impl Default for BlobManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_gaps() {
        let mgr = BlobManager::new();
        let dev = CompNode::cpu(0);
        mgr.set_capacity(dev, 4 * ALIGNMENT).unwrap();
        let a = mgr.alloc_with_defrag(dev, ALIGNMENT, &mut || 0).unwrap();
        let b = mgr.alloc_with_defrag(dev, ALIGNMENT, &mut || 0).unwrap();
        assert_eq!(b.offset.load(Ordering::SeqCst), ALIGNMENT);
        drop(a);
        // The freed region is cached, a same-size request takes it back.
        let c = mgr.alloc_with_defrag(dev, ALIGNMENT, &mut || 0).unwrap();
        assert_eq!(c.offset.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.stats(dev).raw_allocs, 2);
        assert_eq!(mgr.stats(dev).free_list_hits, 1);
    }

    #[test]
    fn defragment_moves_data() {
        let mgr = BlobManager::new();
        let dev = CompNode::cpu(0);
        mgr.set_capacity(dev, 3 * ALIGNMENT).unwrap();
        let a = mgr.alloc_with_defrag(dev, ALIGNMENT, &mut || 0).unwrap();
        let b = mgr.alloc_with_defrag(dev, ALIGNMENT, &mut || 0).unwrap();
        b.write(&[7u8; 8]).unwrap();
        drop(a);
        // 2 * ALIGNMENT contiguous bytes only exist after compaction.
        let c = mgr.alloc_with_defrag(dev, 2 * ALIGNMENT, &mut || 0).unwrap();
        assert_eq!(b.offset.load(Ordering::SeqCst), 0);
        assert_eq!(b.read(8), vec![7u8; 8]);
        assert_eq!(c.offset.load(Ordering::SeqCst), ALIGNMENT);
        assert_eq!(mgr.stats(dev).defrags, 1);
    }
}
