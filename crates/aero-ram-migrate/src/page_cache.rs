//! The XBZRLE page cache: the sender's copy of what it believes the
//! receiver already has for each page, used as the delta-encoding base.

use std::collections::HashMap;

use crate::region::RegionId;
use crate::TARGET_PAGE_SIZE;

#[derive(Clone)]
struct Entry {
    data: Box<[u8; TARGET_PAGE_SIZE as usize]>,
    epoch: u64,
}

/// Bounded by `capacity_pages`; eviction is least-recently-inserted, which
/// matches the original's ring-buffer-of-cache-pages behavior closely
/// enough for this crate's purposes (true LRU is not required by any
/// caller).
pub struct PageCache {
    entries: HashMap<(RegionId, u64), Entry>,
    insertion_order: Vec<(RegionId, u64)>,
    capacity_pages: usize,
    current_epoch: u64,
}

impl PageCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: Vec::new(),
            capacity_pages: (capacity_bytes / TARGET_PAGE_SIZE).max(1) as usize,
            current_epoch: 0,
        }
    }

    pub fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn advance_epoch(&mut self) {
        self.current_epoch += 1;
    }

    /// A hit requires both the key to be present and its stored epoch to
    /// match the current sync-epoch (§4.1): an entry inserted before the
    /// last bitmap sync no longer reflects what the guest currently sees
    /// and must not seed a delta, even though it is still physically in
    /// the map.
    pub fn is_cached(&self, region: &RegionId, offset: u64) -> bool {
        self.entries
            .get(&(region.clone(), offset))
            .is_some_and(|e| e.epoch == self.current_epoch)
    }

    /// Returns the cached snapshot only if it is also a current-epoch hit;
    /// callers that bypass `is_cached` (there should be none) would
    /// otherwise seed a delta from a stale page.
    pub fn get(&self, region: &RegionId, offset: u64) -> Option<&[u8]> {
        self.entries
            .get(&(region.clone(), offset))
            .filter(|e| e.epoch == self.current_epoch)
            .map(|e| e.data.as_slice())
    }

    /// Inserts or overwrites the cached copy of a page, evicting the
    /// oldest entry first if at capacity.
    pub fn insert(&mut self, region: RegionId, offset: u64, data: &[u8]) {
        debug_assert_eq!(data.len(), TARGET_PAGE_SIZE as usize);
        let key = (region, offset);
        if !self.entries.contains_key(&key) {
            if self.entries.len() >= self.capacity_pages {
                if let Some(oldest) = (!self.insertion_order.is_empty())
                    .then(|| self.insertion_order.remove(0))
                {
                    self.entries.remove(&oldest);
                }
            }
            self.insertion_order.push(key.clone());
        }
        let mut buf = Box::new([0u8; TARGET_PAGE_SIZE as usize]);
        buf.copy_from_slice(data);
        self.entries.insert(
            key,
            Entry {
                data: buf,
                epoch: self.current_epoch,
            },
        );
    }

    pub fn epoch_of(&self, region: &RegionId, offset: u64) -> Option<u64> {
        self.entries.get(&(region.clone(), offset)).map(|e| e.epoch)
    }

    /// Resizes the cache. `xbzrle_cache_resize` treats a no-op resize to
    /// the current size specially (it does nothing) but unconditionally
    /// reinitializes -- and therefore clears -- the cache for any
    /// genuinely new size. This is implemented to the letter rather than
    /// just documented.
    pub fn resize(&mut self, new_capacity_bytes: u64) {
        let new_capacity_pages = (new_capacity_bytes / TARGET_PAGE_SIZE).max(1) as usize;
        if new_capacity_pages == self.capacity_pages {
            return;
        }
        self.capacity_pages = new_capacity_pages;
        self.entries.clear();
        self.insertion_order.clear();
    }
}
