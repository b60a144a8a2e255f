//! Client-side cache bookkeeping, server view.
//!
//! Two cache shapes live here:
//!
//! * [`PixmapCache`] — shared among all subclients of one end-user, keyed
//!   by 64-bit image ids, byte-budgeted LRU. The tricky parts are the
//!   coherence guards: a per-subclient `sync` serial on every entry stops
//!   an entry from being evicted under a message that referenced it and is
//!   still in flight, and a `generation` counter stops adds racing a reset.
//! * [`ChannelCache`] — single-channel budgeted LRU used for palettes and
//!   cursor shapes; eviction emits an invalidate-one verb on the owning
//!   pipe.
//!
//! Neither cache stores pixels; the server only mirrors what the client is
//! known to hold.

mod lru;

use ahash::AHashMap;
use parking_lot::Mutex;

use lru::LruList;

/// Upper bound on subclients sharing one pixmap cache.
pub const MAX_CACHE_CLIENTS: usize = 4;

/// Serial vector type: last serial at which each subclient touched a thing.
pub type SyncVec = [u64; MAX_CACHE_CLIENTS];

/// An entry the cache had to push out during an `add`. The owner must emit
/// an invalidate for it, synchronized against every serial in `sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedPixmap {
    pub id: u64,
    pub sync: SyncVec,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PixmapAddOutcome {
    /// Entry inserted; the listed evictions must be invalidated.
    Added { evicted: Vec<EvictedPixmap> },
    /// The client's known generation is stale: it must wait for a pixmap
    /// sync before adding again.
    GenerationMismatch,
    /// Could not free enough budget without evicting an entry some
    /// subclient may still be referencing in flight. The caller sends the
    /// image inline — but evictions that happened before the pinned tail
    /// was reached are already out and must still be invalidated.
    Denied { evicted: Vec<EvictedPixmap> },
}

/// Wait instruction broadcast with a cache reset: every other subclient
/// must have acknowledged the listed serial before the reset is visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitForChannels {
    pub wait_list: Vec<WaitForChannel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForChannel {
    pub channel_id: u32,
    pub message_serial: u64,
}

struct PixmapEntry {
    id: u64,
    size: u64,
    lossy: bool,
    sync: SyncVec,
}

struct PixmapCacheInner {
    budget: u64,
    available: i64,
    generation: u64,
    /// Which subclient initiated the current generation, at which serial.
    generation_initiator: Option<(u32, u64)>,
    /// Last serial each subclient touched the cache at.
    sync: SyncVec,
    map: AHashMap<u64, usize>,
    lru: LruList<PixmapEntry>,
    frozen: bool,
}

/// The shared pixmap cache. One per end-user; subclients are identified by
/// their display-channel id (< [`MAX_CACHE_CLIENTS`]).
pub struct PixmapCache {
    pub id: u64,
    inner: Mutex<PixmapCacheInner>,
}

/// State carried in migration data for one subclient's view of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixmapCacheMigration {
    pub id: u64,
    pub size: u64,
    pub sync: SyncVec,
}

impl PixmapCache {
    pub fn new(id: u64, budget: u64) -> Self {
        Self {
            id,
            inner: Mutex::new(PixmapCacheInner {
                budget,
                available: budget as i64,
                generation: 1,
                generation_initiator: None,
                sync: [0; MAX_CACHE_CLIENTS],
                map: AHashMap::new(),
                lru: LruList::new(),
                frozen: false,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Current generation plus the (channel, serial) that initiated it;
    /// channels catching up wait on that serial before dropping pixmaps.
    pub fn sync_info(&self) -> (u64, Option<(u32, u64)>) {
        let inner = self.inner.lock();
        (inner.generation, inner.generation_initiator)
    }

    /// Look up `id` for `client_id` at message `serial`. A hit bumps the
    /// entry to the LRU front and pins it against eviction under this
    /// serial. Returns the entry's lossy flag.
    pub fn hit(&self, id: u64, client_id: u32, serial: u64) -> Option<bool> {
        let mut inner = self.inner.lock();
        let &slot = inner.map.get(&id)?;
        inner.lru.touch(slot);
        let entry = inner.lru.get_mut(slot);
        entry.sync[client_id as usize] = serial;
        let lossy = entry.lossy;
        inner.sync[client_id as usize] = serial;
        Some(lossy)
    }

    /// Flip an existing entry's lossy flag (after a lossless refresh).
    pub fn set_lossy(&self, id: u64, lossy: bool) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.get(&id) {
            Some(&slot) => {
                inner.lru.get_mut(slot).lossy = lossy;
                true
            }
            None => false,
        }
    }

    /// Try to insert `id`. `client_generation` is the adding subclient's
    /// last-known generation; a mismatch means a reset it has not yet
    /// acknowledged is in flight.
    pub fn add(
        &self,
        id: u64,
        size: u64,
        lossy: bool,
        client_id: u32,
        serial: u64,
        client_generation: u64,
    ) -> PixmapAddOutcome {
        assert!(size > 0);
        let mut inner = self.inner.lock();
        if inner.generation != client_generation {
            return PixmapAddOutcome::GenerationMismatch;
        }
        if inner.frozen {
            return PixmapAddOutcome::Denied { evicted: vec![] };
        }

        inner.available -= size as i64;
        let mut evicted = Vec::new();
        while inner.available < 0 {
            let Some(tail_slot) = inner.lru.tail() else {
                // Nothing left to push out: roll back the reservation.
                inner.available += size as i64;
                return PixmapAddOutcome::Denied { evicted };
            };
            let tail = inner.lru.get_mut(tail_slot);
            if tail.sync[client_id as usize] == serial {
                // The LRU tail was referenced within the current message
                // window; evicting it would race the client's read.
                inner.available += size as i64;
                return PixmapAddOutcome::Denied { evicted };
            }
            let entry = inner.lru.remove(tail_slot);
            inner.map.remove(&entry.id);
            inner.available += entry.size as i64;
            inner.sync[client_id as usize] = serial;
            evicted.push(EvictedPixmap {
                id: entry.id,
                sync: entry.sync,
            });
        }

        let mut sync = [0; MAX_CACHE_CLIENTS];
        sync[client_id as usize] = serial;
        let slot = inner.lru.push_front(PixmapEntry {
            id,
            size,
            lossy,
            sync,
        });
        inner.map.insert(id, slot);
        inner.sync[client_id as usize] = serial;
        PixmapAddOutcome::Added { evicted }
    }

    /// Reset: clear everything, bump the generation, and name every other
    /// subclient's last serial so the resetting channel can emit a wait.
    /// Returns the new generation and the wait list.
    pub fn reset(&self, client_id: u32, serial: u64) -> (u64, WaitForChannels) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.lru.clear();
        inner.available = inner.budget as i64;
        inner.frozen = false;
        inner.generation += 1;
        inner.generation_initiator = Some((client_id, serial));
        inner.sync[client_id as usize] = serial;

        let mut wait = WaitForChannels::default();
        for (i, &s) in inner.sync.iter().enumerate() {
            if s != 0 && i != client_id as usize {
                wait.wait_list.push(WaitForChannel {
                    channel_id: i as u32,
                    message_serial: s,
                });
            }
        }
        tracing::debug!(
            target: "cache.pixmap",
            cache = self.id,
            generation = inner.generation,
            initiator = client_id,
            waits = wait.wait_list.len(),
            "pixmap_cache_reset"
        );
        (inner.generation, wait)
    }

    /// Freeze for migration: suspend adds and hand out the migration view.
    /// Returns `None` when already frozen.
    pub fn freeze(&self) -> Option<PixmapCacheMigration> {
        let mut inner = self.inner.lock();
        if inner.frozen {
            return None;
        }
        inner.frozen = true;
        Some(PixmapCacheMigration {
            id: self.id,
            size: inner.budget,
            sync: inner.sync,
        })
    }

    /// Drop all entries (last subclient disconnected).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.lru.clear();
        inner.available = inner.budget as i64;
        inner.frozen = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a [`ChannelCache`] add.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelAddOutcome {
    /// Inserted; the listed ids must be invalidated on the owning pipe.
    Added { evicted: Vec<u64> },
    /// The single new item exceeds the whole budget.
    Denied,
}

/// Small per-channel LRU (palettes, cursor shapes). Budget units are
/// whatever the caller counts in — entries for palettes, bytes for cursors.
pub struct ChannelCache {
    budget: u64,
    available: i64,
    map: AHashMap<u64, usize>,
    lru: LruList<(u64, u64)>, // (id, size)
}

impl ChannelCache {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            available: budget as i64,
            map: AHashMap::new(),
            lru: LruList::new(),
        }
    }

    /// Touch an entry; true when the client holds it.
    pub fn find(&mut self, id: u64) -> bool {
        match self.map.get(&id) {
            Some(&slot) => {
                self.lru.touch(slot);
                true
            }
            None => false,
        }
    }

    pub fn add(&mut self, id: u64, size: u64) -> ChannelAddOutcome {
        self.available -= size as i64;
        let mut evicted = Vec::new();
        while self.available < 0 {
            let Some(tail_slot) = self.lru.tail() else {
                self.available += size as i64;
                return ChannelAddOutcome::Denied;
            };
            let (old_id, old_size) = self.lru.remove(tail_slot);
            self.map.remove(&old_id);
            self.available += old_size as i64;
            evicted.push(old_id);
        }
        let slot = self.lru.push_front((id, size));
        self.map.insert(id, slot);
        ChannelAddOutcome::Added { evicted }
    }

    pub fn reset(&mut self) {
        self.map.clear();
        self.lru.clear();
        self.available = self.budget as i64;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_touches_and_records_serial() {
        let cache = PixmapCache::new(1, 1000);
        assert_eq!(
            cache.add(10, 400, false, 0, 5, 1),
            PixmapAddOutcome::Added { evicted: vec![] }
        );
        assert_eq!(cache.hit(10, 1, 7), Some(false));
        assert_eq!(cache.hit(99, 1, 8), None);
    }

    #[test]
    fn add_evicts_lru_order() {
        let cache = PixmapCache::new(1, 1000);
        cache.add(1, 400, false, 0, 1, 1);
        cache.add(2, 400, false, 0, 2, 1);
        // Touch 1 so 2 becomes the tail.
        cache.hit(1, 0, 3);
        match cache.add(3, 400, false, 0, 4, 1) {
            PixmapAddOutcome::Added { evicted } => {
                assert_eq!(evicted.len(), 1);
                assert_eq!(evicted[0].id, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_refused_when_tail_pinned_by_current_serial() {
        let cache = PixmapCache::new(1, 1000);
        cache.add(1, 600, false, 0, 5, 1);
        // Same client, same serial: the tail is pinned; add must fail
        // without evicting anything.
        assert_eq!(
            cache.add(2, 600, false, 0, 5, 1),
            PixmapAddOutcome::Denied { evicted: vec![] }
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.hit(1, 0, 6), Some(false));
        // A later serial may evict it.
        match cache.add(2, 600, false, 0, 7, 1) {
            PixmapAddOutcome::Added { evicted } => assert_eq!(evicted[0].id, 1),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn generation_mismatch_blocks_add() {
        let cache = PixmapCache::new(1, 1000);
        assert_eq!(
            cache.add(1, 100, false, 0, 1, 99),
            PixmapAddOutcome::GenerationMismatch
        );
    }

    #[test]
    fn reset_bumps_generation_and_names_other_clients() {
        let cache = PixmapCache::new(1, 1000);
        // Client 0 touches the cache at serial 11.
        cache.add(1, 100, false, 0, 11, 1);
        // Client 1 resets at serial 20.
        let (generation, wait) = cache.reset(1, 20);
        assert_eq!(generation, 2);
        assert_eq!(
            wait.wait_list,
            vec![WaitForChannel {
                channel_id: 0,
                message_serial: 11
            }]
        );
        assert!(cache.is_empty());
        // Client 0 still believes generation 1: its adds bounce.
        assert_eq!(
            cache.add(2, 100, false, 0, 12, 1),
            PixmapAddOutcome::GenerationMismatch
        );
        // After acking the sync (learning generation 2), adds resume.
        assert!(matches!(
            cache.add(2, 100, false, 0, 13, 2),
            PixmapAddOutcome::Added { .. }
        ));
    }

    #[test]
    fn freeze_suspends_adds_and_reports_sync() {
        let cache = PixmapCache::new(9, 512);
        cache.add(1, 100, false, 0, 3, 1);
        let info = cache.freeze().expect("first freeze");
        assert_eq!(info.id, 9);
        assert_eq!(info.size, 512);
        assert_eq!(info.sync[0], 3);
        assert!(cache.freeze().is_none(), "double freeze refused");
        assert_eq!(
            cache.add(2, 50, false, 0, 4, 1),
            PixmapAddOutcome::Denied { evicted: vec![] }
        );
        // Hits still work while frozen.
        assert_eq!(cache.hit(1, 0, 5), Some(false));
    }

    #[test]
    fn lossy_flag_round_trip() {
        let cache = PixmapCache::new(1, 1000);
        cache.add(1, 100, true, 0, 1, 1);
        assert_eq!(cache.hit(1, 0, 2), Some(true));
        assert!(cache.set_lossy(1, false));
        assert_eq!(cache.hit(1, 0, 3), Some(false));
        assert!(!cache.set_lossy(42, false));
    }

    #[test]
    fn channel_cache_palette_budget_by_entries() {
        // Palette cache: 128 entries, unit size each.
        let mut cache = ChannelCache::new(128);
        for id in 0..128 {
            assert!(matches!(
                cache.add(id, 1),
                ChannelAddOutcome::Added { evicted } if evicted.is_empty()
            ));
        }
        assert_eq!(cache.len(), 128);
        match cache.add(1000, 1) {
            ChannelAddOutcome::Added { evicted } => assert_eq!(evicted, vec![0]),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(cache.find(1000));
        assert!(!cache.find(0));
    }

    #[test]
    fn channel_cache_denies_oversized() {
        let mut cache = ChannelCache::new(10);
        assert_eq!(cache.add(1, 11), ChannelAddOutcome::Denied);
        assert!(cache.is_empty());
    }

    #[test]
    fn channel_cache_find_touches() {
        let mut cache = ChannelCache::new(2);
        cache.add(1, 1);
        cache.add(2, 1);
        assert!(cache.find(1)); // 2 becomes tail
        match cache.add(3, 1) {
            ChannelAddOutcome::Added { evicted } => assert_eq!(evicted, vec![2]),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
