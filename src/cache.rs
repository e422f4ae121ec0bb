//! Bounded cache of received blocks and the request bookkeeping around it.
//!
//! Every block id is in at most one of three places: the request queue of its
//! subdomain (needed but not asked for), the requested set (asked for, not yet
//! arrived) or the cache itself. Ids move queue -> requested -> cache.
//!
//! The ordered entry list sits behind a mutex since lookups from worker threads
//! promote entries. The request bookkeeping is only changed through `&mut self`, so
//! it can only be touched by the thread driving the rounds.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::{
    block::Block,
    tools::dedup_stable,
    transfer::ArrivedBlock,
    types::{BlockId, SubDomainId},
};

/// Result of a cache lookup.
#[derive(Clone, Debug)]
pub enum LoadResult {
    /// The block is resident.
    Found(Arc<Block>),
    /// The block was requested and has not arrived yet.
    NotYetArrived,
    /// The block is queued for the next request round.
    NotRequested,
    /// Nothing was arranged to fetch the block during this timestep.
    AbandonedThisStep,
}

/// What happened to an arrived block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arrival {
    /// The block was inserted into the cache.
    Cached(BlockId),
    /// The cache was full. The block was dropped and its id queued again.
    Dropped(BlockId),
}

struct CacheEntry {
    block_id: BlockId,
    block: Arc<Block>,
}

/// Cache of received blocks, most recently used first.
pub struct BlockCache {
    capacity: usize,
    halo: usize,
    entries: Mutex<VecDeque<CacheEntry>>,
    requested: HashSet<BlockId>,
    queues: Vec<Vec<BlockId>>,
}

impl BlockCache {
    /// Create a cache holding at most `capacity` blocks.
    ///
    /// One request queue is kept for each of the `subdomain_count` subdomains.
    /// Arrived blocks are stored with `halo` guard cells.
    pub fn new(capacity: usize, subdomain_count: usize, halo: usize) -> Self {
        Self {
            capacity,
            halo,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            requested: HashSet::new(),
            queues: vec![Vec::new(); subdomain_count],
        }
    }

    /// Maximum number of resident blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if no block is resident.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of free entries.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// True if the block is resident. Does not change the usage order.
    pub fn is_cached(&self, block_id: BlockId) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|entry| entry.block_id == block_id)
    }

    /// True if the block was requested and has not arrived.
    pub fn is_requested(&self, block_id: BlockId) -> bool {
        self.requested.contains(&block_id)
    }

    /// True if the block waits in a request queue.
    pub fn is_queued(&self, block_id: BlockId) -> bool {
        self.queues.iter().any(|queue| queue.contains(&block_id))
    }

    /// Resident block ids, most recently used first.
    pub fn resident_ids(&self) -> Vec<BlockId> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.block_id)
            .collect()
    }

    /// Number of requested blocks that have not arrived.
    pub fn requested_len(&self) -> usize {
        self.requested.len()
    }

    /// The request queue of a subdomain.
    pub fn queue(&self, subdomain_id: SubDomainId) -> &[BlockId] {
        &self.queues[subdomain_id as usize]
    }

    /// Total number of queued ids over all subdomains.
    pub fn backlog(&self) -> usize {
        self.queues.iter().map(Vec::len).sum()
    }

    /// Look up a block.
    ///
    /// A hit moves the entry to the most recently used position.
    pub fn load(&self, block_id: BlockId) -> LoadResult {
        {
            let mut entries = self.entries.lock();
            if let Some(position) = entries.iter().position(|entry| entry.block_id == block_id) {
                if position > 0 {
                    if let Some(entry) = entries.remove(position) {
                        entries.push_front(entry);
                    }
                }
                return LoadResult::Found(entries[0].block.clone());
            }
        }

        if self.requested.contains(&block_id) {
            LoadResult::NotYetArrived
        } else if self.is_queued(block_id) {
            LoadResult::NotRequested
        } else {
            LoadResult::AbandonedThisStep
        }
    }

    /// Append a block to the request queue of its subdomain.
    ///
    /// Blocks that are resident or already requested are skipped. Duplicates inside a
    /// queue are allowed and removed by [BlockCache::dedup_queues]. Returns true if the
    /// id was appended.
    pub fn enqueue(&mut self, subdomain_id: SubDomainId, block_id: BlockId) -> bool {
        if self.requested.contains(&block_id) || self.is_cached(block_id) {
            return false;
        }
        self.queues[subdomain_id as usize].push(block_id);
        true
    }

    /// Remove repeated ids from all request queues, keeping the first occurrence.
    pub fn dedup_queues(&mut self) {
        for queue in self.queues.iter_mut() {
            *queue = dedup_stable(queue);
        }
    }

    /// Take up to `max` ids from the front of a request queue and mark them requested.
    ///
    /// Returns the ids and whether ids remain queued.
    pub fn take_requests(&mut self, subdomain_id: SubDomainId, max: usize) -> (Vec<BlockId>, bool) {
        let queue = &mut self.queues[subdomain_id as usize];
        let count = max.min(queue.len());
        let taken = queue.drain(..count).collect::<Vec<_>>();
        let remaining = !queue.is_empty();
        self.requested.extend(taken.iter().copied());
        (taken, remaining)
    }

    /// Free entries from the least recently used end so that `target_free` entries are free.
    ///
    /// If the cache would have to free at least as many entries as it holds, it is
    /// emptied. Returns the number of evicted blocks.
    pub fn evict_up_to(&mut self, target_free: usize) -> usize {
        let mut entries = self.entries.lock();
        let free = self.capacity.saturating_sub(entries.len());
        if target_free <= free {
            return 0;
        }

        let needed = target_free - free;
        let evicted = if needed >= entries.len() {
            let count = entries.len();
            entries.clear();
            count
        } else {
            for _ in 0..needed {
                if let Some(entry) = entries.pop_back() {
                    trace!("evicting block {}", entry.block_id);
                }
            }
            needed
        };
        debug!("evicted {evicted} blocks, {} resident", entries.len());
        evicted
    }

    /// Empty the cache, the requested set and all request queues.
    pub fn purge_all(&mut self) {
        self.entries.lock().clear();
        self.requested.clear();
        for queue in self.queues.iter_mut() {
            queue.clear();
        }
    }

    /// Turn a completed transfer into a cache entry.
    ///
    /// The payload is moved into the block. If the cache is full the block is dropped
    /// and its id put back into the request queue of its subdomain.
    pub fn add_arrived(&mut self, arrived: ArrivedBlock, time: f64) -> Arrival {
        let block_id = arrived.header.block_id;
        let subdomain_id = arrived.header.subdomain_id;
        self.requested.remove(&block_id);

        let mut entries = self.entries.lock();
        if entries.iter().any(|entry| entry.block_id == block_id) {
            debug!("block {block_id} arrived twice, keeping the resident copy");
            return Arrival::Cached(block_id);
        }

        if entries.len() >= self.capacity {
            warn!(
                "block cache full ({} blocks), dropping block {block_id} and requesting it again",
                self.capacity
            );
            drop(entries);
            self.queues[subdomain_id as usize].push(block_id);
            return Arrival::Dropped(block_id);
        }

        let block = Block::new(arrived.header, self.halo, time, arrived.payload);
        entries.push_front(CacheEntry {
            block_id,
            block: Arc::new(block),
        });
        trace!("cached block {block_id}, {} resident", entries.len());
        Arrival::Cached(block_id)
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::{Arrival, BlockCache, LoadResult};
    use crate::{
        block::BlockHeader, config::Decomposition, spatial_index::SpatialIndex,
        tools::seeded_rng, transfer::ArrivedBlock, types::BlockId,
    };

    fn arrived(index: &SpatialIndex, block_id: BlockId) -> ArrivedBlock {
        let header = BlockHeader::new(&index.block_geometry(block_id), 1, index.pitch());
        ArrivedBlock {
            payload: vec![0.0; header.cell_count() * 3],
            header,
        }
    }

    fn request(cache: &mut BlockCache, block_id: BlockId) {
        assert!(cache.enqueue(0, block_id));
        let (taken, _) = cache.take_requests(0, usize::MAX);
        assert_eq!(taken, vec![block_id]);
    }

    fn fill(cache: &mut BlockCache, index: &SpatialIndex, ids: &[BlockId]) {
        for &block_id in ids {
            request(cache, block_id);
            assert_eq!(cache.add_arrived(arrived(index, block_id), 0.0), Arrival::Cached(block_id));
        }
    }

    #[test]
    fn test_lru_eviction() {
        let index = SpatialIndex::new(&Decomposition::default()).unwrap();
        let mut cache = BlockCache::new(3, 1, 1);

        // A, B, C arrive and are used in this order.
        fill(&mut cache, &index, &[1, 2, 3]);
        assert!(matches!(cache.load(1), LoadResult::Found(_)));
        assert_eq!(cache.resident_ids(), vec![1, 3, 2]);

        assert_eq!(cache.evict_up_to(1), 1);
        assert_eq!(cache.resident_ids(), vec![1, 3]);
        assert!(matches!(cache.load(2), LoadResult::AbandonedThisStep));
    }

    #[test]
    fn test_evict_purges_when_asking_for_more() {
        let index = SpatialIndex::new(&Decomposition::default()).unwrap();
        let mut cache = BlockCache::new(4, 1, 1);
        fill(&mut cache, &index, &[0, 1, 2]);

        // One entry is free, so nothing to do.
        assert_eq!(cache.evict_up_to(1), 0);
        assert_eq!(cache.len(), 3);

        // Freeing four entries removes everything.
        assert_eq!(cache.evict_up_to(4), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_load_states() {
        let index = SpatialIndex::new(&Decomposition::default()).unwrap();
        let mut cache = BlockCache::new(2, 1, 1);

        assert!(matches!(cache.load(4), LoadResult::AbandonedThisStep));

        cache.enqueue(0, 4);
        assert!(matches!(cache.load(4), LoadResult::NotRequested));

        cache.take_requests(0, 1);
        assert!(matches!(cache.load(4), LoadResult::NotYetArrived));

        cache.add_arrived(arrived(&index, 4), 1.5);
        match cache.load(4) {
            LoadResult::Found(block) => {
                assert_eq!(block.id(), 4);
                assert_eq!(block.time(), 1.5);
            }
            other => panic!("unexpected load result {other:?}"),
        }

        cache.purge_all();
        assert!(matches!(cache.load(4), LoadResult::AbandonedThisStep));
    }

    #[test]
    fn test_overflow_requeues() {
        let index = SpatialIndex::new(&Decomposition::default()).unwrap();
        let mut cache = BlockCache::new(1, 1, 1);
        fill(&mut cache, &index, &[0]);

        request(&mut cache, 5);
        assert_eq!(cache.add_arrived(arrived(&index, 5), 0.0), Arrival::Dropped(5));
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.load(5), LoadResult::NotRequested));
        assert_eq!(cache.queue(0), &[5]);
    }

    #[test]
    fn test_queue_dedup_and_cap() {
        let mut cache = BlockCache::new(8, 1, 1);
        for block_id in [5, 5, 9, 9, 9] {
            cache.enqueue(0, block_id);
        }
        cache.dedup_queues();
        assert_eq!(cache.queue(0), &[5, 9]);

        let (taken, remaining) = cache.take_requests(0, 1);
        assert_eq!(taken, vec![5]);
        assert!(remaining);
        assert!(!cache.enqueue(0, 5));

        let (taken, remaining) = cache.take_requests(0, 1);
        assert_eq!(taken, vec![9]);
        assert!(!remaining);
        assert_eq!(cache.requested_len(), 2);
    }

    #[test]
    fn test_random_operations_keep_invariants() {
        let index = SpatialIndex::new(&Decomposition::default()).unwrap();
        let mut cache = BlockCache::new(3, 1, 1);
        let mut rng = seeded_rng(7);

        for _ in 0..2000 {
            let block_id = rng.gen_range(0..8);
            match rng.gen_range(0..6) {
                0 => {
                    cache.enqueue(0, block_id);
                }
                1 => {
                    cache.dedup_queues();
                    cache.take_requests(0, rng.gen_range(1..4));
                }
                2 => {
                    if cache.is_requested(block_id) {
                        cache.add_arrived(arrived(&index, block_id), 0.0);
                    }
                }
                3 => {
                    cache.evict_up_to(rng.gen_range(0..5));
                }
                4 => {
                    cache.load(block_id);
                }
                _ => {
                    if rng.gen_bool(0.05) {
                        cache.purge_all();
                    }
                }
            }

            assert!(cache.len() <= cache.capacity());
            for id in 0..8 {
                let places = [cache.is_cached(id), cache.is_requested(id), cache.is_queued(id)];
                assert!(places.iter().filter(|&&p| p).count() <= 1, "block {id} in {places:?}");
            }
        }
    }
}
