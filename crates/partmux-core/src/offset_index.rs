//! Per-partition index translating virtual offsets to physical scan positions
//!
//! A virtual offset is the count of earlier records of the same virtual
//! partition in its physical partition, counted from the partition's origin
//! (the log start observed when the index was first built). Translating a
//! virtual offset therefore means finding where in the physical log to start
//! scanning.
//!
//! ## Structure
//!
//! For every physical partition the index keeps:
//!
//! - a **frontier**: every physical record below it has been counted
//! - **counts**: records per virtual partition below the frontier
//! - **anchors**: `(virtual, virtual offset) -> physical` hints, bounded by an
//!   LRU. An anchor means "the first record of that virtual partition at or
//!   after this physical offset has this virtual offset". Exact anchors point
//!   at the record itself and are never replaced by approximate ones.
//!
//! Anchors are only ever hints: dropping any of them makes lookups slower, not
//! wrong, since a scan can always restart from the origin.
//!
//! Each partition sits behind its own mutex so unrelated partitions never
//! contend. Callers never hold a lock across an await point.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

/// Identifies a physical partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// Where a resolved scan starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource {
    /// Requested offset is at or past everything counted so far
    Frontier,
    /// An anchor at or below the requested offset
    Cache,
    /// No anchor; scan from the partition origin
    Origin,
}

/// Starting point for a physical scan.
///
/// The first record of the virtual partition at or after `physical_offset`
/// has virtual offset `virtual_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStart {
    pub physical_offset: i64,
    pub virtual_offset: i64,
    pub source: ScanSource,
}

/// The parts of a physical record the index cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedRecord {
    pub offset: i64,
    pub virtual_partition: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    physical: i64,
    exact: bool,
}

struct PartitionIndex {
    origin: i64,
    frontier: i64,
    counts: HashMap<i32, i64>,
    anchors: LruCache<(i32, i64), Anchor>,
    /// Ordered view of `anchors` for range lookups
    ordered: BTreeMap<(i32, i64), i64>,
    /// Exact anchors keyed by physical offset
    exact: BTreeMap<i64, (i32, i64)>,
}

impl PartitionIndex {
    fn new(origin: i64, capacity: NonZeroUsize) -> Self {
        Self {
            origin,
            frontier: origin,
            counts: HashMap::new(),
            anchors: LruCache::new(capacity),
            ordered: BTreeMap::new(),
            exact: BTreeMap::new(),
        }
    }

    fn insert_anchor(&mut self, virtual_partition: i32, virtual_offset: i64, physical: i64, exact: bool) {
        let key = (virtual_partition, virtual_offset);

        if let Some(existing) = self.anchors.peek(&key) {
            if existing.exact && !exact {
                self.anchors.promote(&key);
                return;
            }
        }

        let anchor = Anchor { physical, exact };
        if let Some((old_key, old)) = self.anchors.push(key, anchor) {
            if old.exact {
                self.exact.remove(&old.physical);
            }
            if old_key != key {
                self.ordered.remove(&old_key);
            }
        }

        self.ordered.insert(key, physical);
        if exact {
            self.exact.insert(physical, key);
        }
    }
}

/// Hit/miss counters and size of the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub hits: u64,
    pub misses: u64,
    pub partitions: usize,
    pub anchors: usize,
}

/// Offset index shared by every session of a proxy process
pub struct OffsetIndex {
    partitions: DashMap<PartitionKey, Arc<Mutex<PartitionIndex>>>,
    capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl OffsetIndex {
    /// Create an index keeping up to `capacity` anchors per physical partition
    pub fn new(capacity: usize) -> Self {
        Self {
            partitions: DashMap::new(),
            capacity: NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn partition(&self, key: &PartitionKey) -> Option<Arc<Mutex<PartitionIndex>>> {
        self.partitions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_initialized(&self, key: &PartitionKey) -> bool {
        self.partitions.contains_key(key)
    }

    /// Start indexing a partition at `log_start`. No-op if already indexed.
    pub fn initialize(&self, key: &PartitionKey, log_start: i64) {
        let capacity = self.capacity;
        self.partitions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PartitionIndex::new(log_start, capacity))));
    }

    /// Find where to start scanning for `virtual_offset` of `virtual_partition`.
    ///
    /// Returns `None` if the partition has not been initialized.
    pub fn resolve(
        &self,
        key: &PartitionKey,
        virtual_partition: i32,
        virtual_offset: i64,
    ) -> Option<ScanStart> {
        let partition = self.partition(key)?;
        let mut index = partition.lock();

        let count = index.counts.get(&virtual_partition).copied().unwrap_or(0);
        if virtual_offset >= count {
            return Some(ScanStart {
                physical_offset: index.frontier,
                virtual_offset: count,
                source: ScanSource::Frontier,
            });
        }

        let found = index
            .ordered
            .range((virtual_partition, i64::MIN)..=(virtual_partition, virtual_offset))
            .next_back()
            .map(|(&anchor_key, &physical)| (anchor_key, physical));

        match found {
            Some((anchor_key, physical)) => {
                index.anchors.promote(&anchor_key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(ScanStart {
                    physical_offset: physical,
                    virtual_offset: anchor_key.1,
                    source: ScanSource::Cache,
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    topic = %key.topic,
                    partition = key.partition,
                    virtual_partition,
                    virtual_offset,
                    origin = index.origin,
                    "No anchor for virtual offset, scanning from origin"
                );
                Some(ScanStart {
                    physical_offset: index.origin,
                    virtual_offset: 0,
                    source: ScanSource::Origin,
                })
            }
        }
    }

    /// Count records scanned from physical offset `from` up to `next`.
    ///
    /// Records below the current frontier are skipped, so overlapping scans
    /// never double count. A scan starting beyond the frontier would leave a
    /// gap and is refused with `None`. Otherwise returns how many virtual
    /// partitions were seen for the first time.
    pub fn advance(
        &self,
        key: &PartitionKey,
        from: i64,
        batches: &[Vec<ScannedRecord>],
        next: i64,
    ) -> Option<usize> {
        let partition = self.partition(key)?;
        let mut index = partition.lock();

        if from > index.frontier {
            return None;
        }

        let mut discovered = 0;
        for batch in batches {
            let mut anchored: Vec<i32> = Vec::new();
            for record in batch {
                if record.offset < index.frontier {
                    continue;
                }
                let Some(virtual_partition) = record.virtual_partition else {
                    continue;
                };

                let count = index.counts.entry(virtual_partition).or_insert_with(|| {
                    discovered += 1;
                    0
                });
                let virtual_offset = *count;
                *count += 1;

                if !anchored.contains(&virtual_partition) {
                    anchored.push(virtual_partition);
                    index.insert_anchor(virtual_partition, virtual_offset, record.offset, true);
                }
            }
        }

        index.frontier = index.frontier.max(next);
        Some(discovered)
    }

    /// Record that the first record of `virtual_partition` at or after
    /// `physical` has `virtual_offset`.
    pub fn remember(
        &self,
        key: &PartitionKey,
        virtual_partition: i32,
        virtual_offset: i64,
        physical: i64,
    ) {
        if let Some(partition) = self.partition(key) {
            partition
                .lock()
                .insert_anchor(virtual_partition, virtual_offset, physical, false);
        }
    }

    /// Virtual partition and offset of the counted record at `physical`, if
    /// it is exactly anchored.
    pub fn virtual_offset_at(&self, key: &PartitionKey, physical: i64) -> Option<(i32, i64)> {
        let partition = self.partition(key)?;
        let index = partition.lock();
        index.exact.get(&physical).copied()
    }

    /// Best starting point for counting records of `virtual_partition` that
    /// precede `physical`.
    pub fn anchor_before(
        &self,
        key: &PartitionKey,
        virtual_partition: i32,
        physical: i64,
    ) -> Option<ScanStart> {
        let partition = self.partition(key)?;
        let index = partition.lock();

        let found = index
            .ordered
            .range((virtual_partition, i64::MIN)..=(virtual_partition, i64::MAX))
            .rev()
            .find(|(_, &anchor_physical)| anchor_physical <= physical)
            .map(|(&(_, virtual_offset), &anchor_physical)| ScanStart {
                physical_offset: anchor_physical,
                virtual_offset,
                source: ScanSource::Cache,
            });

        Some(found.unwrap_or(ScanStart {
            physical_offset: index.origin,
            virtual_offset: 0,
            source: ScanSource::Origin,
        }))
    }

    /// Records of `virtual_partition` counted below the frontier
    pub fn count(&self, key: &PartitionKey, virtual_partition: i32) -> Option<i64> {
        let partition = self.partition(key)?;
        let index = partition.lock();
        Some(index.counts.get(&virtual_partition).copied().unwrap_or(0))
    }

    pub fn frontier(&self, key: &PartitionKey) -> Option<i64> {
        self.partition(key).map(|p| p.lock().frontier)
    }

    pub fn origin(&self, key: &PartitionKey) -> Option<i64> {
        self.partition(key).map(|p| p.lock().origin)
    }

    pub fn stats(&self) -> IndexStats {
        let anchors = self
            .partitions
            .iter()
            .map(|entry| entry.value().lock().anchors.len())
            .sum();

        IndexStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            partitions: self.partitions.len(),
            anchors,
        }
    }
}

impl Default for OffsetIndex {
    fn default() -> Self {
        Self::new(DEFAULT_ANCHOR_CAPACITY)
    }
}

/// Anchors kept per physical partition unless configured otherwise
pub const DEFAULT_ANCHOR_CAPACITY: usize = 10_000;
