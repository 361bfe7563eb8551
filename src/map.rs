use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::CachePadded;
use intentional::Cast;
use parking_lot::{Mutex, RwLock};

use crate::handle::{Handle, TableId};
use crate::table::HandleTable;
use crate::HandleError;

/// Identifies a logical domain, such as an isolated execution context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DomainIndex(pub u32);

impl DomainIndex {
    /// The implicit domain that owns global handles.
    pub const DEFAULT: Self = Self(0);
}

/// The position of a bucket in the [`HandleTableMap`].
///
/// Indexes are tokens: the map owns its buckets, and an index stays valid
/// until the bucket is removed. Removed indexes may be reused by later
/// buckets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BucketIndex(pub usize);

impl BucketIndex {
    /// The bucket of the default domain, created when the manager starts.
    pub const DEFAULT: Self = Self(0);
}

/// One handle table per heap, grouped into a single domain.
pub struct HandleTableBucket {
    index: BucketIndex,
    domain: DomainIndex,
    tables: Box<[CachePadded<Arc<HandleTable>>]>,
    next_table: AtomicUsize,
}

impl HandleTableBucket {
    pub(crate) fn new(index: BucketIndex, domain: DomainIndex, tables: Vec<Arc<HandleTable>>) -> Self {
        assert!(!tables.is_empty(), "a bucket needs at least one table");
        Self {
            index,
            domain,
            tables: tables.into_iter().map(CachePadded::new).collect(),
            next_table: AtomicUsize::new(0),
        }
    }

    /// Returns this bucket's position in the map.
    #[must_use]
    pub const fn index(&self) -> BucketIndex {
        self.index
    }

    /// Returns the domain this bucket belongs to.
    #[must_use]
    pub const fn domain(&self) -> DomainIndex {
        self.domain
    }

    /// Returns the table for `heap`.
    ///
    /// # Panics
    ///
    /// Panics if `heap` is not less than [`Self::table_count()`].
    #[must_use]
    pub fn table(&self, heap: usize) -> &Arc<HandleTable> {
        &*self.tables[heap]
    }

    /// Returns the number of tables, which is the number of heaps.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Iterates this bucket's tables in heap order.
    pub fn tables(&self) -> impl Iterator<Item = &Arc<HandleTable>> + '_ {
        self.tables.iter().map(|table| &**table)
    }

    /// Returns the table new domain-scoped handles should be created in,
    /// rotating through the heaps so that creation is spread across tables.
    #[must_use]
    pub fn preferred_table(&self) -> &Arc<HandleTable> {
        let next = self.next_table.fetch_add(1, Ordering::Relaxed);
        &*self.tables[next % self.tables.len()]
    }

    /// Returns true if `handle` is a live handle in one of this bucket's
    /// tables.
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.tables()
            .any(|table| table.id() == handle.table() && table.contains(handle))
    }

    /// Returns the number of live handles across all of this bucket's tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables().map(|table| table.len()).sum()
    }

    /// Returns true if none of this bucket's tables contain live handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HandleTableBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTableBucket")
            .field("index", &self.index)
            .field("domain", &self.domain)
            .field("tables", &self.tables.len())
            .finish_non_exhaustive()
    }
}

type BucketEntry = RwLock<Option<Arc<HandleTableBucket>>>;

struct MapSegment {
    first_index: usize,
    buckets: Box<[BucketEntry]>,
    next: OnceLock<Box<MapSegment>>,
}

impl MapSegment {
    fn new(first_index: usize, len: usize) -> Self {
        Self {
            first_index,
            buckets: (0..len).map(|_| RwLock::new(None)).collect(),
            next: OnceLock::new(),
        }
    }

    fn end_index(&self) -> usize {
        self.first_index + self.buckets.len()
    }
}

/// The process-wide directory of handle table buckets.
///
/// The map is a chain of fixed-size segments. Growing appends a segment, so
/// entries never move once created. Lookups never take the map-wide lock;
/// it is only held while buckets are inserted or removed and while the map
/// grows.
pub struct HandleTableMap {
    first: MapSegment,
    segment_len: usize,
    lock: Mutex<()>,
}

impl HandleTableMap {
    pub(crate) fn new(segment_len: usize) -> Self {
        let segment_len = segment_len.max(1);
        Self {
            first: MapSegment::new(0, segment_len),
            segment_len,
            lock: Mutex::new(()),
        }
    }

    fn segments(&self) -> impl Iterator<Item = &MapSegment> + '_ {
        let mut next = Some(&self.first);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.next.get().map(|segment| &**segment);
            Some(current)
        })
    }

    fn entry(&self, index: BucketIndex) -> Option<&BucketEntry> {
        self.segments()
            .find(|segment| index.0 < segment.end_index())
            .map(|segment| &segment.buckets[index.0 - segment.first_index])
    }

    /// Returns the number of bucket entries the map can currently hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.segments().last().map_or(0, MapSegment::end_index)
    }

    /// Returns the bucket at `index`, if one is present.
    #[must_use]
    pub fn get(&self, index: BucketIndex) -> Option<Arc<HandleTableBucket>> {
        self.entry(index)?.read().clone()
    }

    /// Returns a snapshot of every bucket currently in the map.
    #[must_use]
    pub fn buckets(&self) -> Vec<Arc<HandleTableBucket>> {
        self.segments()
            .flat_map(|segment| segment.buckets.iter())
            .filter_map(|entry| entry.read().clone())
            .collect()
    }

    /// Adds a segment to the end of the map.
    pub fn append_map_segment(&self) {
        let _guard = self.lock.lock();
        self.append_locked();
    }

    fn append_locked(&self) -> &MapSegment {
        let last = self.segments().last().expect("the map always has a segment");
        let first_index = last.end_index();
        let appended = last
            .next
            .get_or_init(|| Box::new(MapSegment::new(first_index, self.segment_len)));
        tracing::debug!(capacity = appended.end_index(), "grew handle table map");
        appended
    }

    /// Places the bucket produced by `create` into the first free entry at
    /// or after `first`, growing the map if every such entry is taken.
    pub(crate) fn insert(
        &self,
        first: BucketIndex,
        create: impl FnOnce(BucketIndex) -> Result<Arc<HandleTableBucket>, HandleError>,
    ) -> Result<BucketIndex, HandleError> {
        let _guard = self.lock.lock();
        let free = self.segments().find_map(|segment| {
            segment
                .buckets
                .iter()
                .enumerate()
                .skip(first.0.saturating_sub(segment.first_index))
                .find(|(_, entry)| entry.read().is_none())
                .map(|(offset, _)| (segment, offset))
        });
        let (segment, offset) = match free {
            Some(free) => free,
            None => {
                let mut appended = self.append_locked();
                while appended.end_index() <= first.0 {
                    appended = self.append_locked();
                }
                (appended, first.0.saturating_sub(appended.first_index))
            }
        };
        let index = BucketIndex(segment.first_index + offset);
        let bucket = create(index)?;
        *segment.buckets[offset].write() = Some(bucket);
        Ok(index)
    }

    /// Detaches the bucket at `index` without destroying its tables.
    pub(crate) fn remove(&self, index: BucketIndex) -> Option<Arc<HandleTableBucket>> {
        let _guard = self.lock.lock();
        self.entry(index)?.write().take()
    }

    /// Detaches `bucket` if it is still present in the map.
    pub(crate) fn remove_if_present(&self, bucket: &Arc<HandleTableBucket>) -> bool {
        let _guard = self.lock.lock();
        let Some(entry) = self.entry(bucket.index()) else {
            return false;
        };
        let mut entry = entry.write();
        if entry
            .as_ref()
            .map_or(false, |present| Arc::ptr_eq(present, bucket))
        {
            *entry = None;
            true
        } else {
            false
        }
    }
}

const DIRECTORY_CHUNK: usize = 1024;

type DirectoryEntry = RwLock<Option<Arc<HandleTable>>>;

struct TableIds {
    next: u32,
    free: Vec<TableId>,
}

/// Resolves a [`TableId`] to its table.
///
/// Entries own their table until it is released, after which the id goes on
/// a free list. A released id comes back with its reuse count bumped, so
/// handles into the released table stop resolving.
pub(crate) struct TableDirectory {
    chunks: Box<[OnceLock<Box<[DirectoryEntry]>>]>,
    ids: Mutex<TableIds>,
}

impl TableDirectory {
    pub fn new() -> Self {
        Self {
            chunks: (0..TableId::LIMIT.cast::<usize>() / DIRECTORY_CHUNK)
                .map(|_| OnceLock::new())
                .collect(),
            ids: Mutex::new(TableIds {
                next: 1,
                free: Vec::new(),
            }),
        }
    }

    /// Allocates ids for `count` tables, preferring released ids.
    pub fn reserve(&self, count: usize) -> Result<Vec<TableId>, HandleError> {
        let mut ids = self.ids.lock();
        let recycled = count.min(ids.free.len());
        let end = u32::try_from(count - recycled)
            .ok()
            .and_then(|fresh| ids.next.checked_add(fresh))
            .filter(|end| *end <= TableId::LIMIT)
            .ok_or(HandleError::TableLimitReached)?;

        let split = ids.free.len() - recycled;
        let mut reserved = ids
            .free
            .drain(split..)
            .rev()
            .map(TableId::recycled)
            .collect::<Vec<_>>();
        reserved.extend((ids.next..end).map(TableId::new));
        ids.next = end;
        Ok(reserved)
    }

    fn entry(&self, id: TableId) -> Option<&DirectoryEntry> {
        let index = id.index();
        self.chunks
            .get(index / DIRECTORY_CHUNK)?
            .get()
            .map(|chunk| &chunk[index % DIRECTORY_CHUNK])
    }

    pub fn publish(&self, table: &Arc<HandleTable>) {
        let index = table.id().index();
        let chunk = self.chunks[index / DIRECTORY_CHUNK]
            .get_or_init(|| (0..DIRECTORY_CHUNK).map(|_| RwLock::new(None)).collect());
        let previous = chunk[index % DIRECTORY_CHUNK].write().replace(table.clone());
        assert!(previous.is_none(), "table id published twice");
    }

    /// Forgets `table` and makes its id available again.
    pub fn release(&self, table: &HandleTable) {
        let Some(entry) = self.entry(table.id()) else {
            return;
        };
        let mut entry = entry.write();
        if entry.as_ref().map_or(false, |present| present.id() == table.id()) {
            *entry = None;
            drop(entry);
            self.ids.lock().free.push(table.id());
        }
    }

    /// Returns the table `id` refers to, unless it has been destroyed.
    pub fn get(&self, id: TableId) -> Option<Arc<HandleTable>> {
        self.entry(id)?
            .read()
            .as_ref()
            .filter(|table| table.id() == id && !table.is_retired())
            .cloned()
    }
}
