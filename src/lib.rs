//! GC-aware handle tables for a tracing, generational garbage collector.
//!
//! A [`Handle`] is a stable, indirect reference to a managed object that
//! lives outside of the collector's object graph. Each handle has a
//! [`HandleKind`] that decides how the collector treats its referent: strong
//! handles keep it alive, weak handles are cleared when it dies, pinned
//! handles keep it from moving, and so on.
//!
//! Handles are grouped into [`HandleTable`]s, one per heap, which are grouped
//! into [`HandleTableBucket`]s, one per domain. The [`HandleManager`] owns
//! every bucket and is the entry point for both mutators and the collector,
//! which drives a [`Collection`] through the scan protocol.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

pub mod config;
mod handle;
mod map;
mod scan;
mod slots;
mod table;


pub use config::HandleTableConfig;
use config::Knobs;
pub use handle::{ExternalRef, Handle, HandleKind, ObjectRef, TableId, VariableKind};
use map::TableDirectory;
pub use map::{BucketIndex, DomainIndex, HandleTableBucket, HandleTableMap};
pub use scan::{
    Collection, CollectionPhase, Collector, DependentHandleContext, PromoteFlags, ScanContext,
};
pub use slots::{SegmentAllocator, SystemAllocator};
pub use table::HandleTable;

/// An error from a handle operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HandleError {
    /// A new segment was needed to create a handle, but either the segment
    /// limit was reached or the allocator failed.
    OutOfMemory {
        /// The kind of handle being created.
        kind: HandleKind,
        /// The number of segments the store had.
        segments: usize,
    },
    /// Every table id has been used.
    TableLimitReached,
    /// No bucket exists at this index.
    UnknownBucket(BucketIndex),
    /// A value is not a [`VariableKind`].
    InvalidVariableKind(u32),
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { kind, segments } => write!(
                f,
                "out of memory creating a {kind:?} handle ({segments} segments in use)"
            ),
            Self::TableLimitReached => f.write_str("no more handle tables can be created"),
            Self::UnknownBucket(index) => write!(f, "no handle table bucket at index {}", index.0),
            Self::InvalidVariableKind(bits) => {
                write!(f, "{bits:#x} is not a valid variable handle strength")
            }
        }
    }
}

impl std::error::Error for HandleError {}

/// The runtime's interop layer, as seen by the handle table.
pub trait Interop: Send + Sync {
    /// Returns true if external code holds a reference count on `object`.
    /// Ref-counted handles are strong while this returns true.
    fn is_ref_count_alive(&self, object: ObjectRef) -> bool;

    /// Releases an external weak reference held by a
    /// [`HandleKind::PlatformWeak`] handle that is being destroyed.
    fn release_weak_reference(&self, reference: ExternalRef);

    /// Returns true once the outstanding operation that `object` was pinned
    /// for by an [`HandleKind::AsyncPinned`] handle has completed.
    fn is_async_pin_complete(&self, object: ObjectRef) -> bool {
        let _ = object;
        false
    }
}

/// An [`Interop`] that reports no reference counts and holds nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoInterop;

impl Interop for NoInterop {
    fn is_ref_count_alive(&self, _object: ObjectRef) -> bool {
        false
    }

    fn release_weak_reference(&self, _reference: ExternalRef) {}
}

thread_local! {
    static HOME_HEAP: Cell<Option<usize>> = const { Cell::new(None) };
}

fn thread_home_slot() -> usize {
    static NEXT_HOME: AtomicUsize = AtomicUsize::new(0);
    HOME_HEAP.with(|home| {
        if let Some(home) = home.get() {
            home
        } else {
            let assigned = NEXT_HOME.fetch_add(1, Ordering::Relaxed);
            home.set(Some(assigned));
            assigned
        }
    })
}

static GLOBAL: OnceLock<HandleManager> = OnceLock::new();

fn owning_table(bucket: &HandleTableBucket, handle: Handle) -> &HandleTable {
    bucket
        .tables()
        .map(|table| &**table)
        .find(|table| table.id() == handle.table())
        .expect("handle was allocated from this bucket")
}

/// Owns every handle table and the map that finds them.
pub struct HandleManager {
    config: HandleTableConfig,
    map: HandleTableMap,
    directory: TableDirectory,
    allocator: Arc<dyn SegmentAllocator>,
    interop: Arc<dyn Interop>,
}

impl HandleManager {
    /// Returns a manager using the system allocator and no interop, with its
    /// default bucket created.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::TableLimitReached`] if `config` asks for more
    /// heaps than there are table ids.
    pub fn new(config: HandleTableConfig) -> Result<Self, HandleError> {
        Self::with_collaborators(config, Arc::new(SystemAllocator), Arc::new(NoInterop))
    }

    /// Returns a manager that allocates segments from `allocator` and
    /// consults `interop` for ref-counted and platform weak handles.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::TableLimitReached`] if `config` asks for more
    /// heaps than there are table ids.
    pub fn with_collaborators(
        config: HandleTableConfig,
        allocator: Arc<dyn SegmentAllocator>,
        interop: Arc<dyn Interop>,
    ) -> Result<Self, HandleError> {
        let manager = Self {
            map: HandleTableMap::new(config.initial_map_size),
            directory: TableDirectory::new(),
            config,
            allocator,
            interop,
        };
        let default = manager.create_bucket(DomainIndex::DEFAULT)?;
        debug_assert_eq!(default, BucketIndex::DEFAULT);
        Ok(manager)
    }

    /// Returns the process-wide manager, configuring it from the environment
    /// the first time it is accessed.
    ///
    /// # Panics
    ///
    /// Panics if the environment configures more heaps than there are table
    /// ids.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| {
            let config = HandleTableConfig::from_knobs(&Knobs::from_env());
            tracing::debug!(?config, "initializing global handle manager");
            Self::new(config).expect("invalid handle table configuration")
        })
    }

    /// Returns the configuration this manager was created with.
    #[must_use]
    pub const fn config(&self) -> &HandleTableConfig {
        &self.config
    }

    /// Returns the map of buckets.
    #[must_use]
    pub const fn map(&self) -> &HandleTableMap {
        &self.map
    }

    /// Returns the heap the calling thread creates global handles on.
    ///
    /// Threads are assigned round-robin the first time they ask.
    #[must_use]
    pub fn current_thread_home_heap(&self) -> usize {
        if self.config.heap_count <= 1 {
            0
        } else {
            thread_home_slot() % self.config.heap_count
        }
    }

    /// Creates a bucket with one table per heap for `domain`.
    ///
    /// [`BucketIndex::DEFAULT`] is only ever given to the default domain.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::TableLimitReached`] if no more table ids are
    /// available.
    pub fn create_bucket(&self, domain: DomainIndex) -> Result<BucketIndex, HandleError> {
        let first = if domain == DomainIndex::DEFAULT {
            BucketIndex::DEFAULT
        } else {
            BucketIndex(1)
        };
        let index = self.map.insert(first, |index| {
            let ids = self.directory.reserve(self.config.heap_count)?;
            let tables = ids
                .into_iter()
                .enumerate()
                .map(|(heap, id)| {
                    let table = Arc::new(HandleTable::new(
                        id,
                        heap,
                        domain,
                        index,
                        self.config.max_segments_per_store,
                        &self.allocator,
                    ));
                    self.directory.publish(&table);
                    table
                })
                .collect();
            Ok(Arc::new(HandleTableBucket::new(index, domain, tables)))
        })?;
        tracing::debug!(bucket = index.0, domain = domain.0, "created handle table bucket");
        Ok(index)
    }

    /// Returns the bucket at `index`.
    #[must_use]
    pub fn bucket(&self, index: BucketIndex) -> Option<Arc<HandleTableBucket>> {
        self.map.get(index)
    }

    /// Returns the bucket created when this manager started.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::UnknownBucket`] if the default bucket has been
    /// removed.
    pub fn default_bucket(&self) -> Result<Arc<HandleTableBucket>, HandleError> {
        self.map
            .get(BucketIndex::DEFAULT)
            .ok_or(HandleError::UnknownBucket(BucketIndex::DEFAULT))
    }

    /// Detaches the bucket at `index` from the map, returning it so that it
    /// can later be passed to [`destroy_bucket()`](Self::destroy_bucket).
    /// Handles in the bucket remain usable, but collections stop scanning
    /// them.
    pub fn remove_bucket(&self, index: BucketIndex) -> Option<Arc<HandleTableBucket>> {
        let removed = self.map.remove(index);
        if removed.is_some() {
            tracing::debug!(bucket = index.0, "removed handle table bucket");
        }
        removed
    }

    /// Destroys `bucket` and every handle in it. External weak references
    /// held by platform weak handles are released.
    ///
    /// Any later use of a handle from this bucket panics.
    pub fn destroy_bucket(&self, bucket: Arc<HandleTableBucket>) {
        self.map.remove_if_present(&bucket);
        let mut released = 0_usize;
        for table in bucket.tables() {
            for (_, slot) in table.handles(HandleKind::PlatformWeak) {
                if let Some(reference) = ExternalRef::from_extra(slot.extra()) {
                    self.interop.release_weak_reference(reference);
                    released += 1;
                }
            }
            table.retire();
            self.directory.release(table);
        }
        tracing::debug!(
            bucket = bucket.index().0,
            handles = bucket.len(),
            released,
            "destroyed handle table bucket"
        );
    }

    /// Returns true if `handle` is a live handle in the bucket at `index`.
    #[must_use]
    pub fn contains_handle(&self, index: BucketIndex, handle: Handle) -> bool {
        self.map
            .get(index)
            .map_or(false, |bucket| bucket.contains(handle))
    }

    /// Returns the table `handle` was allocated from.
    ///
    /// # Panics
    ///
    /// Panics if the handle's bucket has been destroyed.
    #[must_use]
    pub fn table_for_handle(&self, handle: Handle) -> Arc<HandleTable> {
        self.directory
            .get(handle.table())
            .unwrap_or_else(|| panic!("{handle:?} used after its table was destroyed"))
    }

    fn global_table(&self) -> Result<Arc<HandleTable>, HandleError> {
        let bucket = self.default_bucket()?;
        let heap = self.current_thread_home_heap() % bucket.table_count();
        Ok(bucket.table(heap).clone())
    }

    fn all_tables(&self) -> Vec<Arc<HandleTable>> {
        self.map
            .buckets()
            .iter()
            .flat_map(|bucket| bucket.tables().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Creates a handle of `kind` in `table`. Variable handles start out
    /// [`VariableKind::Strong`].
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::OutOfMemory`] if the table could not grow.
    pub fn create_handle(
        &self,
        table: &HandleTable,
        kind: HandleKind,
        object: ObjectRef,
    ) -> Result<Handle, HandleError> {
        let extra = if kind == HandleKind::Variable {
            VariableKind::Strong.bits()
        } else {
            0
        };
        table.create(kind, object, extra)
    }

    /// Creates a handle of `kind` in `table` with a secondary value.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::InvalidVariableKind`] if `kind` is
    /// [`HandleKind::Variable`] and `extra` is not a [`VariableKind`], or
    /// [`HandleError::OutOfMemory`] if the table could not grow.
    pub fn create_handle_with_extra_info(
        &self,
        table: &HandleTable,
        kind: HandleKind,
        object: ObjectRef,
        extra: usize,
    ) -> Result<Handle, HandleError> {
        table.create(kind, object, extra)
    }

    /// Creates a handle of `kind` in the calling thread's home table of the
    /// default bucket.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::OutOfMemory`] if the table could not grow, or
    /// [`HandleError::UnknownBucket`] if the default bucket was removed.
    pub fn create_global_handle(
        &self,
        kind: HandleKind,
        object: ObjectRef,
    ) -> Result<Handle, HandleError> {
        let table = self.global_table()?;
        self.create_handle(&table, kind, object)
    }

    /// Destroys `handle`, whatever its kind.
    ///
    /// # Panics
    ///
    /// Panics if the handle's bucket has been destroyed.
    pub fn destroy_handle(&self, handle: Handle) {
        let table = self.table_for_handle(handle);
        if handle.kind() == HandleKind::PlatformWeak {
            if let Some(reference) = ExternalRef::from_extra(table.extra_info(handle)) {
                self.interop.release_weak_reference(reference);
            }
        }
        table.destroy_of_unknown_kind(handle);
    }

    /// Destroys `handle`, which must have been created as `kind`.
    ///
    /// # Panics
    ///
    /// Panics if the handle's bucket has been destroyed. Debug builds also
    /// panic if `kind` is not the handle's kind.
    pub fn destroy_typed_handle(&self, handle: Handle, kind: HandleKind) {
        debug_assert_eq!(
            handle.kind(),
            kind,
            "handle destroyed as the wrong kind of handle"
        );
        self.destroy_handle(handle);
    }

    /// Creates a new strong handle in the same table as `handle`, referring
    /// to the same object.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::OutOfMemory`] if the table could not grow.
    pub fn create_duplicate_handle(&self, handle: Handle) -> Result<Handle, HandleError> {
        let table = self.table_for_handle(handle);
        let object = table.fetch(handle);
        table.create(HandleKind::Strong, object, 0)
    }

    /// Returns the current referent of `handle`.
    #[must_use]
    pub fn fetch(&self, handle: Handle) -> ObjectRef {
        self.table_for_handle(handle).fetch(handle)
    }

    /// Replaces the referent of `handle`.
    pub fn store(&self, handle: Handle, object: ObjectRef) {
        self.table_for_handle(handle).store(handle, object);
    }

    /// Stores `object` if `handle` currently refers to nothing, returning
    /// true if it did.
    pub fn store_if_null(&self, handle: Handle, object: ObjectRef) -> bool {
        self.table_for_handle(handle).store_if_null(handle, object)
    }

    /// Replaces the referent of `handle` with `new` if it is `comparand`,
    /// returning the referent seen before the exchange.
    pub fn compare_exchange(&self, handle: Handle, new: ObjectRef, comparand: ObjectRef) -> ObjectRef {
        self.table_for_handle(handle)
            .compare_exchange(handle, new, comparand)
    }

    /// Returns true if `handle` refers to nothing.
    #[must_use]
    pub fn is_null(&self, handle: Handle) -> bool {
        self.table_for_handle(handle).is_null(handle)
    }

    /// Clears the referent of `handle`.
    pub fn reset_handle(&self, handle: Handle) {
        self.store(handle, ObjectRef::NULL);
    }

    /// Returns the secondary value of `handle`.
    #[must_use]
    pub fn extra_info(&self, handle: Handle) -> usize {
        self.table_for_handle(handle).extra_info(handle)
    }

    /// Returns the secondary object of a dependent handle.
    #[must_use]
    pub fn dependent_secondary(&self, handle: Handle) -> ObjectRef {
        debug_assert_eq!(handle.kind(), HandleKind::Dependent);
        ObjectRef::from_addr(self.extra_info(handle))
    }

    /// Replaces the secondary object of a dependent handle.
    pub fn set_dependent_secondary(&self, handle: Handle, secondary: ObjectRef) {
        self.table_for_handle(handle)
            .set_dependent_secondary(handle, secondary);
    }

    /// Returns the retained size the last collection computed for a
    /// sized-ref handle's referent.
    #[must_use]
    pub fn sized_ref_size(&self, handle: Handle) -> usize {
        debug_assert_eq!(handle.kind(), HandleKind::SizedRef);
        self.extra_info(handle)
    }

    /// Returns the external weak reference held by a platform weak handle.
    #[must_use]
    pub fn platform_weak_reference(&self, handle: Handle) -> Option<ExternalRef> {
        debug_assert_eq!(handle.kind(), HandleKind::PlatformWeak);
        ExternalRef::from_extra(self.extra_info(handle))
    }

    /// Returns the current strength of a variable handle.
    #[must_use]
    pub fn variable_kind(&self, handle: Handle) -> VariableKind {
        self.table_for_handle(handle).variable_kind(handle)
    }

    /// Changes the strength of a variable handle.
    pub fn update_variable_kind(&self, handle: Handle, kind: VariableKind) {
        self.table_for_handle(handle).set_variable_kind(handle, kind);
    }

    /// Changes the strength of a variable handle to `new` if it is `old`,
    /// returning the strength seen before the exchange.
    pub fn compare_exchange_variable_kind(
        &self,
        handle: Handle,
        old: VariableKind,
        new: VariableKind,
    ) -> VariableKind {
        self.table_for_handle(handle)
            .compare_exchange_variable_kind(handle, old, new)
    }

    /// Moves every async-pinned handle in `source` into `target`, returning
    /// the old and new handle for each. The old handles are destroyed.
    ///
    /// `source` does not need to be in the map, so a bucket detached with
    /// [`remove_bucket()`](Self::remove_bucket) can still be emptied before
    /// it is destroyed. Nothing is moved if any new handle can't be created.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::OutOfMemory`] if a target table could not
    /// grow.
    pub fn relocate_async_pinned_handles(
        &self,
        source: &HandleTableBucket,
        target: &HandleTableBucket,
    ) -> Result<Vec<(Handle, Handle)>, HandleError> {
        if std::ptr::eq(source, target) {
            return Ok(Vec::new());
        }

        let mut moved = Vec::new();
        for table in source.tables() {
            let destination = target.table(table.heap() % target.table_count());
            for (old, slot) in table.handles(HandleKind::AsyncPinned) {
                match destination.create(HandleKind::AsyncPinned, slot.object(), slot.extra()) {
                    Ok(new) => moved.push((old, new)),
                    Err(err) => {
                        for (_, new) in moved {
                            owning_table(target, new).destroy(new, HandleKind::AsyncPinned);
                        }
                        return Err(err);
                    }
                }
            }
        }

        for (old, _) in &moved {
            owning_table(source, *old).destroy(*old, HandleKind::AsyncPinned);
        }
        tracing::debug!(
            source = source.index().0,
            target = target.index().0,
            moved = moved.len(),
            "relocated async pinned handles"
        );
        Ok(moved)
    }

    /// Releases the pins of async-pinned handles whose operation has
    /// completed, as reported by [`Interop::is_async_pin_complete`].
    ///
    /// A released handle is cleared but stays allocated until its owner
    /// destroys it. Returns true if any async-pinned handle still pins an
    /// object.
    pub fn handle_async_pinned_handles(&self) -> bool {
        let mut released = 0_usize;
        let mut pending = 0_usize;
        for table in self.all_tables() {
            for (_, slot) in table.handles(HandleKind::AsyncPinned) {
                let object = slot.object();
                if object.is_null() {
                    continue;
                }
                if self.interop.is_async_pin_complete(object) {
                    slot.set_object(ObjectRef::NULL);
                    released += 1;
                } else {
                    pending += 1;
                }
            }
        }
        tracing::debug!(released, pending, "handled async pinned handles");
        pending > 0
    }

    /// Invokes `visit` for every ref-counted handle with its referent.
    pub fn trace_ref_count_handles(&self, mut visit: impl FnMut(Handle, ObjectRef)) {
        for table in self.all_tables() {
            for (handle, slot) in table.handles(HandleKind::RefCounted) {
                visit(handle, slot.object());
            }
        }
    }

    /// Starts a collection over every table in the map.
    ///
    /// Mutators must be stopped until the returned collection ends.
    #[must_use]
    pub fn begin_collection(&self, context: ScanContext) -> Collection<'_> {
        Collection::begin(self.all_tables(), &*self.interop, context)
    }

    /// Invokes `visit` for every live handle with its referent and secondary
    /// value. Nothing is modified.
    pub fn scan_handles_for_profiler(&self, visit: impl FnMut(Handle, ObjectRef, usize)) {
        scan::scan_handles_for_profiler(&self.all_tables(), visit);
    }

    /// Invokes `visit` for every live dependent handle with its primary and
    /// secondary. Nothing is modified.
    pub fn scan_dependent_handles_for_profiler(
        &self,
        visit: impl FnMut(Handle, ObjectRef, ObjectRef),
    ) {
        scan::scan_dependent_handles_for_profiler(&self.all_tables(), visit);
    }
}

macro_rules! kind_constructors {
    ($($(#[$doc:meta])* $name:ident => $kind:ident),+ $(,)?) => {
        impl HandleManager {
            $(
                $(#[$doc])*
                ///
                /// # Errors
                ///
                /// Returns [`HandleError::OutOfMemory`] if the table could
                /// not grow.
                pub fn $name(&self, table: &HandleTable, object: ObjectRef) -> Result<Handle, HandleError> {
                    table.create(HandleKind::$kind, object, 0)
                }
            )+
        }
    };
}

kind_constructors!(
    /// Creates a strong handle.
    create_strong_handle => Strong,
    /// Creates a long weak handle.
    create_weak_handle => WeakLong,
    /// Creates a short weak handle.
    create_short_weak_handle => WeakShort,
    /// Creates a long weak handle.
    create_long_weak_handle => WeakLong,
    /// Creates a pinned handle.
    create_pinning_handle => Pinned,
    /// Creates an async-pinned handle.
    create_async_pinning_handle => AsyncPinned,
    /// Creates a sized-ref handle.
    create_sized_ref_handle => SizedRef,
    /// Creates a ref-counted handle.
    create_ref_counted_handle => RefCounted,
);

macro_rules! global_constructors {
    ($($(#[$doc:meta])* $name:ident => $kind:ident),+ $(,)?) => {
        impl HandleManager {
            $(
                $(#[$doc])*
                ///
                /// # Errors
                ///
                /// Returns [`HandleError::OutOfMemory`] if the table could
                /// not grow, or [`HandleError::UnknownBucket`] if the default
                /// bucket was removed.
                pub fn $name(&self, object: ObjectRef) -> Result<Handle, HandleError> {
                    self.create_global_handle(HandleKind::$kind, object)
                }
            )+
        }
    };
}

global_constructors!(
    /// Creates a strong handle in the default bucket.
    create_global_strong_handle => Strong,
    /// Creates a long weak handle in the default bucket.
    create_global_weak_handle => WeakLong,
    /// Creates a short weak handle in the default bucket.
    create_global_short_weak_handle => WeakShort,
    /// Creates a long weak handle in the default bucket.
    create_global_long_weak_handle => WeakLong,
    /// Creates a pinned handle in the default bucket.
    create_global_pinning_handle => Pinned,
    /// Creates a ref-counted handle in the default bucket.
    create_global_ref_counted_handle => RefCounted,
);

impl HandleManager {
    /// Creates a dependent handle keeping `secondary` alive for as long as
    /// `primary` is.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::OutOfMemory`] if the table could not grow.
    pub fn create_dependent_handle(
        &self,
        table: &HandleTable,
        primary: ObjectRef,
        secondary: ObjectRef,
    ) -> Result<Handle, HandleError> {
        table.create(HandleKind::Dependent, primary, secondary.addr())
    }

    /// Creates a variable handle with strength `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::OutOfMemory`] if the table could not grow.
    pub fn create_variable_handle(
        &self,
        table: &HandleTable,
        object: ObjectRef,
        kind: VariableKind,
    ) -> Result<Handle, HandleError> {
        table.create(HandleKind::Variable, object, kind.bits())
    }

    /// Creates a platform weak handle that owns `reference`. The reference
    /// is released through [`Interop::release_weak_reference`] when the
    /// handle is destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::OutOfMemory`] if the table could not grow.
    pub fn create_platform_weak_handle(
        &self,
        table: &HandleTable,
        object: ObjectRef,
        reference: ExternalRef,
    ) -> Result<Handle, HandleError> {
        table.create(HandleKind::PlatformWeak, object, reference.get().get())
    }
}

impl fmt::Debug for HandleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleManager")
            .field("config", &self.config)
            .field("buckets", &self.map.buckets())
            .finish_non_exhaustive()
    }
}

impl Drop for HandleManager {
    fn drop(&mut self) {
        for bucket in self.map.buckets() {
            self.destroy_bucket(bucket);
        }
    }
}
