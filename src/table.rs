use std::array;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::handle::{Handle, HandleKind, ObjectRef, TableId, VariableKind};
use crate::map::{BucketIndex, DomainIndex};
use crate::slots::{SegmentAllocator, Slot, SlotStore};
use crate::HandleError;

/// A set of handles owned by one heap of one domain.
///
/// A table holds one slot store per [`HandleKind`]. Every operation taking a
/// [`Handle`] requires a live handle allocated from this table. Passing any
/// other handle is a contract violation that debug builds assert on.
pub struct HandleTable {
    id: TableId,
    heap: usize,
    domain: DomainIndex,
    bucket: BucketIndex,
    retired: AtomicBool,
    stores: [SlotStore; HandleKind::COUNT],
}

impl HandleTable {
    pub(crate) fn new(
        id: TableId,
        heap: usize,
        domain: DomainIndex,
        bucket: BucketIndex,
        max_segments: usize,
        allocator: &Arc<dyn SegmentAllocator>,
    ) -> Self {
        Self {
            id,
            heap,
            domain,
            bucket,
            retired: AtomicBool::new(false),
            stores: array::from_fn(|index| {
                SlotStore::new(HandleKind::ALL[index], max_segments, allocator.clone())
            }),
        }
    }

    /// Returns this table's id.
    #[must_use]
    pub const fn id(&self) -> TableId {
        self.id
    }

    /// Returns the heap this table belongs to.
    #[must_use]
    pub const fn heap(&self) -> usize {
        self.heap
    }

    /// Returns the domain this table belongs to.
    #[must_use]
    pub const fn domain(&self) -> DomainIndex {
        self.domain
    }

    /// Returns the index of the bucket this table was created for.
    #[must_use]
    pub const fn bucket(&self) -> BucketIndex {
        self.bucket
    }

    /// Returns the number of live handles of `kind` in this table.
    #[must_use]
    pub fn count(&self, kind: HandleKind) -> usize {
        self.slots(kind).len()
    }

    /// Returns the number of live handles in this table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.iter().map(SlotStore::len).sum()
    }

    /// Returns true if this table contains no live handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub(crate) fn slots(&self, kind: HandleKind) -> &SlotStore {
        &self.stores[kind.index()]
    }

    /// Creates a handle of `kind` referring to `object`, with `extra` as its
    /// secondary value.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::InvalidVariableKind`] if `kind` is
    /// [`HandleKind::Variable`] and `extra` is not a [`VariableKind`], or
    /// [`HandleError::OutOfMemory`] if a new segment was needed and could not
    /// be allocated.
    pub fn create(
        &self,
        kind: HandleKind,
        object: ObjectRef,
        extra: usize,
    ) -> Result<Handle, HandleError> {
        debug_assert!(!self.is_retired(), "handle created in a destroyed table");
        if kind == HandleKind::Variable {
            VariableKind::try_from(u32::try_from(extra).unwrap_or(u32::MAX))?;
        }
        let (segment, slot, tag) = self.slots(kind).allocate(object, extra)?;
        Ok(Handle::new(self.id, kind, segment, slot, tag))
    }

    /// Destroys `handle`, which must have been created with `kind`.
    pub fn destroy(&self, handle: Handle, kind: HandleKind) {
        debug_assert_eq!(
            handle.kind(),
            kind,
            "handle destroyed as the wrong kind of handle"
        );
        self.destroy_of_unknown_kind(handle);
    }

    /// Destroys `handle`, reading its kind from the handle itself.
    pub fn destroy_of_unknown_kind(&self, handle: Handle) {
        self.debug_check(handle);
        self.slots(handle.kind())
            .free(handle.segment(), handle.slot(), handle.tag());
    }

    /// Returns the current referent of `handle`.
    #[must_use]
    pub fn fetch(&self, handle: Handle) -> ObjectRef {
        self.slot(handle).object()
    }

    /// Returns true if `handle` currently refers to nothing.
    #[must_use]
    pub fn is_null(&self, handle: Handle) -> bool {
        self.fetch(handle).is_null()
    }

    /// Replaces the referent of `handle`.
    pub fn store(&self, handle: Handle, object: ObjectRef) {
        let slot = self.slot(handle);
        slot.set_object(object);
        Self::write_barrier(slot, object);
    }

    /// Stores `object` only if `handle` currently refers to nothing.
    /// Returns true if the store happened.
    pub fn store_if_null(&self, handle: Handle, object: ObjectRef) -> bool {
        self.compare_exchange(handle, object, ObjectRef::NULL).is_null()
    }

    /// Atomically replaces the referent of `handle` with `new` if it is
    /// currently `comparand`. Returns the referent observed before the
    /// exchange, which equals `comparand` exactly when the exchange happened.
    pub fn compare_exchange(&self, handle: Handle, new: ObjectRef, comparand: ObjectRef) -> ObjectRef {
        let slot = self.slot(handle);
        let previous = slot.compare_exchange_object(new, comparand);
        if previous == comparand {
            Self::write_barrier(slot, new);
        }
        previous
    }

    /// Returns the secondary value stored alongside `handle`.
    #[must_use]
    pub fn extra_info(&self, handle: Handle) -> usize {
        self.slot(handle).extra()
    }

    /// Replaces the secondary object of a [`HandleKind::Dependent`] handle.
    pub fn set_dependent_secondary(&self, handle: Handle, secondary: ObjectRef) {
        debug_assert_eq!(handle.kind(), HandleKind::Dependent);
        let slot = self.slot(handle);
        slot.set_extra(secondary.addr());
        Self::write_barrier(slot, secondary);
    }

    /// Changes the strength of a [`HandleKind::Variable`] handle.
    pub fn set_variable_kind(&self, handle: Handle, kind: VariableKind) {
        debug_assert_eq!(handle.kind(), HandleKind::Variable);
        self.slot(handle).set_extra(kind.bits());
    }

    /// Returns the current strength of a [`HandleKind::Variable`] handle.
    #[must_use]
    pub fn variable_kind(&self, handle: Handle) -> VariableKind {
        debug_assert_eq!(handle.kind(), HandleKind::Variable);
        VariableKind::from_extra(self.slot(handle).extra())
    }

    /// Atomically changes the strength of a [`HandleKind::Variable`] handle to
    /// `new` if it is currently `old`. Returns the strength observed before
    /// the exchange.
    pub fn compare_exchange_variable_kind(
        &self,
        handle: Handle,
        old: VariableKind,
        new: VariableKind,
    ) -> VariableKind {
        debug_assert_eq!(handle.kind(), HandleKind::Variable);
        let previous = self
            .slot(handle)
            .compare_exchange_extra(new.bits(), old.bits());
        VariableKind::from_extra(previous)
    }

    /// Returns true if `handle` is a live handle of this table.
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        handle.table() == self.id
            && self
                .slots(handle.kind())
                .slot(handle.segment(), handle.slot())
                .map_or(false, |slot| slot.is_allocated_with_tag(handle.tag()))
    }

    /// The generation of `object` is unknown here, so a store always makes the
    /// slot young again.
    fn write_barrier(slot: &Slot, object: ObjectRef) {
        if !object.is_null() {
            slot.set_age(0);
        }
    }

    fn debug_check(&self, handle: Handle) {
        debug_assert_eq!(
            handle.table(),
            self.id,
            "handle used with a table it was not allocated from"
        );
        debug_assert!(
            self.contains(handle),
            "handle used after being destroyed: {handle:?}"
        );
    }

    pub(crate) fn slot(&self, handle: Handle) -> &Slot {
        self.debug_check(handle);
        self.slots(handle.kind())
            .slot(handle.segment(), handle.slot())
            .expect("handle refers to a segment that was never allocated")
    }

    /// Iterates every live handle of `kind` in this table.
    pub(crate) fn handles(&self, kind: HandleKind) -> impl Iterator<Item = (Handle, &Slot)> + '_ {
        self.slots(kind)
            .allocated()
            .map(move |(segment, slot, tag, data)| {
                (Handle::new(self.id, kind, segment, slot, tag), data)
            })
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("id", &self.id)
            .field("heap", &self.heap)
            .field("domain", &self.domain)
            .field("handles", &self.len())
            .finish_non_exhaustive()
    }
}
