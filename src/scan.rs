use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::handle::{Handle, HandleKind, ObjectRef, VariableKind};
use crate::slots::Slot;
use crate::table::HandleTable;
use crate::Interop;

/// Options passed to [`Collector::promote`].
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct PromoteFlags(u8);

impl PromoteFlags {
    /// No special treatment.
    pub const NONE: Self = Self(0);
    /// The referent must not be relocated during this collection.
    pub const PINNED: Self = Self(1);

    /// Returns true if every flag set in `other` is also set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PromoteFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PromoteFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Self::PINNED) {
            f.write_str("PINNED")
        } else {
            f.write_str("NONE")
        }
    }
}

/// The garbage collector, as seen by the handle table while scanning.
///
/// Handles never hold the object graph themselves: every decision about
/// reachability and location is delegated to this trait.
pub trait Collector {
    /// Marks `object` reachable. A collector that evacuates during marking
    /// may update `object` to the referent's new location, unless `flags`
    /// contains [`PromoteFlags::PINNED`].
    fn promote(&mut self, object: &mut ObjectRef, context: &ScanContext, flags: PromoteFlags);

    /// Returns true if `object` survives the current collection. Objects
    /// older than the condemned generation always survive. Must answer for
    /// both the pre- and post-relocation address of a surviving object.
    fn is_promoted(&self, object: ObjectRef) -> bool;

    /// Updates `object` to the referent's post-compaction location.
    /// Referents that did not survive should be left untouched.
    fn relocate(&mut self, object: &mut ObjectRef, context: &ScanContext);

    /// Returns the approximate number of bytes kept alive by `object`.
    fn retained_size(&self, object: ObjectRef) -> usize {
        let _ = object;
        0
    }
}

/// Describes the collection a [`Collection`] belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanContext {
    /// The oldest generation being collected.
    pub condemned: u8,
    /// The oldest generation the heap has.
    pub max_generation: u8,
    /// When set, only tables belonging to this heap are scanned.
    pub heap: Option<usize>,
    /// True when the collection runs concurrently with mutators.
    pub concurrent: bool,
}

impl ScanContext {
    /// Returns a context for a collection of generations `0..=condemned`
    /// across every heap.
    #[must_use]
    pub const fn new(condemned: u8, max_generation: u8) -> Self {
        Self {
            condemned,
            max_generation,
            heap: None,
            concurrent: false,
        }
    }

    /// Returns a context for a full collection.
    #[must_use]
    pub const fn full(max_generation: u8) -> Self {
        Self::new(max_generation, max_generation)
    }

    /// Restricts the scan to the tables of `heap`.
    #[must_use]
    pub const fn for_heap(mut self, heap: usize) -> Self {
        self.heap = Some(heap);
        self
    }

    /// Marks the collection as running concurrently with mutators.
    #[must_use]
    pub const fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Returns true if every generation is being collected.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.condemned >= self.max_generation
    }

    /// Returns true if a handle of `age` takes part in this collection.
    #[must_use]
    pub const fn is_condemned(&self, age: u8) -> bool {
        self.is_full() || age <= self.condemned
    }

    pub(crate) fn includes_heap(&self, heap: usize) -> bool {
        self.heap.map_or(true, |only| only == heap)
    }
}

/// The steps of a [`Collection`], in the order they must run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CollectionPhase {
    /// The collection has started.
    Begun,
    /// Pinning roots have been reported.
    PinningRootsTraced,
    /// Strong roots have been reported.
    NormalRootsTraced,
    /// Dependent secondaries have reached a fixed point.
    DependentsPromoted,
    /// Referents have been moved to their post-compaction locations.
    PointersUpdated,
    /// Short weak handles to unreachable referents have been cleared.
    ShortWeakCleared,
    /// Long weak handles to unreachable referents have been cleared.
    LongWeakCleared,
    /// Handle ages have been updated.
    Aged,
    /// Retained size hints have been refreshed.
    SizedRefsScanned,
}

/// State for resolving dependent handles to a fixed point.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DependentHandleContext {
    passes: usize,
    promoted: usize,
    unpromoted_primaries: bool,
    bound: usize,
}

impl DependentHandleContext {
    /// Returns the number of passes run so far.
    #[must_use]
    pub const fn passes(&self) -> usize {
        self.passes
    }

    /// Returns the number of secondaries promoted so far.
    #[must_use]
    pub const fn promoted(&self) -> usize {
        self.promoted
    }

    /// Returns true if the last pass saw a primary that has not been
    /// promoted.
    #[must_use]
    pub const fn has_unpromoted_primaries(&self) -> bool {
        self.unpromoted_primaries
    }

    /// Returns the most passes a fixed point can need.
    #[must_use]
    pub const fn bound(&self) -> usize {
        self.bound
    }
}

/// An in-progress collection.
///
/// Created by [`HandleManager::begin_collection`](crate::HandleManager::begin_collection).
/// Each method is one step of the scan protocol, and the steps must be
/// called in the order they are declared. Mutators must not touch the
/// scanned tables while a collection is running.
pub struct Collection<'a> {
    tables: Vec<Arc<HandleTable>>,
    interop: &'a dyn Interop,
    context: ScanContext,
    phase: CollectionPhase,
}

impl<'a> Collection<'a> {
    pub(crate) fn begin(
        tables: Vec<Arc<HandleTable>>,
        interop: &'a dyn Interop,
        context: ScanContext,
    ) -> Self {
        let tables = tables
            .into_iter()
            .filter(|table| context.includes_heap(table.heap()))
            .collect::<Vec<_>>();
        tracing::debug!(
            condemned = context.condemned,
            max_generation = context.max_generation,
            heap = ?context.heap,
            tables = tables.len(),
            "handle scan started"
        );
        Self {
            tables,
            interop,
            context,
            phase: CollectionPhase::Begun,
        }
    }

    /// Returns the context this collection was started with.
    #[must_use]
    pub const fn context(&self) -> &ScanContext {
        &self.context
    }

    /// Returns the last step that ran.
    #[must_use]
    pub const fn phase(&self) -> CollectionPhase {
        self.phase
    }

    fn enter(&mut self, phase: CollectionPhase) {
        debug_assert!(
            self.phase <= phase,
            "{phase:?} must not run after {:?}",
            self.phase
        );
        self.phase = phase;
    }

    /// Iterates the condemned handles of `kind`.
    fn condemned(&self, kind: HandleKind) -> impl Iterator<Item = (Handle, &Slot)> + '_ {
        let context = self.context;
        self.tables
            .iter()
            .flat_map(move |table| table.handles(kind))
            .filter(move |(_, slot)| context.is_condemned(slot.age()))
    }

    fn promote_slot<C>(&self, collector: &mut C, slot: &Slot, flags: PromoteFlags) -> bool
    where
        C: Collector + ?Sized,
    {
        let mut object = slot.object();
        if object.is_null() {
            return false;
        }
        let original = object;
        collector.promote(&mut object, &self.context, flags);
        if object != original {
            slot.set_object(object);
        }
        true
    }

    /// Reports the referents of pinned, async-pinned, and pinned variable
    /// handles with [`PromoteFlags::PINNED`].
    pub fn trace_pinning_roots<C>(&mut self, collector: &mut C)
    where
        C: Collector + ?Sized,
    {
        self.enter(CollectionPhase::PinningRootsTraced);
        let mut reported = 0_usize;
        for kind in [HandleKind::Pinned, HandleKind::AsyncPinned] {
            for (_, slot) in self.condemned(kind) {
                reported += usize::from(self.promote_slot(collector, slot, PromoteFlags::PINNED));
            }
        }
        for (_, slot) in self.condemned(HandleKind::Variable) {
            if VariableKind::from_extra(slot.extra()) == VariableKind::Pinned {
                reported += usize::from(self.promote_slot(collector, slot, PromoteFlags::PINNED));
            }
        }
        tracing::debug!(reported, "traced pinning roots");
    }

    /// Reports the referents of strong, sized-ref, strong variable, and
    /// live ref-counted handles. Weak handles are never roots.
    pub fn trace_normal_roots<C>(&mut self, collector: &mut C)
    where
        C: Collector + ?Sized,
    {
        self.enter(CollectionPhase::NormalRootsTraced);
        let mut reported = 0_usize;
        for kind in [HandleKind::Strong, HandleKind::SizedRef] {
            for (_, slot) in self.condemned(kind) {
                reported += usize::from(self.promote_slot(collector, slot, PromoteFlags::NONE));
            }
        }
        for (_, slot) in self.condemned(HandleKind::Variable) {
            if VariableKind::from_extra(slot.extra()) == VariableKind::Strong {
                reported += usize::from(self.promote_slot(collector, slot, PromoteFlags::NONE));
            }
        }
        for (_, slot) in self.condemned(HandleKind::RefCounted) {
            let object = slot.object();
            if !object.is_null() && self.interop.is_ref_count_alive(object) {
                reported += usize::from(self.promote_slot(collector, slot, PromoteFlags::NONE));
            }
        }
        tracing::debug!(reported, "traced normal roots");
    }

    /// Creates the state for a dependent handle fixed point.
    #[must_use]
    pub fn dependent_handle_context(&self) -> DependentHandleContext {
        let dependents = self
            .tables
            .iter()
            .map(|table| table.count(HandleKind::Dependent))
            .sum::<usize>();
        DependentHandleContext {
            bound: dependents + 1,
            ..DependentHandleContext::default()
        }
    }

    /// Runs one pass over the dependent handles, promoting the secondary of
    /// every pair whose primary has been promoted. Returns true if any
    /// secondary was promoted, in which case another pass is needed.
    ///
    /// # Panics
    ///
    /// Debug builds panic if more passes run than there are dependent
    /// handles, which means the collector reports promotions that never
    /// stick.
    pub fn scan_dependent_handles_for_promotion<C>(
        &mut self,
        dependents: &mut DependentHandleContext,
        collector: &mut C,
    ) -> bool
    where
        C: Collector + ?Sized,
    {
        debug_assert!(
            self.phase < CollectionPhase::LongWeakCleared,
            "dependent handles promoted after long weak handles were cleared"
        );
        self.phase = self.phase.max(CollectionPhase::DependentsPromoted);
        dependents.passes += 1;
        debug_assert!(
            dependents.passes <= dependents.bound,
            "dependent handle promotion did not reach a fixed point within {} passes",
            dependents.bound
        );
        dependents.unpromoted_primaries = false;

        let mut promoted_any = false;
        for (_, slot) in self.condemned(HandleKind::Dependent) {
            let primary = slot.object();
            if primary.is_null() {
                continue;
            }
            if !collector.is_promoted(primary) {
                dependents.unpromoted_primaries = true;
                continue;
            }
            let mut secondary = ObjectRef::from_addr(slot.extra());
            if secondary.is_null() || collector.is_promoted(secondary) {
                continue;
            }
            collector.promote(&mut secondary, &self.context, PromoteFlags::NONE);
            slot.set_extra(secondary.addr());
            dependents.promoted += 1;
            promoted_any = true;
        }
        promoted_any
    }

    /// Promotes dependent secondaries until a pass promotes nothing.
    ///
    /// May run again before [`clear_long_weak_handles`](Self::clear_long_weak_handles),
    /// for example after finalization made more primaries reachable.
    pub fn promote_dependent_handles<C>(&mut self, collector: &mut C) -> DependentHandleContext
    where
        C: Collector + ?Sized,
    {
        let mut dependents = self.dependent_handle_context();
        while self.scan_dependent_handles_for_promotion(&mut dependents, collector) {}
        tracing::debug!(
            passes = dependents.passes,
            promoted = dependents.promoted,
            "dependent handles reached a fixed point"
        );
        dependents
    }

    /// Moves every referent that is allowed to move to its new location.
    pub fn update_pointers<C>(&mut self, collector: &mut C)
    where
        C: Collector + ?Sized,
    {
        self.enter(CollectionPhase::PointersUpdated);
        let mut updated = 0_usize;
        for kind in HandleKind::ALL {
            if kind.is_pinning() {
                continue;
            }
            for (_, slot) in self.condemned(kind) {
                if kind == HandleKind::Variable
                    && VariableKind::from_extra(slot.extra()) == VariableKind::Pinned
                {
                    continue;
                }
                updated += usize::from(self.relocate_object(collector, slot));
                if kind == HandleKind::Dependent {
                    let mut secondary = ObjectRef::from_addr(slot.extra());
                    if !secondary.is_null() {
                        collector.relocate(&mut secondary, &self.context);
                        slot.set_extra(secondary.addr());
                    }
                }
            }
        }
        tracing::debug!(updated, "updated handle referents");
    }

    fn relocate_object<C>(&self, collector: &mut C, slot: &Slot) -> bool
    where
        C: Collector + ?Sized,
    {
        let mut object = slot.object();
        if object.is_null() {
            return false;
        }
        let original = object;
        collector.relocate(&mut object, &self.context);
        if object != original {
            slot.set_object(object);
        }
        true
    }

    fn clear_unpromoted<C>(&self, collector: &C, slot: &Slot) -> bool
    where
        C: Collector + ?Sized,
    {
        let object = slot.object();
        if !object.is_null() && !collector.is_promoted(object) {
            slot.set_object(ObjectRef::NULL);
            true
        } else {
            false
        }
    }

    /// Clears short weak, platform weak, and short weak variable handles
    /// whose referents were not promoted. Runs before finalization, so
    /// referents waiting to be finalized are already gone.
    pub fn clear_short_weak_handles<C>(&mut self, collector: &C)
    where
        C: Collector + ?Sized,
    {
        self.enter(CollectionPhase::ShortWeakCleared);
        let mut cleared = 0_usize;
        for kind in [HandleKind::WeakShort, HandleKind::PlatformWeak] {
            for (_, slot) in self.condemned(kind) {
                cleared += usize::from(self.clear_unpromoted(collector, slot));
            }
        }
        for (_, slot) in self.condemned(HandleKind::Variable) {
            if VariableKind::from_extra(slot.extra()) == VariableKind::WeakShort {
                cleared += usize::from(self.clear_unpromoted(collector, slot));
            }
        }
        tracing::debug!(cleared, "cleared short weak handles");
    }

    /// Clears long weak, long weak variable, and ref-counted handles whose
    /// referents were not promoted, along with both halves of every
    /// dependent pair whose primary was not promoted. Runs after
    /// finalization.
    pub fn clear_long_weak_handles<C>(&mut self, collector: &C)
    where
        C: Collector + ?Sized,
    {
        debug_assert!(
            self.phase >= CollectionPhase::ShortWeakCleared,
            "long weak handles cleared before short weak handles"
        );
        self.enter(CollectionPhase::LongWeakCleared);
        let mut cleared = 0_usize;
        for kind in [HandleKind::WeakLong, HandleKind::RefCounted] {
            for (_, slot) in self.condemned(kind) {
                cleared += usize::from(self.clear_unpromoted(collector, slot));
            }
        }
        for (_, slot) in self.condemned(HandleKind::Variable) {
            if VariableKind::from_extra(slot.extra()) == VariableKind::WeakLong {
                cleared += usize::from(self.clear_unpromoted(collector, slot));
            }
        }
        for (_, slot) in self.condemned(HandleKind::Dependent) {
            if self.clear_unpromoted(collector, slot) {
                slot.set_extra(0);
                cleared += 1;
            }
        }
        tracing::debug!(cleared, "cleared long weak handles");
    }

    /// Records that the condemned handles survived a collection by moving
    /// them one generation older.
    pub fn age_handles(&mut self) {
        self.enter(CollectionPhase::Aged);
        let max_generation = self.context.max_generation;
        let aged = self.for_each_condemned(|slot| {
            slot.set_age(slot.age().saturating_add(1).min(max_generation));
        });
        tracing::debug!(aged, "aged handles");
    }

    /// Resets the condemned handles to the youngest generation after a
    /// collection that did not complete.
    pub fn rejuvenate_handles(&mut self) {
        self.enter(CollectionPhase::Aged);
        let rejuvenated = self.for_each_condemned(|slot| slot.set_age(0));
        tracing::debug!(rejuvenated, "rejuvenated handles");
    }

    fn for_each_condemned(&self, mut update: impl FnMut(&Slot)) -> usize {
        let mut visited = 0;
        for kind in HandleKind::ALL {
            for (_, slot) in self.condemned(kind) {
                update(slot);
                visited += 1;
            }
        }
        visited
    }

    /// Stores each sized-ref referent's retained size in its handle. Every
    /// sized-ref handle is refreshed, whatever its age.
    pub fn scan_sized_ref_handles<C>(&mut self, collector: &C)
    where
        C: Collector + ?Sized,
    {
        self.enter(CollectionPhase::SizedRefsScanned);
        let mut total = 0_usize;
        let sized_refs = self
            .tables
            .iter()
            .flat_map(|table| table.handles(HandleKind::SizedRef));
        for (_, slot) in sized_refs {
            let object = slot.object();
            let size = if object.is_null() {
                0
            } else {
                collector.retained_size(object)
            };
            slot.set_extra(size);
            total = total.saturating_add(size);
        }
        tracing::debug!(total, "scanned sized ref handles");
    }

    /// Finishes the collection.
    pub fn end(self) {
        tracing::debug!(phase = ?self.phase, "handle scan finished");
    }
}

impl fmt::Debug for Collection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("context", &self.context)
            .field("phase", &self.phase)
            .field("tables", &self.tables.len())
            .finish_non_exhaustive()
    }
}

/// Visits every live handle with its referent and secondary value.
pub(crate) fn scan_handles_for_profiler(
    tables: &[Arc<HandleTable>],
    mut visit: impl FnMut(Handle, ObjectRef, usize),
) {
    for table in tables {
        for kind in HandleKind::ALL {
            for (handle, slot) in table.handles(kind) {
                visit(handle, slot.object(), slot.extra());
            }
        }
    }
}

/// Visits every live dependent handle with its primary and secondary.
pub(crate) fn scan_dependent_handles_for_profiler(
    tables: &[Arc<HandleTable>],
    mut visit: impl FnMut(Handle, ObjectRef, ObjectRef),
) {
    for table in tables {
        for (handle, slot) in table.handles(HandleKind::Dependent) {
            visit(handle, slot.object(), ObjectRef::from_addr(slot.extra()));
        }
    }
}

#[test]
fn condemned_ages() {
    let young = ScanContext::new(0, 2);
    assert!(young.is_condemned(0));
    assert!(!young.is_condemned(1));
    let middle = ScanContext::new(1, 2);
    assert!(middle.is_condemned(1));
    assert!(!middle.is_condemned(2));
    let full = ScanContext::full(2);
    assert!(full.is_full());
    assert!(full.is_condemned(2));
    assert!(full.is_condemned(200));
}

#[test]
fn heap_filter() {
    let context = ScanContext::full(2).for_heap(3);
    assert!(context.includes_heap(3));
    assert!(!context.includes_heap(0));
    assert!(ScanContext::full(2).includes_heap(7));
}

#[test]
fn promote_flags() {
    assert!(PromoteFlags::PINNED.contains(PromoteFlags::NONE));
    assert!(!PromoteFlags::NONE.contains(PromoteFlags::PINNED));
    assert!((PromoteFlags::NONE | PromoteFlags::PINNED).contains(PromoteFlags::PINNED));
}
