use std::alloc::Layout;
use std::array;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::Backoff;
use intentional::Cast;
use parking_lot::Mutex;

use crate::handle::{Handle, HandleKind, ObjectRef};
use crate::HandleError;

/// The number of slots in each [`Segment`].
pub(crate) const SLOTS_PER_SEGMENT: usize = 256;
const SEGMENTS_PER_BLOCK: usize = 64;

/// Provides the memory that slot segments live in.
///
/// Implementations may fail, in which case handle creation reports
/// [`HandleError::OutOfMemory`]. Returned memory does not need to be zeroed.
pub trait SegmentAllocator: Send + Sync {
    /// Allocates memory matching `layout`, or returns `None` if the request
    /// cannot be satisfied.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Frees memory previously returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.allocate(layout)` with the same
    /// `layout`, and must not be freed more than once.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A [`SegmentAllocator`] backed by the global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl SegmentAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: Segments are never zero-sized.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// The packed state of a slot: an allocated flag, a 12-bit reuse tag, and
/// the handle's age.
struct SlotState(AtomicU32);

impl SlotState {
    const AGE_MASK: u32 = 0xFF;
    const ALLOCATED: u32 = 1 << 31;
    const TAG_OFFSET: u32 = 16;

    const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    fn tag_of(state: u32) -> u16 {
        (state >> Self::TAG_OFFSET) as u16 & Handle::TAG_MASK
    }

    fn tag(&self) -> Option<u16> {
        let state = self.0.load(Ordering::Acquire);
        (state & Self::ALLOCATED != 0).then(|| Self::tag_of(state))
    }

    fn allocated_with_tag(&self, tag: u16) -> bool {
        self.tag() == Some(tag)
    }

    /// Marks a free slot as allocated and returns its new tag. The caller
    /// must own the slot, which is true after popping it from a free list or
    /// bumping past it.
    fn allocate(&self) -> u16 {
        let state = self.0.load(Ordering::Acquire);
        debug_assert_eq!(state & Self::ALLOCATED, 0, "slot allocated twice");
        let tag = Self::tag_of(state).wrapping_add(1) & Handle::TAG_MASK;
        self.0.store(
            Self::ALLOCATED | u32::from(tag) << Self::TAG_OFFSET,
            Ordering::Release,
        );
        tag
    }

    fn free(&self, tag: u16) -> bool {
        let allocated = Self::ALLOCATED | u32::from(tag) << Self::TAG_OFFSET;
        self.0
            .fetch_update(Ordering::Release, Ordering::Acquire, |state| {
                (state & !Self::AGE_MASK == allocated).then_some(u32::from(tag) << Self::TAG_OFFSET)
            })
            .is_ok()
    }

    fn age(&self) -> u8 {
        (self.0.load(Ordering::Acquire) & Self::AGE_MASK) as u8
    }

    fn set_age(&self, age: u8) {
        let _result = self
            .0
            .fetch_update(Ordering::Release, Ordering::Acquire, |state| {
                (state & Self::ALLOCATED != 0)
                    .then_some(state & !Self::AGE_MASK | u32::from(age))
            });
    }
}

/// One handle's storage.
pub(crate) struct Slot {
    object: AtomicUsize,
    extra: AtomicUsize,
    state: SlotState,
    next_free: AtomicU32,
}

impl Slot {
    const fn new() -> Self {
        Self {
            object: AtomicUsize::new(0),
            extra: AtomicUsize::new(0),
            state: SlotState::new(),
            next_free: AtomicU32::new(0),
        }
    }

    pub fn object(&self) -> ObjectRef {
        ObjectRef::from_addr(self.object.load(Ordering::Acquire))
    }

    pub fn set_object(&self, object: ObjectRef) {
        self.object.store(object.addr(), Ordering::Release);
    }

    pub fn compare_exchange_object(&self, new: ObjectRef, comparand: ObjectRef) -> ObjectRef {
        match self.object.compare_exchange(
            comparand.addr(),
            new.addr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(previous) | Err(previous) => ObjectRef::from_addr(previous),
        }
    }

    pub fn extra(&self) -> usize {
        self.extra.load(Ordering::Acquire)
    }

    pub fn set_extra(&self, extra: usize) {
        self.extra.store(extra, Ordering::Release);
    }

    pub fn compare_exchange_extra(&self, new: usize, comparand: usize) -> usize {
        match self
            .extra
            .compare_exchange(comparand, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    pub fn is_allocated_with_tag(&self, tag: u16) -> bool {
        self.state.allocated_with_tag(tag)
    }

    pub fn age(&self) -> u8 {
        self.state.age()
    }

    pub fn set_age(&self, age: u8) {
        self.state.set_age(age);
    }
}

/// A fixed block of slots with its own free list.
///
/// Slots are handed out by popping the free list first, then by bumping
/// `high_water`. Slots at or above `high_water` have never been allocated.
pub(crate) struct Segment {
    slots: [Slot; SLOTS_PER_SEGMENT],
    high_water: AtomicU16,
    /// The upper 32 bits are an ABA tag; the lower 32 bits are the index of
    /// the first free slot plus one, or zero when the list is empty.
    free_head: AtomicU64,
}

impl Segment {
    fn new() -> Self {
        Self {
            slots: array::from_fn(|_| Slot::new()),
            high_water: AtomicU16::new(0),
            free_head: AtomicU64::new(0),
        }
    }

    fn pack_head(tag: u32, index: u32) -> u64 {
        u64::from(tag) << 32 | u64::from(index)
    }

    fn try_allocate(&self) -> Option<u8> {
        self.pop_free().or_else(|| {
            self.high_water
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |high_water| {
                    (usize::from(high_water) < SLOTS_PER_SEGMENT).then_some(high_water + 1)
                })
                .ok()
                .map(|index| index as u8)
        })
    }

    fn pop_free(&self) -> Option<u8> {
        let backoff = Backoff::new();
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            let first = head as u32;
            if first == 0 {
                return None;
            }
            let index = first - 1;
            let next = self.slots[index.cast::<usize>()]
                .next_free
                .load(Ordering::Acquire);
            let tag = ((head >> 32) as u32).wrapping_add(1);
            if self
                .free_head
                .compare_exchange_weak(
                    head,
                    Self::pack_head(tag, next),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(index as u8);
            }
            backoff.spin();
        }
    }

    fn push_free(&self, index: u8) {
        let backoff = Backoff::new();
        let slot = &self.slots[usize::from(index)];
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            slot.next_free.store(head as u32, Ordering::Release);
            let tag = ((head >> 32) as u32).wrapping_add(1);
            if self
                .free_head
                .compare_exchange_weak(
                    head,
                    Self::pack_head(tag, u32::from(index) + 1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    pub fn slot(&self, index: u8) -> &Slot {
        &self.slots[usize::from(index)]
    }

    /// Iterates the allocated slots of this segment along with their index
    /// and tag.
    pub fn allocated(&self) -> impl Iterator<Item = (u8, u16, &Slot)> + '_ {
        let high_water = usize::from(self.high_water.load(Ordering::Acquire));
        self.slots[..high_water]
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.state.tag().map(|tag| (index as u8, tag, slot)))
    }
}

/// Owns a [`Segment`] living in memory from a [`SegmentAllocator`].
struct SegmentBox {
    segment: NonNull<Segment>,
    allocator: Arc<dyn SegmentAllocator>,
}

impl SegmentBox {
    fn new(allocator: &Arc<dyn SegmentAllocator>) -> Option<Self> {
        let memory = allocator.allocate(Layout::new::<Segment>())?;
        let segment = memory.cast::<Segment>();
        // SAFETY: The allocator returned memory with `Segment`'s layout. The
        // memory may be uninitialized, which is why the whole segment is
        // written rather than assigned field by field.
        unsafe { segment.as_ptr().write(Segment::new()) };
        Some(Self {
            segment,
            allocator: allocator.clone(),
        })
    }
}

impl Deref for SegmentBox {
    type Target = Segment;

    fn deref(&self) -> &Self::Target {
        // SAFETY: `segment` was initialized in `new()` and is only freed when
        // this box is dropped.
        unsafe { self.segment.as_ref() }
    }
}

impl Drop for SegmentBox {
    fn drop(&mut self) {
        // SAFETY: The segment was allocated from `allocator` with this layout
        // and is exclusively owned by this box.
        unsafe {
            self.segment.as_ptr().drop_in_place();
            self.allocator
                .free(self.segment.cast(), Layout::new::<Segment>());
        }
    }
}

// SAFETY: `Segment` only contains atomics, and `SegmentBox` uniquely owns the
// allocation it points to.
unsafe impl Send for SegmentBox {}
// SAFETY: All access to the segment is through shared references to atomics.
unsafe impl Sync for SegmentBox {}

struct SegmentBlock {
    segments: [OnceLock<SegmentBox>; SEGMENTS_PER_BLOCK],
    next: OnceLock<Box<SegmentBlock>>,
}

impl SegmentBlock {
    fn new() -> Self {
        Self {
            segments: array::from_fn(|_| OnceLock::new()),
            next: OnceLock::new(),
        }
    }
}

/// A growable set of segments holding handles of a single kind.
///
/// Allocation and freeing are lock-free. Adding a segment takes
/// `grow_lock`, which is held only while the new segment is published.
pub(crate) struct SlotStore {
    kind: HandleKind,
    blocks: SegmentBlock,
    segment_count: AtomicUsize,
    first_available: AtomicUsize,
    live: AtomicUsize,
    grow_lock: Mutex<()>,
    max_segments: usize,
    allocator: Arc<dyn SegmentAllocator>,
}

impl SlotStore {
    pub fn new(kind: HandleKind, max_segments: usize, allocator: Arc<dyn SegmentAllocator>) -> Self {
        Self {
            kind,
            blocks: SegmentBlock::new(),
            segment_count: AtomicUsize::new(0),
            first_available: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            max_segments: max_segments.min(Handle::SEGMENT_LIMIT.cast::<usize>()),
            allocator,
        }
    }

    /// Returns the number of allocated slots.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count.load(Ordering::Acquire)
    }

    pub fn segment(&self, index: u32) -> Option<&Segment> {
        let mut index = index.cast::<usize>();
        if index >= self.segment_count() {
            return None;
        }
        let mut block = &self.blocks;
        while index >= SEGMENTS_PER_BLOCK {
            block = block.next.get()?;
            index -= SEGMENTS_PER_BLOCK;
        }
        block.segments[index].get().map(|segment| &**segment)
    }

    /// Returns the slot at the given location, regardless of whether it is
    /// allocated.
    pub fn slot(&self, segment: u32, slot: u8) -> Option<&Slot> {
        self.segment(segment).map(|segment| segment.slot(slot))
    }

    /// Allocates a slot, initializes it with `object` and `extra`, and
    /// returns its segment index, slot index, and tag.
    pub fn allocate(&self, object: ObjectRef, extra: usize) -> Result<(u32, u8, u16), HandleError> {
        loop {
            let count = self.segment_count();
            let start = self.first_available.load(Ordering::Relaxed).min(count);
            for index in (start..count).chain(0..start) {
                let segment_index = index as u32;
                let Some(segment) = self.segment(segment_index) else {
                    continue;
                };
                if let Some(slot_index) = segment.try_allocate() {
                    if index != start {
                        self.first_available.store(index, Ordering::Relaxed);
                    }
                    let slot = segment.slot(slot_index);
                    slot.set_object(object);
                    slot.set_extra(extra);
                    let tag = slot.state.allocate();
                    self.live.fetch_add(1, Ordering::AcqRel);
                    return Ok((segment_index, slot_index, tag));
                }
            }

            self.grow(count)?;
        }
    }

    /// Adds a segment unless another thread already did since `observed`
    /// segments were seen.
    fn grow(&self, observed: usize) -> Result<(), HandleError> {
        let _guard = self.grow_lock.lock();
        let count = self.segment_count();
        if count != observed {
            return Ok(());
        }
        if count >= self.max_segments {
            tracing::warn!(kind = ?self.kind, segments = count, "handle segment limit reached");
            return Err(HandleError::OutOfMemory {
                kind: self.kind,
                segments: count,
            });
        }

        let mut block = &self.blocks;
        let mut index = count;
        while index >= SEGMENTS_PER_BLOCK {
            block = block.next.get_or_init(|| Box::new(SegmentBlock::new()));
            index -= SEGMENTS_PER_BLOCK;
        }
        let Some(segment) = SegmentBox::new(&self.allocator) else {
            tracing::warn!(kind = ?self.kind, segments = count, "handle segment allocation failed");
            return Err(HandleError::OutOfMemory {
                kind: self.kind,
                segments: count,
            });
        };
        if block.segments[index].set(segment).is_err() {
            unreachable!("segments are only published while holding the grow lock");
        }
        self.first_available.store(count, Ordering::Relaxed);
        self.segment_count.store(count + 1, Ordering::Release);
        tracing::trace!(kind = ?self.kind, segments = count + 1, "added handle segment");
        Ok(())
    }

    /// Returns a slot to its segment's free list.
    pub fn free(&self, segment_index: u32, slot_index: u8, tag: u16) {
        let segment = self
            .segment(segment_index)
            .expect("handle refers to a segment that was never allocated");
        let slot = segment.slot(slot_index);
        let freed = slot.state.free(tag);
        debug_assert!(freed, "{:?} handle freed twice or with a stale tag", self.kind);
        if !freed {
            return;
        }
        slot.set_object(ObjectRef::NULL);
        slot.set_extra(0);
        segment.push_free(slot_index);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.first_available
            .fetch_min(segment_index.cast::<usize>(), Ordering::Relaxed);
    }

    /// Iterates every allocated slot in this store.
    pub fn allocated(&self) -> impl Iterator<Item = (u32, u8, u16, &Slot)> + '_ {
        (0..self.segment_count() as u32).flat_map(move |segment_index| {
            self.segment(segment_index)
                .into_iter()
                .flat_map(move |segment| {
                    segment
                        .allocated()
                        .map(move |(slot, tag, data)| (segment_index, slot, tag, data))
                })
        })
    }
}
