use std::fmt;
use std::num::{NonZeroU64, NonZeroUsize};

use intentional::Cast;

use crate::HandleError;

/// The address of a managed object, as understood by the collector.
///
/// The handle table never dereferences an `ObjectRef`. It only stores it,
/// hands it to the [`Collector`](crate::Collector) during scans, and clears
/// it when a weak handle's referent dies.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// The null reference.
    pub const NULL: Self = Self(0);

    /// Returns a reference to the object located at `addr`.
    #[must_use]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the address of the referenced object.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Returns true if this reference is [`ObjectRef::NULL`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// An opaque value owned by interop code and stored alongside a
/// [`HandleKind::PlatformWeak`] handle.
///
/// The handle table releases it through
/// [`Interop::release_weak_reference`](crate::Interop::release_weak_reference)
/// when the handle is destroyed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ExternalRef(NonZeroUsize);

impl ExternalRef {
    /// Wraps an interop cookie.
    #[must_use]
    pub const fn new(cookie: NonZeroUsize) -> Self {
        Self(cookie)
    }

    /// Returns the wrapped cookie.
    #[must_use]
    pub const fn get(self) -> NonZeroUsize {
        self.0
    }

    pub(crate) fn from_extra(extra: usize) -> Option<Self> {
        NonZeroUsize::new(extra).map(Self)
    }
}

/// The liveness policy of a handle.
///
/// The discriminants match the numbering interop callers expect.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum HandleKind {
    /// Cleared as soon as the referent is unreachable, even if the referent
    /// is waiting to be finalized.
    WeakShort = 0,
    /// Cleared only once the referent has been finalized.
    WeakLong = 1,
    /// Keeps the referent alive.
    Strong = 2,
    /// Keeps the referent alive and prevents it from being relocated.
    Pinned = 3,
    /// A handle whose strength can change at runtime. See [`VariableKind`].
    Variable = 4,
    /// Strong while interop reports a live reference count, long weak
    /// otherwise.
    RefCounted = 5,
    /// A primary/secondary pair: the secondary lives as long as the primary.
    Dependent = 6,
    /// Pinned, and movable between buckets as a group.
    AsyncPinned = 7,
    /// Strong, carrying an estimate of the referent's retained size.
    SizedRef = 8,
    /// Short weak, carrying an external weak reference released on destroy.
    PlatformWeak = 9,
}

impl HandleKind {
    /// The number of handle kinds.
    pub const COUNT: usize = 10;
    /// Every handle kind, in discriminant order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::WeakShort,
        Self::WeakLong,
        Self::Strong,
        Self::Pinned,
        Self::Variable,
        Self::RefCounted,
        Self::Dependent,
        Self::AsyncPinned,
        Self::SizedRef,
        Self::PlatformWeak,
    ];
    /// The kind created by default.
    pub const DEFAULT: Self = Self::Strong;
    /// The kind created when a "weak" handle is requested without a strength.
    pub const WEAK_DEFAULT: Self = Self::WeakLong;

    const fn from_bits(bits: u8) -> Option<Self> {
        if (bits as usize) < Self::COUNT {
            Some(Self::ALL[bits as usize])
        } else {
            None
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    /// Returns true for kinds whose referents may never be relocated.
    #[must_use]
    pub const fn is_pinning(self) -> bool {
        matches!(self, Self::Pinned | Self::AsyncPinned)
    }
}

/// The current strength of a [`HandleKind::Variable`] handle.
///
/// The bit values stay clear of the low byte so that they can never be
/// confused with a [`HandleKind`] discriminant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum VariableKind {
    /// Behaves like [`HandleKind::WeakShort`].
    WeakShort = 0x100,
    /// Behaves like [`HandleKind::WeakLong`].
    WeakLong = 0x200,
    /// Behaves like [`HandleKind::Strong`].
    Strong = 0x400,
    /// Behaves like [`HandleKind::Pinned`].
    Pinned = 0x800,
}

impl VariableKind {
    pub(crate) const fn bits(self) -> usize {
        self as usize
    }

    pub(crate) fn from_extra(extra: usize) -> Self {
        u32::try_from(extra)
            .ok()
            .and_then(|bits| Self::try_from(bits).ok())
            .expect("variable handle holds an invalid strength")
    }
}

impl TryFrom<u32> for VariableKind {
    type Error = HandleError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x100 => Ok(Self::WeakShort),
            0x200 => Ok(Self::WeakLong),
            0x400 => Ok(Self::Strong),
            0x800 => Ok(Self::Pinned),
            other => Err(HandleError::InvalidVariableKind(other)),
        }
    }
}

/// Identifies a [`HandleTable`](crate::HandleTable).
///
/// An id is made of a 20-bit index and a 4-bit reuse count. Indexes are
/// recycled once their table is destroyed, and each reuse bumps the count so
/// that handles into the destroyed table no longer resolve.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableId(u32);

impl TableId {
    /// Table indexes are packed into 20 bits of a [`Handle`]. Zero is
    /// reserved so that a handle is never zero.
    pub(crate) const LIMIT: u32 = 1 << 20;
    const REUSE_MASK: u32 = 0xF;

    pub(crate) const fn new(index: u32) -> Self {
        assert!(index > 0 && index < Self::LIMIT);
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        (self.0 & (Self::LIMIT - 1)).cast::<usize>()
    }

    pub(crate) const fn reuse(self) -> u32 {
        self.0 >> 20
    }

    /// Returns the id the next table at this index receives.
    pub(crate) const fn recycled(self) -> Self {
        Self(((self.reuse() + 1) & Self::REUSE_MASK) << 20 | (self.0 & (Self::LIMIT - 1)))
    }
}

/// A stable, opaque reference to one slot in a handle table.
///
/// A handle packs, from the least significant bit: the slot index (8 bits),
/// the segment index (16 bits), the [`HandleKind`] (4 bits), a reuse tag (12
/// bits), and the [`TableId`] (24 bits). The tag changes every time the slot
/// is reused, which lets debug builds catch use of a destroyed handle.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    const SEGMENT_OFFSET: u32 = 8;
    const KIND_OFFSET: u32 = 24;
    const TAG_OFFSET: u32 = 28;
    const TABLE_OFFSET: u32 = 40;
    pub(crate) const SEGMENT_LIMIT: u32 = 1 << 16;
    pub(crate) const TAG_MASK: u16 = 0xFFF;

    pub(crate) fn new(table: TableId, kind: HandleKind, segment: u32, slot: u8, tag: u16) -> Self {
        debug_assert!(segment < Self::SEGMENT_LIMIT);
        let bits = u64::from(slot)
            | u64::from(segment) << Self::SEGMENT_OFFSET
            | u64::from(kind as u8) << Self::KIND_OFFSET
            | u64::from(tag & Self::TAG_MASK) << Self::TAG_OFFSET
            | u64::from(table.0) << Self::TABLE_OFFSET;
        Self(NonZeroU64::new(bits).expect("table ids are never zero"))
    }

    /// Reconstructs a handle previously converted with [`Handle::to_bits`].
    ///
    /// Returns `None` if `bits` could never have been produced by a handle.
    /// A `Some` result is not necessarily a live handle.
    #[must_use]
    pub fn from_bits(bits: u64) -> Option<Self> {
        let bits = NonZeroU64::new(bits)?;
        let handle = Self(bits);
        (handle.table().index() != 0
            && HandleKind::from_bits(handle.kind_bits()).is_some())
        .then_some(handle)
    }

    /// Returns the raw bits of this handle, suitable for passing through
    /// native code.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0.get()
    }

    /// Returns the table this handle was allocated from.
    #[must_use]
    pub fn table(self) -> TableId {
        TableId((self.0.get() >> Self::TABLE_OFFSET) as u32)
    }

    /// Returns the kind this handle was created with.
    #[must_use]
    pub fn kind(self) -> HandleKind {
        HandleKind::from_bits(self.kind_bits()).expect("handles always contain a valid kind")
    }

    fn kind_bits(self) -> u8 {
        ((self.0.get() >> Self::KIND_OFFSET) & 0xF) as u8
    }

    pub(crate) fn segment(self) -> u32 {
        ((self.0.get() >> Self::SEGMENT_OFFSET) as u32) & (Self::SEGMENT_LIMIT - 1)
    }

    pub(crate) fn slot(self) -> u8 {
        self.0.get() as u8
    }

    pub(crate) fn tag(self) -> u16 {
        ((self.0.get() >> Self::TAG_OFFSET) as u16) & Self::TAG_MASK
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("table", &self.table().0)
            .field("kind", &self.kind())
            .field("segment", &self.segment())
            .field("slot", &self.slot())
            .field("tag", &self.tag())
            .finish()
    }
}

#[test]
fn handle_packing() {
    let table = TableId::new(0xF_FFFF).recycled().recycled();
    let handle = Handle::new(table, HandleKind::PlatformWeak, 0xBCDE, 0x42, 0xFFF);
    assert_eq!(handle.table(), table);
    assert_eq!(handle.table().index(), 0xF_FFFF);
    assert_eq!(handle.kind(), HandleKind::PlatformWeak);
    assert_eq!(handle.segment(), 0xBCDE);
    assert_eq!(handle.slot(), 0x42);
    assert_eq!(handle.tag(), 0xFFF);
    assert_eq!(Handle::from_bits(handle.to_bits()), Some(handle));
}

#[test]
fn invalid_handle_bits() {
    assert_eq!(Handle::from_bits(0), None);
    // No table id.
    assert_eq!(Handle::from_bits(0x42), None);
    // Kind 15 does not exist.
    assert_eq!(Handle::from_bits(1 << 40 | 0xF << 24), None);
    // A reuse count without a table index.
    assert_eq!(Handle::from_bits(1 << 60 | 2 << 24), None);
}

#[test]
fn variable_kind_rejects_unknown_bits() {
    assert_eq!(VariableKind::try_from(0x400), Ok(VariableKind::Strong));
    assert_eq!(
        VariableKind::try_from(0x2),
        Err(HandleError::InvalidVariableKind(0x2))
    );
    assert_eq!(
        VariableKind::try_from(0x300),
        Err(HandleError::InvalidVariableKind(0x300))
    );
}

#[test]
fn recycled_table_ids_differ() {
    let id = TableId::new(7);
    let recycled = id.recycled();
    assert_ne!(recycled, id);
    assert_eq!(recycled.index(), 7);
    assert_eq!(recycled.reuse(), 1);
    let wrapped = (0..16).fold(id, |id, _| id.recycled());
    assert_eq!(wrapped, id);
}
