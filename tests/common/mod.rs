//! A small compacting, generational heap that drives handle scans the way a
//! real collector would.
//!
//! Objects live at addresses that are never reused. Every collection moves
//! each surviving, unpinned object in the condemned generations to a fresh
//! address, which makes stale handle referents easy to detect.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use tether::{
    Collector, DependentHandleContext, HandleManager, ObjectRef, PromoteFlags, ScanContext,
};

pub const MAX_GENERATION: u8 = 2;
const OBJECT_ALIGN: usize = 0x10;

#[derive(Clone, Debug)]
struct Object {
    id: usize,
    size: usize,
    generation: u8,
    fields: Vec<ObjectRef>,
    finalizable: bool,
}

/// What happened during a [`Heap::collect`].
#[derive(Debug, Default)]
pub struct CollectionReport {
    pub dependents: DependentHandleContext,
    pub finalized: Vec<usize>,
    pub moved: usize,
    pub freed: usize,
}

pub struct Heap {
    objects: HashMap<usize, Object>,
    next_addr: usize,
    next_id: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_addr: 0x1000,
            next_id: 1,
        }
    }

    fn fresh_addr(&mut self, size: usize) -> usize {
        let addr = self.next_addr;
        self.next_addr += size.max(1).next_multiple_of(OBJECT_ALIGN);
        addr
    }

    pub fn alloc(&mut self) -> ObjectRef {
        self.alloc_with(OBJECT_ALIGN, &[])
    }

    pub fn alloc_with(&mut self, size: usize, fields: &[ObjectRef]) -> ObjectRef {
        let addr = self.fresh_addr(size);
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(
            addr,
            Object {
                id,
                size,
                generation: 0,
                fields: fields.to_vec(),
                finalizable: false,
            },
        );
        ObjectRef::from_addr(addr)
    }

    pub fn set_finalizable(&mut self, object: ObjectRef) {
        self.object_mut(object).finalizable = true;
    }

    pub fn set_fields(&mut self, object: ObjectRef, fields: &[ObjectRef]) {
        self.object_mut(object).fields = fields.to_vec();
    }

    fn object_mut(&mut self, object: ObjectRef) -> &mut Object {
        self.objects
            .get_mut(&object.addr())
            .expect("object is not alive")
    }

    pub fn is_alive(&self, object: ObjectRef) -> bool {
        self.objects.contains_key(&object.addr())
    }

    /// Returns the identity of the object at `object`, which stays the same
    /// when the object moves.
    pub fn id(&self, object: ObjectRef) -> Option<usize> {
        self.objects.get(&object.addr()).map(|object| object.id)
    }

    pub fn generation(&self, object: ObjectRef) -> Option<u8> {
        self.objects.get(&object.addr()).map(|object| object.generation)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Runs every step of a collection of generations `0..=condemned`.
    pub fn collect(&mut self, manager: &HandleManager, condemned: u8) -> CollectionReport {
        self.collect_with(manager, ScanContext::new(condemned, MAX_GENERATION))
    }

    pub fn collect_with(&mut self, manager: &HandleManager, context: ScanContext) -> CollectionReport {
        let mut marker = Marker::new(self, context);
        let mut collection = manager.begin_collection(context);
        collection.trace_pinning_roots(&mut marker);
        collection.trace_normal_roots(&mut marker);
        let mut dependents = collection.promote_dependent_handles(&mut marker);
        marker.plan();
        collection.update_pointers(&mut marker);
        collection.clear_short_weak_handles(&marker);
        let finalized = marker.run_finalizers();
        if !finalized.is_empty() {
            dependents = collection.promote_dependent_handles(&mut marker);
        }
        collection.clear_long_weak_handles(&marker);
        collection.age_handles();
        collection.scan_sized_ref_handles(&marker);
        collection.end();

        let plan = marker.into_plan();
        let (moved, freed) = self.apply(plan, context);
        CollectionReport {
            dependents,
            finalized,
            moved,
            freed,
        }
    }

    fn apply(&mut self, plan: Plan, context: ScanContext) -> (usize, usize) {
        let mut objects = HashMap::with_capacity(self.objects.len());
        let mut moved = 0;
        let mut freed = 0;
        for (addr, mut object) in std::mem::take(&mut self.objects) {
            if object.generation > context.condemned && !context.is_full() {
                objects.insert(addr, object);
                continue;
            }
            if !plan.marked.contains(&addr) {
                freed += 1;
                continue;
            }
            if plan.finalized.contains(&addr) {
                object.finalizable = false;
            }
            object.generation = (object.generation + 1).min(context.max_generation);
            let destination = plan.forwarding.get(&addr).copied().unwrap_or(addr);
            if destination != addr {
                moved += 1;
            }
            objects.insert(destination, object);
        }
        for object in objects.values_mut() {
            for field in &mut object.fields {
                if let Some(destination) = plan.forwarding.get(&field.addr()) {
                    *field = ObjectRef::from_addr(*destination);
                }
            }
        }
        self.objects = objects;
        self.next_addr = plan.next_addr;
        (moved, freed)
    }
}

struct Plan {
    next_addr: usize,
    marked: HashSet<usize>,
    forwarding: HashMap<usize, usize>,
    finalized: HashSet<usize>,
}

/// The collector half of the mock: marks during tracing, then assigns new
/// addresses to everything marked and not pinned.
pub struct Marker<'a> {
    heap: &'a Heap,
    context: ScanContext,
    marked: HashSet<usize>,
    pinned: HashSet<usize>,
    forwarding: HashMap<usize, usize>,
    relocated: HashMap<usize, usize>,
    finalized: HashSet<usize>,
    planned: bool,
    next_addr: usize,
}

impl<'a> Marker<'a> {
    fn new(heap: &'a Heap, context: ScanContext) -> Self {
        Self {
            heap,
            context,
            marked: HashSet::new(),
            pinned: HashSet::new(),
            forwarding: HashMap::new(),
            relocated: HashMap::new(),
            finalized: HashSet::new(),
            planned: false,
            next_addr: heap.next_addr,
        }
    }

    fn is_condemned(&self, object: &Object) -> bool {
        self.context.is_full() || object.generation <= self.context.condemned
    }

    fn mark(&mut self, addr: usize) {
        let heap = self.heap;
        let mut stack = vec![addr];
        while let Some(addr) = stack.pop() {
            let Some(object) = heap.objects.get(&addr) else {
                continue;
            };
            if !self.is_condemned(object) || !self.marked.insert(addr) {
                continue;
            }
            stack.extend(object.fields.iter().filter(|f| !f.is_null()).map(|f| f.addr()));
        }
    }

    /// Objects marked after planning stay where they are.
    fn plan(&mut self) {
        let mut marked = self.marked.iter().copied().collect::<Vec<_>>();
        marked.sort_unstable();
        for addr in marked {
            if self.pinned.contains(&addr) {
                continue;
            }
            let size = self.heap.objects[&addr].size;
            let destination = self.next_addr;
            self.next_addr += size.max(1).next_multiple_of(OBJECT_ALIGN);
            self.forwarding.insert(addr, destination);
            self.relocated.insert(destination, addr);
        }
        self.planned = true;
    }

    /// Resurrects unreachable finalizable objects, returning their ids.
    fn run_finalizers(&mut self) -> Vec<usize> {
        let mut pending = self
            .heap
            .objects
            .iter()
            .filter(|(addr, object)| {
                object.finalizable && self.is_condemned(object) && !self.marked.contains(*addr)
            })
            .map(|(addr, object)| (*addr, object.id))
            .collect::<Vec<_>>();
        pending.sort_unstable();
        for (addr, _) in &pending {
            self.finalized.insert(*addr);
            self.mark(*addr);
        }
        pending.into_iter().map(|(_, id)| id).collect()
    }

    fn into_plan(self) -> Plan {
        Plan {
            next_addr: self.next_addr,
            marked: self.marked,
            forwarding: self.forwarding,
            finalized: self.finalized,
        }
    }

    fn original(&self, addr: usize) -> usize {
        self.relocated.get(&addr).copied().unwrap_or(addr)
    }

    fn retained(&self, addr: usize, seen: &mut HashSet<usize>) -> usize {
        let addr = self.original(addr);
        if !seen.insert(addr) {
            return 0;
        }
        let Some(object) = self.heap.objects.get(&addr) else {
            return 0;
        };
        object.size
            + object
                .fields
                .iter()
                .filter(|field| !field.is_null())
                .map(|field| self.retained(field.addr(), seen))
                .sum::<usize>()
    }
}

impl Collector for Marker<'_> {
    fn promote(&mut self, object: &mut ObjectRef, _context: &ScanContext, flags: PromoteFlags) {
        let addr = self.original(object.addr());
        if flags.contains(PromoteFlags::PINNED) {
            assert!(!self.planned, "pinning after relocation was planned");
            self.pinned.insert(addr);
        }
        self.mark(addr);
    }

    fn is_promoted(&self, object: ObjectRef) -> bool {
        let addr = self.original(object.addr());
        match self.heap.objects.get(&addr) {
            Some(found) => !self.is_condemned(found) || self.marked.contains(&addr),
            None => false,
        }
    }

    fn relocate(&mut self, object: &mut ObjectRef, _context: &ScanContext) {
        if let Some(destination) = self.forwarding.get(&object.addr()) {
            *object = ObjectRef::from_addr(*destination);
        }
    }

    fn retained_size(&self, object: ObjectRef) -> usize {
        self.retained(object.addr(), &mut HashSet::new())
    }
}

/// Promotes every referent it is shown, recording them in order.
#[derive(Debug, Default)]
pub struct Recorder {
    pub promoted: Vec<ObjectRef>,
    pub pinned: Vec<ObjectRef>,
}

impl Collector for Recorder {
    fn promote(&mut self, object: &mut ObjectRef, _context: &ScanContext, flags: PromoteFlags) {
        if flags.contains(PromoteFlags::PINNED) {
            self.pinned.push(*object);
        } else {
            self.promoted.push(*object);
        }
    }

    fn is_promoted(&self, object: ObjectRef) -> bool {
        self.promoted.contains(&object) || self.pinned.contains(&object)
    }

    fn relocate(&mut self, _object: &mut ObjectRef, _context: &ScanContext) {}
}
