mod common;

use common::{Heap, Recorder, MAX_GENERATION};
use tether::{HandleKind, HandleManager, HandleTableConfig, ObjectRef, ScanContext};

fn manager() -> HandleManager {
    HandleManager::new(HandleTableConfig::workstation()).unwrap()
}

#[test]
fn chain_needs_one_pass_per_link() {
    let manager = manager();
    let bucket = manager.default_bucket().unwrap();
    let table = bucket.table(0);
    let mut heap = Heap::new();

    let [a, b, c, d] = [heap.alloc(), heap.alloc(), heap.alloc(), heap.alloc()];
    let ids = [a, b, c, d].map(|object| heap.id(object).unwrap());
    // Created back to front so that each pass only discovers one link.
    let cd = manager.create_dependent_handle(table, c, d).unwrap();
    let bc = manager.create_dependent_handle(table, b, c).unwrap();
    let ab = manager.create_dependent_handle(table, a, b).unwrap();
    let root = manager.create_strong_handle(table, a).unwrap();

    let report = heap.collect(&manager, MAX_GENERATION);
    assert_eq!(report.dependents.promoted(), 3);
    assert_eq!(report.dependents.passes(), 4);
    assert!(report.dependents.passes() <= report.dependents.bound());
    assert_eq!(heap.len(), 4);

    for (handle, primary, secondary) in [(ab, 0, 1), (bc, 1, 2), (cd, 2, 3)] {
        assert_eq!(heap.id(manager.fetch(handle)), Some(ids[primary]));
        assert_eq!(
            heap.id(manager.dependent_secondary(handle)),
            Some(ids[secondary])
        );
    }
    assert_eq!(manager.fetch(root), manager.fetch(ab));
}

#[test]
fn manual_fixed_point() {
    let manager = manager();
    let bucket = manager.default_bucket().unwrap();
    let table = bucket.table(0);
    let [a, b, c, d] = [0x10, 0x20, 0x30, 0x40].map(ObjectRef::from_addr);
    manager.create_dependent_handle(table, c, d).unwrap();
    manager.create_dependent_handle(table, b, c).unwrap();
    manager.create_dependent_handle(table, a, b).unwrap();
    manager.create_strong_handle(table, a).unwrap();

    let mut recorder = Recorder::default();
    let mut collection = manager.begin_collection(ScanContext::full(MAX_GENERATION));
    collection.trace_pinning_roots(&mut recorder);
    collection.trace_normal_roots(&mut recorder);
    let mut dependents = collection.dependent_handle_context();
    assert_eq!(dependents.bound(), 4);

    let mut productive = 0;
    while collection.scan_dependent_handles_for_promotion(&mut dependents, &mut recorder) {
        productive += 1;
        assert!(dependents.has_unpromoted_primaries() || productive == 3);
    }
    assert_eq!(productive, 3);
    assert_eq!(dependents.passes(), 4);
    assert!(!dependents.has_unpromoted_primaries());
    assert_eq!(recorder.promoted, vec![a, b, c, d]);
    collection.end();
}

#[test]
fn unreachable_primary_clears_both_halves() {
    let manager = manager();
    let bucket = manager.default_bucket().unwrap();
    let table = bucket.table(0);
    let mut heap = Heap::new();

    let primary = heap.alloc();
    let secondary = heap.alloc();
    let handle = manager
        .create_dependent_handle(table, primary, secondary)
        .unwrap();

    heap.collect(&manager, MAX_GENERATION);
    assert!(manager.is_null(handle));
    assert_eq!(manager.dependent_secondary(handle), ObjectRef::NULL);
    assert_eq!(heap.len(), 0);
}

#[test]
fn replaced_secondary_survives_young_collections() {
    let manager = manager();
    let bucket = manager.default_bucket().unwrap();
    let table = bucket.table(0);
    let mut heap = Heap::new();

    let primary = heap.alloc();
    let root = manager.create_strong_handle(table, primary).unwrap();
    let handle = manager
        .create_dependent_handle(table, primary, heap.alloc())
        .unwrap();
    heap.collect(&manager, 0);
    let primary = manager.fetch(root);
    assert_eq!(heap.generation(primary), Some(1));

    let young = heap.alloc();
    let id = heap.id(young);
    manager.set_dependent_secondary(handle, young);
    heap.collect(&manager, 0);

    assert_eq!(manager.fetch(handle), primary);
    let secondary = manager.dependent_secondary(handle);
    assert_ne!(secondary, young);
    assert!(heap.is_alive(secondary));
    assert_eq!(heap.id(secondary), id);
    assert_eq!(heap.generation(secondary), Some(1));
}

#[test]
fn dependent_cycles_terminate() {
    let manager = manager();
    let bucket = manager.default_bucket().unwrap();
    let table = bucket.table(0);
    let mut heap = Heap::new();

    let a = heap.alloc();
    let b = heap.alloc();
    let forward = manager.create_dependent_handle(table, a, b).unwrap();
    let backward = manager.create_dependent_handle(table, b, a).unwrap();

    let report = heap.collect(&manager, MAX_GENERATION);
    assert_eq!(report.dependents.promoted(), 0);
    assert!(manager.is_null(forward));
    assert!(manager.is_null(backward));

    // With one side rooted, the cycle keeps both alive.
    let a = heap.alloc();
    let b = heap.alloc();
    let forward = manager.create_dependent_handle(table, a, b).unwrap();
    let backward = manager.create_dependent_handle(table, b, a).unwrap();
    let _root = manager.create_strong_handle(table, b).unwrap();
    let report = heap.collect(&manager, MAX_GENERATION);
    assert_eq!(report.dependents.promoted(), 1);
    assert!(!manager.is_null(forward));
    assert!(!manager.is_null(backward));
    assert_eq!(heap.len(), 2);
}

#[test]
fn finalization_can_extend_dependents() {
    let manager = manager();
    let bucket = manager.default_bucket().unwrap();
    let table = bucket.table(0);
    let mut heap = Heap::new();

    let primary = heap.alloc();
    heap.set_finalizable(primary);
    let secondary = heap.alloc();
    let handle = manager
        .create_dependent_handle(table, primary, secondary)
        .unwrap();

    let report = heap.collect(&manager, MAX_GENERATION);
    assert_eq!(report.finalized.len(), 1);
    assert_eq!(report.dependents.promoted(), 1);
    assert_eq!(manager.fetch(handle), primary);
    assert_eq!(manager.dependent_secondary(handle), secondary);
    assert!(heap.is_alive(secondary));
}

#[test]
fn profiler_sees_pairs_without_changing_them() {
    let manager = manager();
    let bucket = manager.default_bucket().unwrap();
    let table = bucket.table(0);
    let primary = ObjectRef::from_addr(0x100);
    let secondary = ObjectRef::from_addr(0x200);
    let handle = manager
        .create_dependent_handle(table, primary, secondary)
        .unwrap();
    let strong = manager.create_strong_handle(table, primary).unwrap();

    let mut pairs = Vec::new();
    manager.scan_dependent_handles_for_profiler(|handle, primary, secondary| {
        pairs.push((handle, primary, secondary));
    });
    assert_eq!(pairs, vec![(handle, primary, secondary)]);

    let mut all = Vec::new();
    manager.scan_handles_for_profiler(|handle, object, _extra| all.push((handle.kind(), object)));
    all.sort();
    assert_eq!(
        all,
        vec![(HandleKind::Strong, primary), (HandleKind::Dependent, primary)]
    );
    assert_eq!(manager.fetch(strong), primary);
    assert_eq!(manager.dependent_secondary(handle), secondary);
}
