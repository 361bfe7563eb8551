mod common;

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Barrier;
use std::thread;

use common::{Recorder, MAX_GENERATION};
use tether::{Handle, HandleKind, HandleManager, HandleTableConfig, ObjectRef, ScanContext};

const HANDLES_PER_THREAD: usize = 1_000;

fn thread_count() -> usize {
    thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .max(4)
}

#[test]
fn store_if_null_has_one_winner() {
    let manager = HandleManager::new(HandleTableConfig::workstation()).unwrap();
    let threads = thread_count();
    for _ in 0..20 {
        let handle = manager
            .create_global_short_weak_handle(ObjectRef::NULL)
            .unwrap();
        let barrier = Barrier::new(threads);
        let (sender, receiver) = flume::unbounded();
        thread::scope(|scope| {
            for thread in 0..threads {
                let sender = sender.clone();
                let manager = &manager;
                let barrier = &barrier;
                scope.spawn(move || {
                    let object = ObjectRef::from_addr((thread + 1) * 0x100);
                    barrier.wait();
                    if manager.store_if_null(handle, object) {
                        sender.send(object).expect("receiver dropped");
                    }
                });
            }
        });
        drop(sender);

        let winners = receiver.iter().collect::<Vec<_>>();
        assert_eq!(winners.len(), 1);
        assert_eq!(manager.fetch(handle), winners[0]);
        manager.destroy_handle(handle);
    }
}

#[test]
fn concurrent_create_destroy_never_aliases() {
    let manager = HandleManager::new(HandleTableConfig::server(4)).unwrap();
    let threads = thread_count();
    let (sender, receiver) = flume::unbounded::<Vec<(Handle, ObjectRef)>>();
    thread::scope(|scope| {
        for thread in 0..threads {
            let sender = sender.clone();
            let manager = &manager;
            scope.spawn(move || {
                let mut kept = Vec::new();
                for index in 0..HANDLES_PER_THREAD {
                    let object = ObjectRef::from_addr((thread * HANDLES_PER_THREAD + index + 1) * 0x10);
                    let kind = HandleKind::ALL[index % HandleKind::COUNT];
                    let handle = manager.create_global_handle(kind, object).unwrap();
                    if index % 4 == 0 {
                        manager.destroy_typed_handle(handle, kind);
                    } else {
                        kept.push((handle, object));
                    }
                }
                sender.send(kept).expect("receiver dropped");
            });
        }
    });
    drop(sender);

    let mut seen = HashSet::new();
    for (handle, object) in receiver.iter().flatten() {
        assert!(seen.insert(handle), "{handle:?} handed out twice");
        assert_eq!(manager.fetch(handle), object);
        assert!(manager.contains_handle(tether::BucketIndex::DEFAULT, handle));
    }
    assert_eq!(
        seen.len(),
        threads * (HANDLES_PER_THREAD - HANDLES_PER_THREAD / 4)
    );
}

#[test]
fn threads_keep_their_home_heap() {
    let manager = HandleManager::new(HandleTableConfig::server(4)).unwrap();
    let (sender, receiver) = flume::unbounded();
    thread::scope(|scope| {
        for _ in 0..8 {
            let sender = sender.clone();
            let manager = &manager;
            scope.spawn(move || {
                let home = manager.current_thread_home_heap();
                for _ in 0..10 {
                    let handle = manager.create_global_strong_handle(ObjectRef::NULL).unwrap();
                    assert_eq!(manager.table_for_handle(handle).heap(), home);
                }
                assert_eq!(manager.current_thread_home_heap(), home);
                sender.send(home).expect("receiver dropped");
            });
        }
    });
    drop(sender);
    assert!(receiver.iter().all(|home| home < 4));

    let workstation = HandleManager::new(HandleTableConfig::workstation()).unwrap();
    assert_eq!(workstation.current_thread_home_heap(), 0);
}

#[test]
fn server_scans_partition_by_heap() {
    const HEAPS: usize = 4;
    let manager = HandleManager::new(HandleTableConfig::server(HEAPS)).unwrap();
    let bucket = manager.default_bucket().unwrap();
    let mut expected = vec![Vec::new(); HEAPS];
    for (heap, objects) in expected.iter_mut().enumerate() {
        for index in 0..16 {
            let object = ObjectRef::from_addr((heap + 1) * 0x10_000 + index * 0x10);
            manager
                .create_strong_handle(bucket.table(heap), object)
                .unwrap();
            objects.push(object);
        }
    }

    let (sender, receiver) = flume::unbounded();
    thread::scope(|scope| {
        for heap in 0..HEAPS {
            let sender = sender.clone();
            let manager = &manager;
            scope.spawn(move || {
                let mut recorder = Recorder::default();
                let context = ScanContext::full(MAX_GENERATION).for_heap(heap);
                let mut collection = manager.begin_collection(context);
                collection.trace_pinning_roots(&mut recorder);
                collection.trace_normal_roots(&mut recorder);
                collection.promote_dependent_handles(&mut recorder);
                collection.update_pointers(&mut recorder);
                collection.clear_short_weak_handles(&recorder);
                collection.clear_long_weak_handles(&recorder);
                collection.age_handles();
                collection.scan_sized_ref_handles(&recorder);
                collection.end();
                sender
                    .send((heap, recorder.promoted))
                    .expect("receiver dropped");
            });
        }
    });
    drop(sender);

    let mut scanned = receiver.iter().collect::<Vec<_>>();
    scanned.sort_by_key(|(heap, _)| *heap);
    assert_eq!(scanned.len(), HEAPS);
    for (heap, promoted) in scanned {
        assert_eq!(promoted, expected[heap]);
    }
}
