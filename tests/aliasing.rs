use std::collections::HashMap;

use proptest::prelude::*;
use tether::{Handle, HandleKind, HandleManager, HandleTableConfig, ObjectRef};

#[derive(Clone, Debug)]
enum Op {
    Create(usize),
    Destroy(usize),
    Store(usize, usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..HandleKind::COUNT).prop_map(Op::Create),
        2 => any::<usize>().prop_map(Op::Destroy),
        1 => (any::<usize>(), 1..1_000_usize).prop_map(|(index, addr)| Op::Store(index, addr)),
    ]
}

proptest! {
    #[test]
    fn live_handles_never_alias(ops in prop::collection::vec(arb_op(), 1..300)) {
        let manager = HandleManager::new(HandleTableConfig::workstation()).unwrap();
        let bucket = manager.default_bucket().unwrap();
        let table = bucket.table(0);
        let mut live: Vec<(Handle, ObjectRef)> = Vec::new();
        let mut next_object = 1_usize;

        for op in ops {
            match op {
                Op::Create(kind) => {
                    let object = ObjectRef::from_addr(next_object * 0x10);
                    next_object += 1;
                    let handle = manager
                        .create_handle(table, HandleKind::ALL[kind], object)
                        .unwrap();
                    prop_assert!(live.iter().all(|(existing, _)| *existing != handle));
                    live.push((handle, object));
                }
                Op::Destroy(index) if !live.is_empty() => {
                    let (handle, _) = live.swap_remove(index % live.len());
                    manager.destroy_typed_handle(handle, handle.kind());
                    prop_assert!(!table.contains(handle));
                }
                Op::Store(index, addr) if !live.is_empty() => {
                    let index = index % live.len();
                    let object = ObjectRef::from_addr(addr * 0x10);
                    manager.store(live[index].0, object);
                    live[index].1 = object;
                }
                Op::Destroy(_) | Op::Store(..) => {}
            }

            for (handle, object) in &live {
                prop_assert!(table.contains(*handle));
                prop_assert_eq!(manager.fetch(*handle), *object);
            }
        }

        let mut per_kind = HashMap::<HandleKind, usize>::new();
        for (handle, _) in &live {
            *per_kind.entry(handle.kind()).or_default() += 1;
        }
        for kind in HandleKind::ALL {
            prop_assert_eq!(table.count(kind), per_kind.get(&kind).copied().unwrap_or(0));
        }
        prop_assert_eq!(table.len(), live.len());
    }
}
