use crate::{TestInstance, engine};
use anyhow::Result;
use std::sync::Arc;
use wasm_backing_store::*;

const PAGE: usize = WASM_PAGE_SIZE;

fn shared_engine() -> Engine {
    engine(1 << 30, |c| {
        c.guard_regions(false);
    })
}

fn attached(store: &BackingStore, instance: &TestInstance) -> usize {
    GlobalBackingStoreRegistry::with_registry_for_testing(|view| {
        view.attached_objects(store, instance.id())
    })
    .unwrap()
}

fn memory_object(store: &Arc<BackingStore>) -> Arc<dyn MemoryObject> {
    WasmMemoryObject::new(ArrayBuffer::attach(store.clone()))
}

#[test]
fn register_lookup_unregister() -> Result<()> {
    let engine = shared_engine();
    let instance = TestInstance::new(&engine);
    let store = BackingStore::allocate_wasm_memory(&*instance, 1, 2, SharedFlag::NotShared)?;
    let start = store.buffer_start().unwrap().as_ptr();

    assert!(GlobalBackingStoreRegistry::lookup(start, PAGE).is_none());
    GlobalBackingStoreRegistry::register(&store);
    assert!(store.globally_registered());
    // Registering again is harmless.
    GlobalBackingStoreRegistry::register(&store);

    let found = GlobalBackingStoreRegistry::lookup(start, PAGE).unwrap();
    assert!(Arc::ptr_eq(&found, &store));
    drop(found);

    GlobalBackingStoreRegistry::unregister(&store);
    assert!(!store.globally_registered());
    assert!(GlobalBackingStoreRegistry::lookup(start, PAGE).is_none());
    GlobalBackingStoreRegistry::with_registry_for_testing(|view| {
        assert!(!view.contains(start));
    });
    Ok(())
}

#[test]
fn registry_does_not_keep_stores_alive() -> Result<()> {
    let engine = shared_engine();
    let instance = TestInstance::new(&engine);
    let store = BackingStore::allocate(
        &*instance,
        128,
        SharedFlag::Shared,
        InitializedFlag::ZeroInitialized,
    )?;
    GlobalBackingStoreRegistry::register(&store);
    let weak = Arc::downgrade(&store);
    drop(store);
    assert!(weak.upgrade().is_none());
    Ok(())
}

#[test]
fn stores_without_buffers_are_not_registered() -> Result<()> {
    let engine = shared_engine();
    let instance = TestInstance::new(&engine);
    let store = BackingStore::allocate(
        &*instance,
        0,
        SharedFlag::NotShared,
        InitializedFlag::Uninitialized,
    )?;
    GlobalBackingStoreRegistry::register(&store);
    assert!(!store.globally_registered());
    Ok(())
}

#[test]
fn broadcast_updates_grower_and_signals_others() -> Result<()> {
    let engine = shared_engine();
    let a = TestInstance::new(&engine);
    let b = TestInstance::new(&engine);
    let store = BackingStore::allocate_wasm_memory(&*a, 1, 4, SharedFlag::Shared)?;

    let object_a = memory_object(&store);
    let object_b = memory_object(&store);
    store.attach_shared_wasm_memory_object(&a.as_dyn(), &object_a);
    store.attach_shared_wasm_memory_object(&b.as_dyn(), &object_b);
    assert!(store.globally_registered());
    assert_eq!(attached(&store, &a), 1);
    assert_eq!(attached(&store, &b), 1);

    store.grow_wasm_memory_in_place(&*a, 2 * PAGE)?;
    store.broadcast_shared_wasm_memory_grow(&*a, 2 * PAGE);
    assert_eq!(object_a.buffer_byte_length(), 2 * PAGE);
    assert_eq!(object_b.buffer_byte_length(), PAGE);
    assert_eq!(a.grow_requests(), 0);
    assert_eq!(b.grow_requests(), 1);

    // The signalled instance catches up on its own.
    BackingStore::update_shared_wasm_memory_objects(&*b);
    assert_eq!(object_b.buffer_byte_length(), 2 * PAGE);
    Ok(())
}

#[test]
fn broadcast_signals_each_instance_once() -> Result<()> {
    let engine = shared_engine();
    let a = TestInstance::new(&engine);
    let b = TestInstance::new(&engine);
    let store = BackingStore::allocate_wasm_memory(&*a, 1, 4, SharedFlag::Shared)?;

    let objects: Vec<_> = (0..3).map(|_| memory_object(&store)).collect();
    for object in &objects {
        store.attach_shared_wasm_memory_object(&b.as_dyn(), object);
    }
    store.grow_wasm_memory_in_place(&*a, 3 * PAGE)?;
    store.broadcast_shared_wasm_memory_grow(&*a, 3 * PAGE);
    assert_eq!(b.grow_requests(), 1);
    assert!(objects.iter().all(|o| o.buffer_byte_length() == PAGE));
    Ok(())
}

#[test]
fn expired_objects_are_unlinked() -> Result<()> {
    let engine = shared_engine();
    let a = TestInstance::new(&engine);
    let b = TestInstance::new(&engine);
    let store = BackingStore::allocate_wasm_memory(&*a, 1, 4, SharedFlag::Shared)?;

    let keep = memory_object(&store);
    let dead_a = memory_object(&store);
    let dead_b = memory_object(&store);
    store.attach_shared_wasm_memory_object(&a.as_dyn(), &keep);
    store.attach_shared_wasm_memory_object(&a.as_dyn(), &dead_a);
    store.attach_shared_wasm_memory_object(&b.as_dyn(), &dead_b);
    drop((dead_a, dead_b));
    assert_eq!(attached(&store, &a), 2);
    assert_eq!(attached(&store, &b), 1);

    store.grow_wasm_memory_in_place(&*a, 2 * PAGE)?;
    store.broadcast_shared_wasm_memory_grow(&*a, 2 * PAGE);
    assert_eq!(keep.buffer_byte_length(), 2 * PAGE);
    assert_eq!(attached(&store, &a), 1);
    assert_eq!(attached(&store, &b), 0);
    Ok(())
}

#[test]
fn update_sweep_unlinks_dead_objects() -> Result<()> {
    let engine = shared_engine();
    let a = TestInstance::new(&engine);
    let b = TestInstance::new(&engine);
    let store = BackingStore::allocate_wasm_memory(&*a, 1, 4, SharedFlag::Shared)?;
    let keep = memory_object(&store);
    store.attach_shared_wasm_memory_object(&a.as_dyn(), &keep);

    for _ in 0..1000 {
        let short_lived = memory_object(&store);
        store.attach_shared_wasm_memory_object(&a.as_dyn(), &short_lived);
        drop(short_lived);
        BackingStore::update_shared_wasm_memory_objects(&*a);
    }
    assert_eq!(attached(&store, &a), 1);

    // Dead nodes belonging to other instances go too.
    let other = memory_object(&store);
    store.attach_shared_wasm_memory_object(&b.as_dyn(), &other);
    drop(other);
    assert_eq!(attached(&store, &b), 1);
    BackingStore::update_shared_wasm_memory_objects(&*a);
    assert_eq!(attached(&store, &b), 0);
    assert_eq!(attached(&store, &a), 1);
    Ok(())
}

#[test]
fn purge_unlinks_dead_objects_of_other_instances() -> Result<()> {
    let engine = shared_engine();
    let a = TestInstance::new(&engine);
    let b = TestInstance::new(&engine);
    let store = BackingStore::allocate_wasm_memory(&*a, 1, 4, SharedFlag::Shared)?;

    let live = memory_object(&store);
    let dead = memory_object(&store);
    store.attach_shared_wasm_memory_object(&a.as_dyn(), &live);
    store.attach_shared_wasm_memory_object(&b.as_dyn(), &live);
    store.attach_shared_wasm_memory_object(&b.as_dyn(), &dead);
    drop(dead);
    assert_eq!(attached(&store, &b), 2);

    BackingStore::remove_shared_wasm_memory_objects(&*a);
    assert_eq!(attached(&store, &a), 0);
    assert_eq!(attached(&store, &b), 1);
    Ok(())
}

#[test]
fn attached_objects_requires_a_registered_shared_store() -> Result<()> {
    let engine = shared_engine();
    let a = TestInstance::new(&engine);

    let shared = BackingStore::allocate_wasm_memory(&*a, 1, 1, SharedFlag::Shared)?;
    let private = BackingStore::allocate_wasm_memory(&*a, 1, 1, SharedFlag::NotShared)?;
    GlobalBackingStoreRegistry::register(&private);
    GlobalBackingStoreRegistry::with_registry_for_testing(|view| {
        assert_eq!(view.attached_objects(&shared, a.id()), None);
        assert_eq!(view.attached_objects(&private, a.id()), None);
    });

    // The view only borrows the store, so the last reference can go while
    // the registry is unlocked.
    GlobalBackingStoreRegistry::register(&shared);
    assert_eq!(attached(&shared, &a), 0);
    let weak = Arc::downgrade(&shared);
    drop(shared);
    assert!(weak.upgrade().is_none());
    Ok(())
}

#[test]
fn purge_detaches_instance_everywhere() -> Result<()> {
    let engine = shared_engine();
    let a = TestInstance::new(&engine);
    let b = TestInstance::new(&engine);
    let first = BackingStore::allocate_wasm_memory(&*a, 1, 4, SharedFlag::Shared)?;
    let second = BackingStore::allocate_wasm_memory(&*b, 1, 4, SharedFlag::Shared)?;

    let objects = [
        memory_object(&first),
        memory_object(&first),
        memory_object(&second),
    ];
    first.attach_shared_wasm_memory_object(&a.as_dyn(), &objects[0]);
    first.attach_shared_wasm_memory_object(&b.as_dyn(), &objects[1]);
    second.attach_shared_wasm_memory_object(&a.as_dyn(), &objects[2]);

    BackingStore::remove_shared_wasm_memory_objects(&*a);
    assert_eq!(attached(&first, &a), 0);
    assert_eq!(attached(&second, &a), 0);
    assert_eq!(attached(&first, &b), 1);

    // Broadcasts from the purged instance no longer reach its objects.
    first.grow_wasm_memory_in_place(&*a, 2 * PAGE)?;
    first.broadcast_shared_wasm_memory_grow(&*a, 2 * PAGE);
    assert_eq!(objects[0].buffer_byte_length(), PAGE);
    assert_eq!(b.grow_requests(), 1);
    Ok(())
}

#[test]
fn update_only_touches_stale_objects() -> Result<()> {
    let engine = shared_engine();
    let a = TestInstance::new(&engine);
    let store = BackingStore::allocate_wasm_memory(&*a, 1, 4, SharedFlag::Shared)?;

    let current = WasmMemoryObject::new(ArrayBuffer::attach(store.clone()));
    let as_object: Arc<dyn MemoryObject> = current.clone();
    store.attach_shared_wasm_memory_object(&a.as_dyn(), &as_object);

    let before = current.buffer();
    BackingStore::update_shared_wasm_memory_objects(&*a);
    assert!(Arc::ptr_eq(&before, &current.buffer()));

    store.grow_wasm_memory_in_place(&*a, 4 * PAGE)?;
    BackingStore::update_shared_wasm_memory_objects(&*a);
    let after = current.buffer();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.byte_length(), 4 * PAGE);
    assert!(Arc::ptr_eq(after.backing_store(), &store));
    Ok(())
}

#[test]
fn concurrent_growth_and_teardown() -> Result<()> {
    let engine = shared_engine();
    let grower = TestInstance::new(&engine);
    let store = BackingStore::allocate_wasm_memory(&*grower, 1, 64, SharedFlag::Shared)?;
    let object = memory_object(&store);
    store.attach_shared_wasm_memory_object(&grower.as_dyn(), &object);

    std::thread::scope(|s| {
        s.spawn(|| {
            for pages in 2..=64 {
                store
                    .grow_wasm_memory_in_place(&*grower, pages * PAGE)
                    .unwrap();
                store.broadcast_shared_wasm_memory_grow(&*grower, pages * PAGE);
            }
        });
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..50 {
                    let observer = TestInstance::new(&engine);
                    let view = memory_object(&store);
                    store.attach_shared_wasm_memory_object(&observer.as_dyn(), &view);
                    BackingStore::update_shared_wasm_memory_objects(&*observer);
                    assert!(view.buffer_byte_length() <= 64 * PAGE);
                    BackingStore::remove_shared_wasm_memory_objects(&*observer);
                }
            });
        }
    });

    assert_eq!(object.buffer_byte_length(), 64 * PAGE);
    assert_eq!(attached(&store, &grower), 1);
    Ok(())
}
