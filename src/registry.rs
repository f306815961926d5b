//! The process-wide registry of backing stores, keyed by buffer address.
//!
//! The registry holds stores weakly; it never keeps one alive. It also owns
//! the lock that protects every shared memory's list of attached memory
//! objects, which is how growth on one instance is propagated to the others.
//!
//! No allocation of buffers, and no call back into an instance that could
//! free a store, happens while the registry lock is held: dropping a store
//! re-enters the registry to unregister it. Strong references resolved under
//! the lock are therefore collected into vectors declared before the guard,
//! so that they drop only after it has been released.

use crate::backing_store::BackingStore;
use crate::instance::{EngineInstance, InstanceId};
use crate::memory_object::{ArrayBuffer, MemoryObject};
use crate::shared_memory::{Owner, SharedMemoryList};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

static REGISTRY: LazyLock<Mutex<HashMap<usize, Weak<BackingStore>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<usize, Weak<BackingStore>>> {
    REGISTRY
        .lock()
        .expect("backing store registry lock got poisoned")
}

/// The process-wide map from buffer address to backing store.
///
/// There is a single registry per process, created on first use and never
/// torn down.
pub struct GlobalBackingStoreRegistry;

impl GlobalBackingStoreRegistry {
    /// Makes `store` discoverable through [`GlobalBackingStoreRegistry::lookup`].
    ///
    /// Does nothing if the store is already registered or has no buffer.
    pub fn register(store: &Arc<BackingStore>) {
        let addr = store.buffer_start_addr();
        if addr == 0 {
            return;
        }
        let mut map = registry();
        if store.globally_registered() {
            return;
        }
        log::trace!("registering {store:?}");
        match map.entry(addr) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(store));
            }
            Entry::Occupied(_) => panic!("backing store at {addr:#x} registered twice"),
        }
        store.set_globally_registered(true);
    }

    /// Removes `store` from the registry. Does nothing if it was never
    /// registered.
    pub fn unregister(store: &BackingStore) {
        if !store.globally_registered() {
            return;
        }
        let mut map = registry();
        if let Some(weak) = map.remove(&store.buffer_start_addr()) {
            debug_assert!(
                weak.strong_count() == 0 || std::ptr::eq(weak.as_ptr(), store),
                "registry entry refers to another store"
            );
        }
        store.set_globally_registered(false);
        log::trace!("unregistered {store:?}");
    }

    /// Finds the live store whose buffer starts at `buffer_start`.
    pub fn lookup(buffer_start: *const u8, length: usize) -> Option<Arc<BackingStore>> {
        log::trace!("lookup {buffer_start:p} ({length:#x} bytes)");
        let store = registry()
            .get(&(buffer_start as usize))
            .and_then(Weak::upgrade)?;
        debug_assert_eq!(store.byte_length(), length);
        Some(store)
    }

    /// Detaches every memory object owned by `instance` from every registered
    /// shared memory. Called when an instance is torn down.
    ///
    /// Nodes of other instances whose memory objects have died are unlinked
    /// along the way.
    pub fn purge(instance: &dyn EngineInstance) {
        let id = instance.id();
        let mut stores = Vec::new();
        let map = registry();
        for weak in map.values() {
            let Some(store) = weak.upgrade() else {
                continue;
            };
            if store.is_wasm_memory() {
                if let Some(list) = store.shared_wasm_memory_data() {
                    lock_list(list)
                        .retain(|node| node.owner_id() != Some(id) && !node.is_expired());
                }
            }
            stores.push(store);
        }
        drop(map);
        log::trace!("purged {id:?} from {} stores", stores.len());
    }

    /// Attaches `memory_object` to the shared memory `store` on behalf of
    /// `instance`.
    pub fn add_shared_wasm_memory_object(
        instance: &Arc<dyn EngineInstance>,
        store: &BackingStore,
        memory_object: &Arc<dyn MemoryObject>,
    ) {
        let list = store
            .shared_wasm_memory_data()
            .expect("memory objects are only attached to shared WebAssembly memories");
        let owner = Owner {
            id: instance.id(),
            instance: Arc::downgrade(instance),
        };
        let weak = Arc::downgrade(memory_object);

        let _map = registry();
        lock_list(list).insert_after_anchor(owner, weak);
    }

    /// Propagates the growth of `store` to `new_size` bytes.
    ///
    /// Memory objects owned by `instance`, the grower, get a new buffer
    /// immediately. Every other instance observing the store is asked to call
    /// [`GlobalBackingStoreRegistry::update_shared_wasm_memory_objects`] at its
    /// next opportunity.
    pub fn broadcast_shared_wasm_memory_grow(
        instance: &dyn EngineInstance,
        store: &Arc<BackingStore>,
        new_size: usize,
    ) {
        let id = instance.id();
        let list = store
            .shared_wasm_memory_data()
            .expect("only shared WebAssembly memories are broadcast");

        let mut memory_objects = Vec::new();
        let mut to_signal: SmallVec<[(InstanceId, Arc<dyn EngineInstance>); 4]> = SmallVec::new();
        {
            let _map = registry();
            lock_list(list).retain(|node| {
                let Some(owner) = node.owner() else {
                    return true;
                };
                if owner.id == id {
                    if let Some(object) = node.memory_object() {
                        memory_objects.push(object);
                        return true;
                    }
                }
                if !to_signal.iter().any(|(other, _)| *other == owner.id) {
                    if let Some(other) = owner.instance.upgrade() {
                        to_signal.push((owner.id, other));
                    }
                }
                !node.is_expired()
            });
        }

        for (_, other) in &to_signal {
            other.request_grow_shared_memory();
        }
        log::trace!(
            "broadcast growth of {store:?} to {new_size:#x}: {} local objects, {} instances signalled",
            memory_objects.len(),
            to_signal.len()
        );
        for object in &memory_objects {
            object.update_instances(ArrayBuffer::with_length(store.clone(), new_size));
        }
    }

    /// Brings every memory object owned by `instance` up to date with the
    /// current length of the shared memory it is attached to.
    ///
    /// Nodes whose memory objects have died are unlinked during the sweep.
    pub fn update_shared_wasm_memory_objects(instance: &dyn EngineInstance) {
        let id = instance.id();
        let mut pending = Vec::new();
        let mut others = Vec::new();
        {
            let map = registry();
            for weak in map.values() {
                let Some(store) = weak.upgrade() else {
                    continue;
                };
                let Some(list) = store.shared_wasm_memory_data() else {
                    others.push(store);
                    continue;
                };
                lock_list(list).retain(|node| {
                    if node.owner_id() == Some(id) {
                        if let Some(object) = node.memory_object() {
                            pending.push((store.clone(), object));
                            return true;
                        }
                    }
                    !node.is_expired()
                });
                others.push(store);
            }
        }
        drop(others);

        for (store, object) in &pending {
            if object.buffer_byte_length() != store.byte_length() {
                object.update_instances(ArrayBuffer::attach(store.clone()));
            }
        }
    }

    /// Runs `f` with the registry locked. Intended for tests, which need to
    /// inspect process-wide state directly.
    #[doc(hidden)]
    pub fn with_registry_for_testing<R>(f: impl FnOnce(&RegistryView<'_>) -> R) -> R {
        let map = registry();
        f(&RegistryView { map: &*map })
    }
}

/// Read-only access to the registry, handed out by
/// [`GlobalBackingStoreRegistry::with_registry_for_testing`].
#[doc(hidden)]
pub struct RegistryView<'a> {
    map: &'a HashMap<usize, Weak<BackingStore>>,
}

impl RegistryView<'_> {
    /// Whether there is an entry, live or not, at `buffer_start`.
    pub fn contains(&self, buffer_start: *const u8) -> bool {
        self.map.contains_key(&(buffer_start as usize))
    }

    /// Number of link nodes on `store` owned by `instance`, or `None` if
    /// `store` isn't a registered shared memory.
    pub fn attached_objects(&self, store: &BackingStore, instance: InstanceId) -> Option<usize> {
        let weak = self.map.get(&store.buffer_start_addr())?;
        if !std::ptr::eq(weak.as_ptr(), store) {
            return None;
        }
        let list = lock_list(store.shared_wasm_memory_data()?);
        let mut count = 0;
        let mut cursor = list.first();
        while let Some(index) = cursor {
            if list.get(index).owner_id() == Some(instance) {
                count += 1;
            }
            cursor = list.next(index);
        }
        Some(count)
    }
}

fn lock_list(list: &Mutex<SharedMemoryList>) -> MutexGuard<'_, SharedMemoryList> {
    list.lock()
        .expect("shared memory list lock got poisoned")
}
