//! Backing stores: the raw memory behind buffers and WebAssembly memories.
//!
//! There are two kinds of store:
//!
//! * General-purpose buffers, allocated from (or wrapped around memory owned
//!   by) the instance's [`ArrayBufferAllocator`]. Their length is fixed.
//! * WebAssembly memories, reserved directly from the engine's
//!   [`PageAllocator`](crate::PageAllocator) and charged against its
//!   [`AddressSpaceBudget`](crate::AddressSpaceBudget). They can grow in place
//!   up to their capacity, and may be shared between instances, in which case
//!   the store carries the list of memory objects attached to it.

use crate::allocator::ArrayBufferAllocator;
use crate::engine::Engine;
use crate::error::{AllocationError, GrowError};
use crate::guard::{self, MemoryLayout};
use crate::instance::{EngineInstance, MemoryPressureLevel};
use crate::memory_object::MemoryObject;
use crate::metrics::{AllocationStatus, MB, MetricEvent};
use crate::mmap::{Protection, round_up_to_page_size};
use crate::registry::GlobalBackingStoreRegistry;
use crate::retry::PressureRetry;
use crate::shared_memory::SharedMemoryList;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Whether a store may be observed by more than one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SharedFlag {
    /// Owned by a single instance.
    NotShared,
    /// Shared between instances.
    Shared,
}

/// Whether a general-purpose allocation must be zeroed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InitializedFlag {
    /// Contents are unspecified.
    Uninitialized,
    /// Every byte reads as zero.
    ZeroInitialized,
}

/// Data that depends on what kind of store this is. At most one of these is
/// ever present.
pub(crate) enum TypeSpecificData {
    None,
    /// General-purpose buffers: the allocator that frees the region.
    ArrayBufferAllocator(Arc<dyn ArrayBufferAllocator>),
    /// Shared WebAssembly memories: the attached memory objects.
    SharedWasmMemory(Mutex<SharedMemoryList>),
}

/// A region of memory backing a buffer or WebAssembly memory, together with
/// its ownership metadata.
///
/// Stores are reference counted; the last `Arc` to drop tears the store down,
/// unregistering it, releasing its address-space reservation and returning
/// its memory.
pub struct BackingStore {
    /// Address of the first usable byte, or 0 when there is no buffer.
    buffer_start: usize,
    byte_length: AtomicUsize,
    byte_capacity: usize,
    is_shared: bool,
    is_wasm_memory: bool,
    has_guard_regions: bool,
    free_on_destruct: bool,
    globally_registered: AtomicBool,
    /// Present for WebAssembly memories, which return their pages to the
    /// engine that mapped them.
    engine: Option<Engine>,
    type_specific_data: TypeSpecificData,
}

impl BackingStore {
    /// Allocates a general-purpose buffer of `byte_length` bytes from the
    /// instance's [`ArrayBufferAllocator`].
    ///
    /// A zero-length allocation doesn't consult the allocator and produces a
    /// store with no buffer. The allocator is asked once; the caller decides
    /// whether a failure is worth retrying.
    pub fn allocate(
        instance: &dyn EngineInstance,
        byte_length: usize,
        shared: SharedFlag,
        initialized: InitializedFlag,
    ) -> Result<Arc<BackingStore>, AllocationError> {
        let allocator = instance.array_buffer_allocator();
        let mut buffer_start = None;
        if byte_length != 0 {
            let megabytes = byte_length / MB;
            if megabytes > 0 {
                instance.record(MetricEvent::ArrayBufferBigAllocation { megabytes });
            }
            if shared == SharedFlag::Shared {
                instance.record(MetricEvent::SharedArrayAllocation { megabytes });
            }

            let ptr = match initialized {
                InitializedFlag::Uninitialized => allocator.allocate_uninitialized(byte_length),
                InitializedFlag::ZeroInitialized => allocator.allocate(byte_length),
            };
            match ptr {
                Some(ptr) => buffer_start = Some(ptr),
                None => {
                    let e = AllocationError::HostAllocator { bytes: byte_length };
                    log::warn!("{e}");
                    instance.record(MetricEvent::ArrayBufferNewSizeFailure { megabytes });
                    return Err(e);
                }
            }
        }

        let store = Arc::new(BackingStore {
            buffer_start: buffer_start.map_or(0, |p| p.as_ptr() as usize),
            byte_length: AtomicUsize::new(byte_length),
            byte_capacity: byte_length,
            is_shared: shared == SharedFlag::Shared,
            is_wasm_memory: false,
            has_guard_regions: false,
            free_on_destruct: true,
            globally_registered: AtomicBool::new(false),
            engine: None,
            type_specific_data: TypeSpecificData::ArrayBufferAllocator(allocator),
        });
        log::trace!("allocated {store:?}");
        Ok(store)
    }

    /// Wraps a region the embedder already owns in a general-purpose store.
    ///
    /// When `free_on_destruct` is set the region is returned to the
    /// instance's [`ArrayBufferAllocator`] when the store is dropped;
    /// otherwise the embedder keeps ownership of it.
    ///
    /// # Safety
    ///
    /// `allocation_base` must be valid for reads and writes of
    /// `allocation_length` bytes for the lifetime of the store, and when
    /// `free_on_destruct` is set it must have been allocated by the
    /// instance's allocator with exactly that length.
    pub unsafe fn wrap_allocation(
        instance: &dyn EngineInstance,
        allocation_base: *mut u8,
        allocation_length: usize,
        shared: SharedFlag,
        free_on_destruct: bool,
    ) -> Arc<BackingStore> {
        let store = Arc::new(BackingStore {
            buffer_start: allocation_base as usize,
            byte_length: AtomicUsize::new(allocation_length),
            byte_capacity: allocation_length,
            is_shared: shared == SharedFlag::Shared,
            is_wasm_memory: false,
            has_guard_regions: false,
            free_on_destruct,
            globally_registered: AtomicBool::new(false),
            engine: None,
            type_specific_data: TypeSpecificData::ArrayBufferAllocator(
                instance.array_buffer_allocator(),
            ),
        });
        log::trace!("wrapped {store:?}");
        store
    }

    /// Allocates a WebAssembly memory of `initial_pages` that may later grow
    /// to `maximum_pages`.
    ///
    /// If the full maximum can't be reserved, a second attempt is made with
    /// the maximum lowered to `initial_pages`.
    pub fn allocate_wasm_memory(
        instance: &dyn EngineInstance,
        initial_pages: u64,
        maximum_pages: u64,
        shared: SharedFlag,
    ) -> Result<Arc<BackingStore>, AllocationError> {
        let engine = instance.engine();
        debug_assert_eq!(
            guard::WASM_PAGE_SIZE % engine.page_allocator().allocate_page_size(),
            0
        );

        let limit = engine.max_memory_pages();
        if initial_pages > limit {
            return Err(AllocationError::ExceedsEngineLimit {
                pages: initial_pages,
                limit,
            });
        }
        let maximum_pages = maximum_pages.max(initial_pages);

        match BackingStore::try_allocate_wasm_memory(instance, initial_pages, maximum_pages, shared)
        {
            Err(e) if maximum_pages > initial_pages => {
                log::debug!(
                    "reserving {maximum_pages} pages failed ({e}), retrying with {initial_pages}"
                );
                BackingStore::try_allocate_wasm_memory(
                    instance,
                    initial_pages,
                    initial_pages,
                    shared,
                )
            }
            result => result,
        }
    }

    /// A single attempt at allocating a WebAssembly memory: reserve budget,
    /// map the reservation inaccessible, then commit the initial pages.
    ///
    /// Each phase is retried with a memory pressure notification in between.
    /// Failing to commit after the reservation succeeded aborts the process.
    fn try_allocate_wasm_memory(
        instance: &dyn EngineInstance,
        initial_pages: u64,
        maximum_pages: u64,
        shared: SharedFlag,
    ) -> Result<Arc<BackingStore>, AllocationError> {
        let engine = instance.engine();
        let layout = engine.memory_layout(maximum_pages);
        let reservation_bytes =
            MemoryLayout::reservation_bytes(layout.has_guard_regions, layout.byte_capacity);
        let mut retry = PressureRetry::new(engine.config().allocation_attempts, || {
            instance.request_reclamation(MemoryPressureLevel::Critical)
        });

        let result = (|| -> Result<Arc<BackingStore>, AllocationError> {
            // 1. Charge the reservation against the budget.
            let budget = engine.budget();
            retry
                .run(|| {
                    if budget.reserve(reservation_bytes) {
                        Ok(())
                    } else {
                        Err(AllocationError::AddressSpaceLimitReached {
                            bytes: reservation_bytes,
                        })
                    }
                })
                .inspect_err(|e| log::warn!("{e}"))?;

            // 2. Map the whole reservation, inaccessible.
            let pages = engine.page_allocator();
            let base = if layout.reservation_size == 0 {
                None
            } else {
                let mapped = retry.run(|| {
                    pages.allocate_pages(
                        None,
                        layout.reservation_size,
                        guard::WASM_PAGE_SIZE,
                        Protection::NoAccess,
                    )
                });
                match mapped {
                    Ok(base) => Some(base),
                    Err(source) => {
                        budget.release(reservation_bytes);
                        let e = AllocationError::Mapping {
                            bytes: layout.reservation_size,
                            source,
                        };
                        log::warn!("{e}");
                        return Err(e);
                    }
                }
            };

            // 3. Commit the initial pages.
            let byte_length = guard::pages_to_bytes(initial_pages)
                .expect("initial size is bounded by the engine limit");
            debug_assert!(byte_length <= layout.byte_capacity);
            let buffer_start = base.map(|base| unsafe { base.add(layout.pre_guard_size) });
            if let Some(buffer_start) = buffer_start {
                let committed = retry.run(|| {
                    if byte_length == 0 {
                        return Ok(());
                    }
                    unsafe { pages.set_permissions(buffer_start, byte_length, Protection::ReadWrite) }
                });
                if let Err(e) = committed {
                    fatal_out_of_memory("BackingStore::allocate_wasm_memory", &e);
                }
                debug_check_zero(buffer_start, byte_length);
            }

            let is_shared = shared == SharedFlag::Shared;
            let type_specific_data = if is_shared {
                TypeSpecificData::SharedWasmMemory(Mutex::new(SharedMemoryList::new()))
            } else {
                TypeSpecificData::None
            };
            Ok(Arc::new(BackingStore {
                buffer_start: buffer_start.map_or(0, |p| p.as_ptr() as usize),
                byte_length: AtomicUsize::new(byte_length),
                byte_capacity: layout.byte_capacity,
                is_shared,
                is_wasm_memory: true,
                has_guard_regions: layout.has_guard_regions,
                free_on_destruct: true,
                globally_registered: AtomicBool::new(false),
                engine: Some(engine.clone()),
                type_specific_data,
            }))
        })();

        let status = match &result {
            Ok(store) => {
                log::trace!("allocated {store:?}");
                if retry.did_retry() {
                    AllocationStatus::SuccessAfterRetry
                } else {
                    AllocationStatus::Success
                }
            }
            Err(e) => e.status(),
        };
        instance.record(MetricEvent::WasmMemoryAllocationResult(status));
        result
    }

    /// Grows a WebAssembly memory to `new_length` bytes without moving it.
    ///
    /// Does nothing if the memory is already at least that long. Otherwise
    /// `new_length` must be a whole number of WebAssembly pages. The new
    /// bytes read as zero. Callers must not grow the same store from two
    /// threads at once.
    pub fn grow_wasm_memory_in_place(
        &self,
        instance: &dyn EngineInstance,
        new_length: usize,
    ) -> Result<(), GrowError> {
        assert!(self.is_wasm_memory, "only WebAssembly memories can grow");
        let old_length = self.byte_length();
        if new_length <= old_length {
            return Ok(());
        }
        if new_length > self.byte_capacity {
            return Err(GrowError::ExceedsCapacity {
                requested: new_length,
                capacity: self.byte_capacity,
            });
        }
        if new_length % guard::WASM_PAGE_SIZE != 0 {
            return Err(GrowError::Unaligned {
                requested: new_length,
            });
        }

        // A memory with nonzero capacity always has a mapping.
        let buffer_start = self
            .buffer_start()
            .expect("growable memory has a buffer");
        let delta = new_length - old_length;
        let pages = self.engine().page_allocator();
        debug_assert_eq!(old_length % pages.commit_page_size(), 0);
        unsafe {
            pages
                .set_permissions(buffer_start.add(old_length), delta, Protection::ReadWrite)
                .map_err(|source| GrowError::Commit {
                    offset: old_length,
                    len: delta,
                    source,
                })?;
        }
        instance.adjust_external_memory(delta as i64);
        self.byte_length.store(new_length, Ordering::Release);
        log::trace!("grew {self:?} from {old_length:#x}");
        Ok(())
    }

    /// Allocates a new WebAssembly memory of at least `new_byte_length` bytes
    /// and copies this memory's contents into it.
    ///
    /// The copy has the same sharing flag and guard region policy as this
    /// store, and its maximum is its initial size. This store is left
    /// untouched.
    pub fn copy_wasm_memory(
        &self,
        instance: &dyn EngineInstance,
        new_byte_length: usize,
    ) -> Result<Arc<BackingStore>, AllocationError> {
        assert!(self.is_wasm_memory, "only WebAssembly memories can be copied");
        let byte_length = self.byte_length();
        assert!(
            new_byte_length >= byte_length,
            "copy of {byte_length:#x} bytes can't shrink to {new_byte_length:#x}"
        );

        let new_pages = round_up_to_page_size(new_byte_length, guard::WASM_PAGE_SIZE)
            .map_or(u64::MAX, |bytes| (bytes / guard::WASM_PAGE_SIZE) as u64);
        let shared = if self.is_shared {
            SharedFlag::Shared
        } else {
            SharedFlag::NotShared
        };
        let new_store = BackingStore::allocate_wasm_memory(instance, new_pages, new_pages, shared)?;
        if new_store.has_guard_regions != self.has_guard_regions {
            return Err(AllocationError::GuardRegionMismatch);
        }

        if let (Some(src), Some(dst)) = (self.buffer_start(), new_store.buffer_start()) {
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), byte_length);
            }
        }
        Ok(new_store)
    }

    /// Attaches `memory_object`, owned by `instance`, to this shared memory so
    /// that it is updated when another instance grows the memory.
    ///
    /// Registers the store globally if it isn't already.
    pub fn attach_shared_wasm_memory_object(
        self: &Arc<Self>,
        instance: &Arc<dyn EngineInstance>,
        memory_object: &Arc<dyn MemoryObject>,
    ) {
        assert!(self.is_wasm_memory && self.is_shared);
        GlobalBackingStoreRegistry::register(self);
        GlobalBackingStoreRegistry::add_shared_wasm_memory_object(instance, self, memory_object);
    }

    /// Tells every instance observing this shared memory that it has grown
    /// to `new_size` bytes.
    pub fn broadcast_shared_wasm_memory_grow(
        self: &Arc<Self>,
        instance: &dyn EngineInstance,
        new_size: usize,
    ) {
        GlobalBackingStoreRegistry::broadcast_shared_wasm_memory_grow(instance, self, new_size);
    }

    /// Detaches every memory object `instance` attached to any shared memory.
    pub fn remove_shared_wasm_memory_objects(instance: &dyn EngineInstance) {
        GlobalBackingStoreRegistry::purge(instance);
    }

    /// Brings `instance`'s memory objects up to date with growth performed by
    /// other instances.
    pub fn update_shared_wasm_memory_objects(instance: &dyn EngineInstance) {
        GlobalBackingStoreRegistry::update_shared_wasm_memory_objects(instance);
    }

    /// The first usable byte, or `None` for stores without a buffer.
    pub fn buffer_start(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.buffer_start as *mut u8)
    }

    pub(crate) fn buffer_start_addr(&self) -> usize {
        self.buffer_start
    }

    /// The number of accessible bytes.
    pub fn byte_length(&self) -> usize {
        self.byte_length.load(Ordering::Acquire)
    }

    /// The length this store can reach without being reallocated.
    pub fn byte_capacity(&self) -> usize {
        self.byte_capacity
    }

    /// Whether this store may be observed by more than one instance.
    pub fn is_shared(&self) -> bool {
        self.is_shared
    }

    /// Whether this store is a WebAssembly memory.
    pub fn is_wasm_memory(&self) -> bool {
        self.is_wasm_memory
    }

    /// Whether this store is flanked by guard regions.
    pub fn has_guard_regions(&self) -> bool {
        self.has_guard_regions
    }

    /// Whether dropping this store frees its memory.
    pub fn free_on_destruct(&self) -> bool {
        self.free_on_destruct
    }

    /// Whether this store is in the global registry.
    pub fn globally_registered(&self) -> bool {
        self.globally_registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_globally_registered(&self, registered: bool) {
        self.globally_registered.store(registered, Ordering::Release);
    }

    /// The attached memory objects, for shared WebAssembly memories.
    pub(crate) fn shared_wasm_memory_data(&self) -> Option<&Mutex<SharedMemoryList>> {
        match &self.type_specific_data {
            TypeSpecificData::SharedWasmMemory(list) => Some(list),
            _ => None,
        }
    }

    fn engine(&self) -> &Engine {
        self.engine
            .as_ref()
            .expect("WebAssembly memories record their engine")
    }
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        GlobalBackingStoreRegistry::unregister(self);
        log::trace!("freeing {self:?}");

        if self.is_wasm_memory {
            debug_assert!(self.free_on_destruct);
            let engine = self.engine();
            if self.buffer_start != 0 {
                let region = MemoryLayout::reserved_region(
                    self.buffer_start,
                    self.byte_capacity,
                    self.has_guard_regions,
                );
                let base = NonNull::new(region.start as *mut u8)
                    .expect("reservations are never at address zero");
                unsafe {
                    engine
                        .page_allocator()
                        .free_pages(base, region.len())
                        .expect("munmap failed");
                }
            }
            engine.budget().release(MemoryLayout::reservation_bytes(
                self.has_guard_regions,
                self.byte_capacity,
            ));
            return;
        }

        if !self.free_on_destruct {
            return;
        }
        if let (Some(data), TypeSpecificData::ArrayBufferAllocator(allocator)) =
            (self.buffer_start(), &self.type_specific_data)
        {
            unsafe { allocator.free(data, self.byte_length()) }
        }
    }
}

impl fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingStore")
            .field("buffer_start", &format_args!("{:#x}", self.buffer_start))
            .field("byte_length", &self.byte_length())
            .field("byte_capacity", &self.byte_capacity)
            .field("is_shared", &self.is_shared)
            .field("is_wasm_memory", &self.is_wasm_memory)
            .field("has_guard_regions", &self.has_guard_regions)
            .finish_non_exhaustive()
    }
}

/// Committing a small prefix of a reservation we already hold means the
/// process is out of memory.
#[cold]
fn fatal_out_of_memory(location: &str, error: &std::io::Error) -> ! {
    log::error!("{location}: out of memory committing WebAssembly memory: {error}");
    std::process::abort()
}

/// Freshly committed memory must read as zero. Reading it also faults the
/// pages in.
fn debug_check_zero(start: NonNull<u8>, len: usize) {
    if cfg!(debug_assertions) {
        let bytes = unsafe { std::slice::from_raw_parts(start.as_ptr(), len) };
        assert!(
            bytes.iter().all(|b| *b == 0),
            "freshly committed memory isn't zeroed"
        );
    }
}
