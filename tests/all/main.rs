mod registry;

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use wasm_backing_store::*;

/// Builds an engine with a private address-space budget of `limit` bytes.
pub(crate) fn engine(limit: u64, configure: impl FnOnce(&mut Config)) -> Engine {
    let _ = env_logger::try_init();
    let mut config = Config::new();
    config.address_space_limit(Some(limit));
    configure(&mut config);
    Engine::new(&config).unwrap()
}

/// An engine instance that records everything the allocator tells it.
pub(crate) struct TestInstance {
    id: InstanceId,
    engine: Engine,
    allocator: Arc<dyn ArrayBufferAllocator>,
    events: Mutex<Vec<MetricEvent>>,
    reclamations: AtomicUsize,
    external_memory: AtomicI64,
    grow_requests: AtomicUsize,
}

impl TestInstance {
    pub(crate) fn new(engine: &Engine) -> Arc<TestInstance> {
        TestInstance::with_allocator(engine, Arc::new(DefaultArrayBufferAllocator))
    }

    pub(crate) fn with_allocator(
        engine: &Engine,
        allocator: Arc<dyn ArrayBufferAllocator>,
    ) -> Arc<TestInstance> {
        Arc::new(TestInstance {
            id: InstanceId::next(),
            engine: engine.clone(),
            allocator,
            events: Mutex::new(Vec::new()),
            reclamations: AtomicUsize::new(0),
            external_memory: AtomicI64::new(0),
            grow_requests: AtomicUsize::new(0),
        })
    }

    pub(crate) fn as_dyn(self: &Arc<Self>) -> Arc<dyn EngineInstance> {
        self.clone()
    }

    pub(crate) fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn reclamations(&self) -> usize {
        self.reclamations.load(Ordering::SeqCst)
    }

    pub(crate) fn external_memory(&self) -> i64 {
        self.external_memory.load(Ordering::SeqCst)
    }

    pub(crate) fn grow_requests(&self) -> usize {
        self.grow_requests.load(Ordering::SeqCst)
    }
}

impl EngineInstance for TestInstance {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn engine(&self) -> &Engine {
        &self.engine
    }

    fn array_buffer_allocator(&self) -> Arc<dyn ArrayBufferAllocator> {
        self.allocator.clone()
    }

    fn request_reclamation(&self, level: MemoryPressureLevel) {
        assert_eq!(level, MemoryPressureLevel::Critical);
        self.reclamations.fetch_add(1, Ordering::SeqCst);
    }

    fn adjust_external_memory(&self, delta: i64) {
        self.external_memory.fetch_add(delta, Ordering::SeqCst);
    }

    fn record(&self, event: MetricEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn request_grow_shared_memory(&self) {
        self.grow_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// A page allocator that fails a configurable number of upcoming requests.
#[derive(Default)]
pub(crate) struct FaultyPageAllocator {
    pub(crate) fail_allocations: AtomicUsize,
    pub(crate) fail_commits: AtomicUsize,
    pub(crate) fail_frees: AtomicUsize,
    pub(crate) live_mappings: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected() -> io::Error {
    io::Error::new(io::ErrorKind::OutOfMemory, "injected failure")
}

unsafe impl PageAllocator for FaultyPageAllocator {
    fn allocate_page_size(&self) -> usize {
        OsPageAllocator.allocate_page_size()
    }

    fn commit_page_size(&self) -> usize {
        OsPageAllocator.commit_page_size()
    }

    fn allocate_pages(
        &self,
        hint: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
        protection: Protection,
    ) -> io::Result<NonNull<u8>> {
        if take_failure(&self.fail_allocations) {
            return Err(injected());
        }
        let base = OsPageAllocator.allocate_pages(hint, size, alignment, protection)?;
        self.live_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(base)
    }

    unsafe fn set_permissions(
        &self,
        base: NonNull<u8>,
        size: usize,
        protection: Protection,
    ) -> io::Result<()> {
        if protection == Protection::ReadWrite && take_failure(&self.fail_commits) {
            return Err(injected());
        }
        unsafe { OsPageAllocator.set_permissions(base, size, protection) }
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, size: usize) -> io::Result<()> {
        if take_failure(&self.fail_frees) {
            return Err(injected());
        }
        self.live_mappings.fetch_sub(1, Ordering::SeqCst);
        unsafe { OsPageAllocator.free_pages(base, size) }
    }
}

/// A host allocator that fails a configurable number of upcoming requests
/// and counts frees.
#[derive(Default)]
pub(crate) struct CountingAllocator {
    pub(crate) fail_allocations: AtomicUsize,
    pub(crate) frees: AtomicUsize,
}

unsafe impl ArrayBufferAllocator for CountingAllocator {
    fn allocate(&self, length: usize) -> Option<NonNull<u8>> {
        if take_failure(&self.fail_allocations) {
            return None;
        }
        DefaultArrayBufferAllocator.allocate(length)
    }

    fn allocate_uninitialized(&self, length: usize) -> Option<NonNull<u8>> {
        if take_failure(&self.fail_allocations) {
            return None;
        }
        DefaultArrayBufferAllocator.allocate_uninitialized(length)
    }

    unsafe fn free(&self, data: NonNull<u8>, length: usize) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        unsafe { DefaultArrayBufferAllocator.free(data, length) }
    }
}

/// Views the accessible bytes of `store`.
pub(crate) fn bytes(store: &BackingStore) -> &mut [u8] {
    match store.buffer_start() {
        Some(start) => unsafe { std::slice::from_raw_parts_mut(start.as_ptr(), store.byte_length()) },
        None => &mut [],
    }
}
