use crate::allocator::ArrayBufferAllocator;
use crate::engine::Engine;
use crate::metrics::MetricEvent;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A process-unique identifier for an [`EngineInstance`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Allocates a fresh identifier.
    pub fn next() -> InstanceId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        InstanceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw value of this identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// How urgently an instance is asked to give memory back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryPressureLevel {
    /// No pressure.
    None,
    /// Reclaim what is cheap to reclaim.
    Moderate,
    /// An allocation is failing; reclaim everything possible now.
    Critical,
}

/// An independent execution context that allocates backing stores and owns
/// memory-view objects.
///
/// This is the allocator's only window into the embedding runtime: it supplies
/// the host buffer allocator and forwards pressure signals to the garbage
/// collector. Implementations must be cheap to call and must not call back
/// into the global registry from [`EngineInstance::request_grow_shared_memory`],
/// which may run while the registry is being updated on another thread.
pub trait EngineInstance: Send + Sync {
    /// The identifier used to match link nodes to their owner.
    fn id(&self) -> InstanceId;

    /// The engine WebAssembly memories are allocated from.
    fn engine(&self) -> &Engine;

    /// The allocator used for general-purpose buffers.
    fn array_buffer_allocator(&self) -> Arc<dyn ArrayBufferAllocator>;

    /// Asks the garbage collector to reclaim memory. Called between failed
    /// allocation attempts; it should free what it can before returning.
    fn request_reclamation(&self, level: MemoryPressureLevel);

    /// Records that `delta` bytes of memory outside the managed heap became
    /// reachable (positive) or were freed (negative).
    fn adjust_external_memory(&self, delta: i64) {
        let _ = delta;
    }

    /// Records a metrics sample.
    fn record(&self, event: MetricEvent) {
        let _ = event;
    }

    /// Signals that a shared memory this instance observes has grown on
    /// another instance. The instance is expected to call
    /// [`GlobalBackingStoreRegistry::update_shared_wasm_memory_objects`](crate::GlobalBackingStoreRegistry::update_shared_wasm_memory_objects)
    /// at its next opportunity.
    fn request_grow_shared_memory(&self);
}
