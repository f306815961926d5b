//! Samples reported to the embedder's metrics sink.

use serde_derive::{Deserialize, Serialize};

/// Outcome of allocating a WebAssembly memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationStatus {
    /// Succeeded on the first try.
    Success,
    /// Succeeded after at least one memory pressure notification.
    SuccessAfterRetry,
    /// Failed because the address-space budget is exhausted.
    AddressSpaceLimitReachedFailure,
    /// Failed for any other reason.
    OtherFailure,
}

/// A single sample, passed to
/// [`EngineInstance::record`](crate::EngineInstance::record).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricEvent {
    /// Result of a WebAssembly memory allocation attempt.
    WasmMemoryAllocationResult(AllocationStatus),
    /// A buffer of at least one MiB was requested from the host allocator.
    ArrayBufferBigAllocation {
        /// Requested size in whole MiB.
        megabytes: usize,
    },
    /// A shared buffer was requested from the host allocator.
    SharedArrayAllocation {
        /// Requested size in whole MiB.
        megabytes: usize,
    },
    /// The host allocator failed a request.
    ArrayBufferNewSizeFailure {
        /// Requested size in whole MiB.
        megabytes: usize,
    },
}

pub(crate) const MB: usize = 1 << 20;
