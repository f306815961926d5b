use crate::metrics::AllocationStatus;
use std::io;
use thiserror::Error;

/// An error allocating a backing store.
///
/// None of these leave partial state behind: any address space reserved or
/// mapped before the failing step has been returned.
#[derive(Error, Debug)]
pub enum AllocationError {
    /// The requested initial size is larger than the engine allows.
    #[error("initial size of {pages} pages exceeds the engine limit of {limit} pages")]
    ExceedsEngineLimit {
        /// Requested initial size, in pages.
        pages: u64,
        /// The engine's maximum memory size, in pages.
        limit: u64,
    },

    /// The address-space budget could not cover the reservation.
    #[error("address space limit reached while reserving {bytes:#x} bytes")]
    AddressSpaceLimitReached {
        /// Size of the rejected reservation.
        bytes: u64,
    },

    /// The page allocator could not map the reservation.
    #[error("failed to map {bytes:#x} bytes of address space")]
    Mapping {
        /// Size of the attempted mapping.
        bytes: usize,
        /// The error from the final attempt.
        #[source]
        source: io::Error,
    },

    /// The embedder's buffer allocator returned no memory.
    #[error("host allocator failed to provide {bytes} bytes")]
    HostAllocator {
        /// Size of the failed request.
        bytes: usize,
    },

    /// A copied memory would not have the guard region policy of the memory
    /// it replaces.
    #[error("guard region policy of the new memory does not match the original")]
    GuardRegionMismatch,
}

impl AllocationError {
    /// How this failure is classified for allocation metrics.
    pub fn status(&self) -> AllocationStatus {
        match self {
            AllocationError::AddressSpaceLimitReached { .. } => {
                AllocationStatus::AddressSpaceLimitReachedFailure
            }
            _ => AllocationStatus::OtherFailure,
        }
    }
}

/// An error growing a WebAssembly memory in place.
///
/// The memory is unchanged when one of these is returned.
#[derive(Error, Debug)]
pub enum GrowError {
    /// The new length doesn't fit in the memory's reservation.
    #[error("cannot grow to {requested:#x} bytes, capacity is {capacity:#x} bytes")]
    ExceedsCapacity {
        /// The requested byte length.
        requested: usize,
        /// The memory's byte capacity.
        capacity: usize,
    },

    /// WebAssembly memories only grow by whole pages.
    #[error("cannot grow to {requested:#x} bytes, not a multiple of the page size")]
    Unaligned {
        /// The requested byte length.
        requested: usize,
    },

    /// The page allocator refused to make the new pages accessible.
    #[error("failed to commit {len:#x} bytes at offset {offset:#x}")]
    Commit {
        /// Offset of the first new byte from `buffer_start`.
        offset: usize,
        /// Number of bytes that were to be committed.
        len: usize,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
}
