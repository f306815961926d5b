//! Address-space layout of WebAssembly memories.
//!
//! With guard regions every memory gets the same 10 GiB reservation:
//!
//! ```text
//! |xxx(2GiB)xxx|.......(4GiB)..xxxxx|xxxxxx(4GiB)xxxxxx|
//!              ^ buffer_start
//!                              ^ byte_length
//! ^ negative guard region           ^ positive guard region
//! ```
//!
//! Any access computed from a 32-bit index plus a small constant offset lands
//! either inside the usable region or inside one of the inaccessible guards,
//! which lets generated code skip explicit bounds checks. Without guard
//! regions the reservation is exactly the maximum size the memory may grow to
//! and consumers must bounds-check every access.

use std::ops::Range;

/// Size of a WebAssembly page.
pub const WASM_PAGE_SIZE: usize = 0x10000;

/// Bytes in a gibibyte.
pub const GIB: u64 = 1 << 30;

/// Inaccessible bytes reserved immediately before `buffer_start`.
pub const NEGATIVE_GUARD_SIZE: u64 = 2 * GIB;

/// Total size of a guarded reservation, including both guards.
pub const FULL_GUARD_SIZE: u64 = 10 * GIB;

/// Whether guard regions are used by default on this target.
pub const DEFAULT_GUARD_REGIONS: bool = cfg!(target_pointer_width = "64");

/// Converts a WebAssembly page count to a byte count, if it fits in `usize`.
pub fn pages_to_bytes(pages: u64) -> Option<usize> {
    pages
        .checked_mul(WASM_PAGE_SIZE as u64)
        .and_then(|bytes| usize::try_from(bytes).ok())
}

/// How a single WebAssembly memory is laid out within its reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Bytes charged against the address-space budget and mapped.
    pub reservation_size: usize,
    /// Offset of `buffer_start` from the base of the reservation.
    pub pre_guard_size: usize,
    /// The most the memory can grow to without being reallocated.
    pub byte_capacity: usize,
    /// Whether the reservation carries guard regions.
    pub has_guard_regions: bool,
}

impl MemoryLayout {
    /// The guarded layout: a full 10 GiB reservation whose usable region is
    /// the engine's maximum memory size, regardless of the memory's own
    /// declared maximum.
    ///
    /// Returns `None` if the layout cannot be expressed on this host or the
    /// usable region would overlap the negative guard's budget.
    pub fn guarded(engine_max_pages: u64) -> Option<MemoryLayout> {
        let reservation_size = usize::try_from(FULL_GUARD_SIZE).ok()?;
        let pre_guard_size = usize::try_from(NEGATIVE_GUARD_SIZE).ok()?;
        let byte_capacity = pages_to_bytes(engine_max_pages)?;
        if byte_capacity > reservation_size - pre_guard_size {
            return None;
        }
        Some(MemoryLayout {
            reservation_size,
            pre_guard_size,
            byte_capacity,
            has_guard_regions: true,
        })
    }

    /// The unguarded layout: the reservation is the memory's maximum size,
    /// clamped to the engine's maximum.
    pub fn unguarded(maximum_pages: u64, engine_max_pages: u64) -> Option<MemoryLayout> {
        let reservation_size = pages_to_bytes(maximum_pages.min(engine_max_pages))?;
        Some(MemoryLayout {
            reservation_size,
            pre_guard_size: 0,
            byte_capacity: reservation_size,
            has_guard_regions: false,
        })
    }

    /// Size of the inaccessible region following the usable one.
    pub fn post_guard_size(&self) -> usize {
        self.reservation_size - self.pre_guard_size - self.byte_capacity
    }

    /// Bytes that were charged to the address-space budget for a memory with
    /// this shape.
    pub fn reservation_bytes(has_guard_regions: bool, byte_capacity: usize) -> u64 {
        if has_guard_regions {
            FULL_GUARD_SIZE
        } else {
            byte_capacity as u64
        }
    }

    /// Recovers the full reserved address range of a memory from its
    /// `buffer_start` address.
    pub fn reserved_region(
        buffer_start: usize,
        byte_capacity: usize,
        has_guard_regions: bool,
    ) -> Range<usize> {
        if has_guard_regions {
            // Only constructible where these fit in `usize`.
            let start = buffer_start - NEGATIVE_GUARD_SIZE as usize;
            start..start + FULL_GUARD_SIZE as usize
        } else {
            buffer_start..buffer_start + byte_capacity
        }
    }
}
