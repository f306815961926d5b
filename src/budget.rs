//! Process-wide accounting of reserved virtual address space.
//!
//! WebAssembly memories reserve far more address space than they ever commit
//! (a guarded memory reserves 10 GiB up front), so physical memory limits do
//! not stop a runaway program from exhausting the address space. Every
//! reservation made through the page allocator is therefore first charged
//! against an [`AddressSpaceBudget`] with a generous but finite ceiling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

const GIB: u64 = 1 << 30;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "mips64")] {
        /// MIPS64 has a user space of 2^40 bytes on most processors, so the
        /// ceiling needs to be smaller.
        pub const PLATFORM_ADDRESS_SPACE_LIMIT: u64 = 256 * GIB;
    } else if #[cfg(target_pointer_width = "64")] {
        /// 1 TiB plus 4 GiB.
        pub const PLATFORM_ADDRESS_SPACE_LIMIT: u64 = 1024 * GIB + 4 * GIB;
    } else {
        /// 3 GiB.
        pub const PLATFORM_ADDRESS_SPACE_LIMIT: u64 = 3 * GIB;
    }
}

/// A lock-free counter of reserved bytes with a fixed ceiling.
#[derive(Debug)]
pub struct AddressSpaceBudget {
    limit: u64,
    reserved: AtomicU64,
}

impl AddressSpaceBudget {
    /// Creates a budget that admits at most `limit` reserved bytes.
    pub const fn new(limit: u64) -> AddressSpaceBudget {
        AddressSpaceBudget {
            limit,
            reserved: AtomicU64::new(0),
        }
    }

    /// The budget shared by every engine that doesn't configure a private
    /// limit, capped at [`PLATFORM_ADDRESS_SPACE_LIMIT`].
    pub fn global() -> &'static Arc<AddressSpaceBudget> {
        static GLOBAL: OnceLock<Arc<AddressSpaceBudget>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(AddressSpaceBudget::new(PLATFORM_ADDRESS_SPACE_LIMIT)))
    }

    /// Attempts to charge `num_bytes` against this budget.
    ///
    /// Returns `false`, leaving the counter untouched, if doing so would take
    /// the total past the limit.
    pub fn reserve(&self, num_bytes: u64) -> bool {
        let mut old_count = self.reserved.load(Ordering::Relaxed);
        loop {
            if old_count > self.limit || self.limit - old_count < num_bytes {
                return false;
            }
            match self.reserved.compare_exchange_weak(
                old_count,
                old_count + num_bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => old_count = actual,
            }
        }
    }

    /// Returns `num_bytes` previously charged with [`AddressSpaceBudget::reserve`].
    ///
    /// # Panics
    ///
    /// Panics if more is released than is currently reserved; the counter is
    /// left unchanged in that case.
    pub fn release(&self, num_bytes: u64) {
        let result = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |old| {
                old.checked_sub(num_bytes)
            });
        if let Err(old) = result {
            panic!("releasing {num_bytes:#x} bytes of address space but only {old:#x} are reserved");
        }
    }

    /// Bytes currently reserved.
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    /// The ceiling of this budget.
    pub fn limit(&self) -> u64 {
        self.limit
    }
}
