use crate::mmap::Protection;
use std::io;
use std::ptr::{self, NonNull};
use windows_sys::Win32::System::Memory::*;

/// Number of times an over-sized reservation is retried when another thread
/// steals the aligned address between releasing and re-reserving it.
const ALIGNED_RESERVE_ATTEMPTS: usize = 8;

unsafe fn virtual_alloc(
    address: *const u8,
    size: usize,
    protection: Protection,
) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        match protection {
            Protection::NoAccess => VirtualAlloc(address.cast(), size, MEM_RESERVE, PAGE_NOACCESS),
            Protection::ReadWrite => VirtualAlloc(
                address.cast(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            ),
        }
    };
    NonNull::new(ptr.cast()).ok_or_else(io::Error::last_os_error)
}

/// Reserves `size` bytes whose base is a multiple of `alignment`.
pub fn map_anonymous(
    size: usize,
    alignment: usize,
    protection: Protection,
) -> io::Result<NonNull<u8>> {
    assert!(size > 0);
    assert!(alignment.is_power_of_two());

    // `VirtualAlloc` already aligns to the allocation granularity (64 KiB).
    if alignment <= super::vm::get_allocation_granularity() {
        return unsafe { virtual_alloc(ptr::null(), size, protection) };
    }

    // Windows cannot release part of a reservation, so find an aligned
    // address inside a padded reservation, give it back, and reserve exactly
    // the aligned range.
    let padded = size
        .checked_add(alignment)
        .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
    for _ in 0..ALIGNED_RESERVE_ATTEMPTS {
        let probe = unsafe { virtual_alloc(ptr::null(), padded, Protection::NoAccess)? };
        let aligned = (probe.as_ptr() as usize + alignment - 1) & !(alignment - 1);
        unsafe {
            if VirtualFree(probe.as_ptr().cast(), 0, MEM_RELEASE) == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if let Ok(ptr) = unsafe { virtual_alloc(aligned as *const u8, size, protection) } {
            return Ok(ptr);
        }
    }
    Err(io::ErrorKind::OutOfMemory.into())
}

/// Commits or decommits pages of an existing reservation.
///
/// # Safety
///
/// The range must lie within a reservation created by [`map_anonymous`].
pub unsafe fn protect(ptr: NonNull<u8>, len: usize, protection: Protection) -> io::Result<()> {
    unsafe {
        match protection {
            Protection::ReadWrite => {
                if VirtualAlloc(ptr.as_ptr().cast(), len, MEM_COMMIT, PAGE_READWRITE).is_null() {
                    return Err(io::Error::last_os_error());
                }
            }
            Protection::NoAccess => {
                if VirtualFree(ptr.as_ptr().cast(), len, MEM_DECOMMIT) == 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
    }
    Ok(())
}

/// Releases a reservation previously returned from [`map_anonymous`].
///
/// # Safety
///
/// `ptr` must be the base of the reservation and no references into it may
/// outlive this call.
pub unsafe fn unmap(ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
    if unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
