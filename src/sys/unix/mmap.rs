use crate::mmap::Protection;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use std::io;
use std::ptr::{self, NonNull};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "illumos", target_os = "linux"))] {
        // Reservations are mostly inaccessible guard space which must never be
        // backed by swap, so ask the kernel not to account for it up front.
        const MMAP_NORESERVE_FLAG: MapFlags = MapFlags::NORESERVE;
    } else {
        const MMAP_NORESERVE_FLAG: MapFlags = MapFlags::empty();
    }
}

fn prot_flags(protection: Protection) -> ProtFlags {
    match protection {
        Protection::NoAccess => ProtFlags::empty(),
        Protection::ReadWrite => ProtFlags::READ | ProtFlags::WRITE,
    }
}

fn mprotect_flags(protection: Protection) -> MprotectFlags {
    match protection {
        Protection::NoAccess => MprotectFlags::empty(),
        Protection::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
    }
}

/// Maps `size` bytes of anonymous memory whose base is a multiple of
/// `alignment`.
///
/// When the requested alignment is coarser than the host page size the
/// mapping is over-allocated and the misaligned head and tail are unmapped
/// again.
pub fn map_anonymous(
    size: usize,
    alignment: usize,
    protection: Protection,
) -> io::Result<NonNull<u8>> {
    let page_size = super::vm::get_page_size();
    assert!(size > 0);
    assert!(alignment.is_power_of_two());
    let flags = MapFlags::PRIVATE | MMAP_NORESERVE_FLAG;

    if alignment <= page_size {
        let ptr = unsafe { mmap_anonymous(ptr::null_mut(), size, prot_flags(protection), flags)? };
        return NonNull::new(ptr.cast()).ok_or_else(|| io::ErrorKind::OutOfMemory.into());
    }

    let padded = size
        .checked_add(alignment - page_size)
        .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
    let base = unsafe { mmap_anonymous(ptr::null_mut(), padded, prot_flags(protection), flags)? };
    let base = base as usize;
    let aligned = (base + alignment - 1) & !(alignment - 1);

    let head = aligned - base;
    let tail = padded - head - size;
    unsafe {
        if head > 0 {
            munmap(base as *mut _, head)?;
        }
        if tail > 0 {
            munmap((aligned + size) as *mut _, tail)?;
        }
    }

    NonNull::new(aligned as *mut u8).ok_or_else(|| io::ErrorKind::OutOfMemory.into())
}

/// Changes the protection of an existing mapping.
///
/// # Safety
///
/// The range must lie within a mapping created by [`map_anonymous`] and
/// nothing may hold references into memory that becomes inaccessible.
pub unsafe fn protect(ptr: NonNull<u8>, len: usize, protection: Protection) -> io::Result<()> {
    unsafe {
        mprotect(ptr.as_ptr().cast(), len, mprotect_flags(protection))?;
    }

    // Dropping access also gives the physical pages back to the kernel so a
    // later commit observes zeroes again.
    #[cfg(target_os = "linux")]
    if protection == Protection::NoAccess {
        unsafe {
            rustix::mm::madvise(ptr.as_ptr().cast(), len, rustix::mm::Advice::LinuxDontNeed)?;
        }
    }

    Ok(())
}

/// Unmaps a range previously returned from [`map_anonymous`].
///
/// # Safety
///
/// No references into the range may outlive this call.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { munmap(ptr.as_ptr().cast(), len)? };
    Ok(())
}
