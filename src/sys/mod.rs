//! OS-related abstractions required by the backing-store allocator.
//!
//! This module is intended to house all logic that's specific to either Unix
//! or Windows. Porting to a new platform should only require an extra block
//! below plus an implementation of the functions in `vm` and `mmap`.

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
        pub use windows::*;
    } else if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("the OS page allocator is not supported on this platform");
    }
}
