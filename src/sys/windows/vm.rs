use std::mem::MaybeUninit;
use windows_sys::Win32::System::SystemInformation::*;

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info = MaybeUninit::uninit();
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init()
    }
}

pub fn get_page_size() -> usize {
    system_info().dwPageSize as usize
}

pub fn get_allocation_granularity() -> usize {
    system_info().dwAllocationGranularity as usize
}
