pub mod mmap;
pub mod vm;
