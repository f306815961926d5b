pub fn get_page_size() -> usize {
    rustix::param::page_size()
}

pub fn get_allocation_granularity() -> usize {
    // mmap hands out regions at page granularity on every Unix we support.
    get_page_size()
}
