use crate::guard::{DEFAULT_GUARD_REGIONS, MemoryLayout, WASM_PAGE_SIZE, pages_to_bytes};
use crate::mmap::host_page_size;
use anyhow::{Result, bail};
use serde_derive::{Deserialize, Serialize};

/// The default engine limit on a WebAssembly memory, in pages (4 GiB).
pub const DEFAULT_MAX_MEMORY_PAGES: u64 = 65536;

/// The default number of attempts made by each allocation phase.
pub const DEFAULT_ALLOCATION_ATTEMPTS: u32 = 3;

/// Global configuration options used to create an [`Engine`](crate::Engine)
/// and customize how it allocates memory.
///
/// This structure exposes a builder-like interface and is primarily consumed
/// by [`Engine::new()`](crate::Engine::new). It can also be deserialized, so
/// hosts may keep these settings in a configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub(crate) guard_regions: bool,
    pub(crate) max_memory_pages: u64,
    pub(crate) address_space_limit: Option<u64>,
    pub(crate) allocation_attempts: u32,
}

impl Config {
    /// Creates a new configuration object with the default configuration
    /// specified.
    pub fn new() -> Config {
        Config {
            guard_regions: DEFAULT_GUARD_REGIONS,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
            address_space_limit: None,
            allocation_attempts: DEFAULT_ALLOCATION_ATTEMPTS,
        }
    }

    /// Configures whether WebAssembly memories are surrounded by guard
    /// regions.
    ///
    /// Guarded memories always reserve 10 GiB of address space, 2 GiB of
    /// which precede the buffer, so code generators may omit bounds checks.
    /// Unguarded memories reserve only their maximum size.
    ///
    /// By default this is `true` on 64-bit hosts and `false` elsewhere.
    pub fn guard_regions(&mut self, enable: bool) -> &mut Self {
        self.guard_regions = enable;
        self
    }

    /// Configures the hard engine limit on the size of a WebAssembly memory,
    /// in 64 KiB pages.
    ///
    /// Requests whose initial size exceeds this fail immediately, and
    /// requested maximums are clamped to it. With guard regions enabled this
    /// is also the usable capacity of every memory.
    ///
    /// By default this is 65536 pages (4 GiB).
    pub fn max_memory_pages(&mut self, pages: u64) -> &mut Self {
        self.max_memory_pages = pages;
        self
    }

    /// Gives engines created from this configuration a private address-space
    /// budget of `limit` bytes instead of sharing the process-wide one.
    ///
    /// By default the process-wide budget is used.
    pub fn address_space_limit(&mut self, limit: Option<u64>) -> &mut Self {
        self.address_space_limit = limit;
        self
    }

    /// Configures how many times each phase of a WebAssembly memory
    /// allocation is attempted. A memory pressure notification is sent to the
    /// requesting instance after every failed attempt.
    ///
    /// By default this is 3.
    pub fn allocation_attempts(&mut self, attempts: u32) -> &mut Self {
        self.allocation_attempts = attempts;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.allocation_attempts == 0 {
            bail!("allocation attempts must be at least 1");
        }
        if pages_to_bytes(self.max_memory_pages).is_none() {
            bail!(
                "maximum memory size of {} pages does not fit in the host address space",
                self.max_memory_pages
            );
        }
        if WASM_PAGE_SIZE % host_page_size() != 0 {
            bail!(
                "host page size {:#x} does not divide the wasm page size",
                host_page_size()
            );
        }
        if self.guard_regions && MemoryLayout::guarded(self.max_memory_pages).is_none() {
            bail!(
                "guard regions cannot accommodate memories of {} pages on this host",
                self.max_memory_pages
            );
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
