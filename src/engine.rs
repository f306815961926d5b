use crate::budget::AddressSpaceBudget;
use crate::config::Config;
use crate::guard::MemoryLayout;
use crate::mmap::{OsPageAllocator, PageAllocator};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;

/// An `Engine` bundles the settings and platform capabilities shared by every
/// backing store allocated on behalf of its instances.
///
/// Cloning an engine is cheap; all clones refer to the same state. Every
/// WebAssembly memory keeps its engine alive so that teardown returns the
/// reservation to the same budget and unmaps through the same page allocator
/// it was allocated from.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    budget: Arc<AddressSpaceBudget>,
    page_allocator: Arc<dyn PageAllocator>,
}

impl Engine {
    /// Creates a new engine from `config`, allocating pages directly from the
    /// operating system.
    ///
    /// Returns an error if the configuration is invalid for this host.
    pub fn new(config: &Config) -> Result<Engine> {
        Engine::with_page_allocator(config, Arc::new(OsPageAllocator))
    }

    /// Creates a new engine that maps WebAssembly memories through
    /// `page_allocator`.
    pub fn with_page_allocator(
        config: &Config,
        page_allocator: Arc<dyn PageAllocator>,
    ) -> Result<Engine> {
        config.validate()?;
        let budget = match config.address_space_limit {
            Some(limit) => Arc::new(AddressSpaceBudget::new(limit)),
            None => AddressSpaceBudget::global().clone(),
        };
        log::debug!(
            "creating engine: guard regions {}, max memory pages {}, address space limit {:#x}",
            config.guard_regions,
            config.max_memory_pages,
            budget.limit(),
        );
        Ok(Engine {
            inner: Arc::new(EngineInner {
                config: config.clone(),
                budget,
                page_allocator,
            }),
        })
    }

    /// Returns the configuration settings that this engine is using.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The address-space budget reservations are charged against.
    pub fn budget(&self) -> &Arc<AddressSpaceBudget> {
        &self.inner.budget
    }

    /// The page allocator WebAssembly memories are mapped through.
    pub fn page_allocator(&self) -> &dyn PageAllocator {
        &*self.inner.page_allocator
    }

    /// Whether memories allocated by this engine carry guard regions.
    pub fn guard_regions(&self) -> bool {
        self.inner.config.guard_regions
    }

    /// The hard limit on WebAssembly memory size, in pages.
    pub fn max_memory_pages(&self) -> u64 {
        self.inner.config.max_memory_pages
    }

    /// Computes the layout of a memory that may grow to `maximum_pages`.
    pub(crate) fn memory_layout(&self, maximum_pages: u64) -> MemoryLayout {
        let engine_max = self.max_memory_pages();
        let layout = if self.guard_regions() {
            MemoryLayout::guarded(engine_max)
        } else {
            MemoryLayout::unguarded(maximum_pages, engine_max)
        };
        // Both shapes were checked by `Config::validate`.
        layout.expect("memory layout validated at engine creation")
    }

    /// Returns whether `a` and `b` refer to the same engine.
    pub fn same(a: &Engine, b: &Engine) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new(&Config::default()).expect("default configuration is valid")
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("budget", &self.inner.budget)
            .finish_non_exhaustive()
    }
}
