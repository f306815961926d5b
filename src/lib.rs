//! Backing-store allocation for WebAssembly linear memories and host buffers.
//!
//! A [`BackingStore`] is the raw memory behind a buffer or a WebAssembly
//! memory. General-purpose buffers come from the embedder's
//! [`ArrayBufferAllocator`]. WebAssembly memories are reserved directly from
//! the operating system through a [`PageAllocator`], optionally surrounded by
//! guard regions so that generated code can elide bounds checks, and are
//! charged against a process-wide [`AddressSpaceBudget`].
//!
//! Shared WebAssembly memories can be observed from several
//! [`EngineInstance`]s at once. The [`GlobalBackingStoreRegistry`] tracks
//! every registered store and propagates growth performed by one instance to
//! the [`MemoryObject`]s of the others.
//!
//! ```ignore
//! let engine = Engine::new(&Config::new())?;
//! let store = BackingStore::allocate_wasm_memory(&instance, 1, 16, SharedFlag::Shared)?;
//! store.grow_wasm_memory_in_place(&instance, 2 * WASM_PAGE_SIZE)?;
//! store.broadcast_shared_wasm_memory_grow(&instance, 2 * WASM_PAGE_SIZE);
//! ```

#![deny(missing_docs)]

mod allocator;
mod backing_store;
mod budget;
mod config;
mod engine;
mod error;
mod guard;
mod instance;
mod memory_object;
mod metrics;
mod mmap;
mod registry;
mod retry;
mod shared_memory;
mod sys;

pub use crate::allocator::{ArrayBufferAllocator, DefaultArrayBufferAllocator};
pub use crate::backing_store::{BackingStore, InitializedFlag, SharedFlag};
pub use crate::budget::{AddressSpaceBudget, PLATFORM_ADDRESS_SPACE_LIMIT};
pub use crate::config::{Config, DEFAULT_ALLOCATION_ATTEMPTS, DEFAULT_MAX_MEMORY_PAGES};
pub use crate::engine::Engine;
pub use crate::error::{AllocationError, GrowError};
pub use crate::guard::{
    FULL_GUARD_SIZE, GIB, MemoryLayout, NEGATIVE_GUARD_SIZE, WASM_PAGE_SIZE, pages_to_bytes,
};
pub use crate::instance::{EngineInstance, InstanceId, MemoryPressureLevel};
pub use crate::memory_object::{ArrayBuffer, MemoryObject, WasmMemoryObject};
pub use crate::metrics::{AllocationStatus, MetricEvent};
pub use crate::mmap::{OsPageAllocator, PageAllocator, Protection, host_page_size};
pub use crate::registry::{GlobalBackingStoreRegistry, RegistryView};
pub use crate::retry::PressureRetry;
