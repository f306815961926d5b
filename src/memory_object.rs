//! Memory-view objects: the handles through which code observes a backing
//! store.

use crate::backing_store::BackingStore;
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// A view of a [`BackingStore`] with a fixed byte length.
///
/// The store may grow underneath an `ArrayBuffer`; the buffer keeps reporting
/// the length it was created with until its owner swaps in a new one.
pub struct ArrayBuffer {
    backing_store: Arc<BackingStore>,
    byte_length: usize,
}

impl ArrayBuffer {
    /// Creates a view covering the store's current length.
    pub fn attach(backing_store: Arc<BackingStore>) -> Arc<ArrayBuffer> {
        let byte_length = backing_store.byte_length();
        Arc::new(ArrayBuffer {
            backing_store,
            byte_length,
        })
    }

    /// Creates a view of `byte_length` bytes, which must fit in the store's
    /// capacity.
    pub fn with_length(backing_store: Arc<BackingStore>, byte_length: usize) -> Arc<ArrayBuffer> {
        assert!(
            byte_length <= backing_store.byte_capacity(),
            "view of {byte_length:#x} bytes exceeds capacity {:#x}",
            backing_store.byte_capacity(),
        );
        Arc::new(ArrayBuffer {
            backing_store,
            byte_length,
        })
    }

    /// The length this view reports.
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// The store this view observes.
    pub fn backing_store(&self) -> &Arc<BackingStore> {
        &self.backing_store
    }
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayBuffer")
            .field("buffer_start", &self.backing_store.buffer_start())
            .field("byte_length", &self.byte_length)
            .finish()
    }
}

/// An object that exposes a shared WebAssembly memory to one engine instance.
///
/// Implementations are held weakly by the shared-memory link list; they are
/// told about growth performed by other instances through
/// [`MemoryObject::update_instances`].
pub trait MemoryObject: Send + Sync {
    /// Length of the view currently installed.
    fn buffer_byte_length(&self) -> usize;

    /// Replaces the installed view with `buffer`.
    ///
    /// Called without any registry lock held.
    fn update_instances(&self, buffer: Arc<ArrayBuffer>);
}

/// A [`MemoryObject`] whose current buffer can be read from any thread while
/// another thread replaces it.
pub struct WasmMemoryObject {
    buffer: ArcSwap<ArrayBuffer>,
}

impl WasmMemoryObject {
    /// Creates a memory object initially viewing `buffer`.
    pub fn new(buffer: Arc<ArrayBuffer>) -> Arc<WasmMemoryObject> {
        Arc::new(WasmMemoryObject {
            buffer: ArcSwap::from(buffer),
        })
    }

    /// The currently installed view.
    pub fn buffer(&self) -> Arc<ArrayBuffer> {
        self.buffer.load_full()
    }
}

impl MemoryObject for WasmMemoryObject {
    fn buffer_byte_length(&self) -> usize {
        self.buffer.load().byte_length()
    }

    fn update_instances(&self, buffer: Arc<ArrayBuffer>) {
        log::trace!(
            "memory object {:p} now views {:#x} bytes",
            self,
            buffer.byte_length()
        );
        self.buffer.store(buffer);
    }
}

impl fmt::Debug for WasmMemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmMemoryObject")
            .field("buffer", &**self.buffer.load())
            .finish()
    }
}
