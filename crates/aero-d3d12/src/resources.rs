//! Frontend resource stand-ins referenced by bind group descriptors.
//!
//! The real frontend owns fully validated buffer/texture objects; this
//! subsystem only needs their identity, their GPU virtual address, and
//! whether the backing native resource has been destroyed out from under a
//! still-live handle (which is legal: bind groups referencing a destroyed
//! resource skip the descriptor write and are rejected at submission
//! validation, not here).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureViewId(pub u64);

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_BUFFER_VA: AtomicU64 = AtomicU64::new(0x1_0000_0000);

/// A buffer as seen by this subsystem: identity + GPU virtual address.
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    gpu_va: u64,
    size: u64,
    destroyed: AtomicBool,
}

impl Buffer {
    pub fn new(size: u64) -> Arc<Buffer> {
        // Synthetic 64KiB-aligned placement addresses; real backends get
        // these from the driver.
        let aligned = (size + 0xFFFF) & !0xFFFF;
        Arc::new(Buffer {
            id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            gpu_va: NEXT_BUFFER_VA.fetch_add(aligned.max(0x1_0000), Ordering::Relaxed),
            size,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn gpu_va(&self) -> u64 {
        self.gpu_va
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Release the native resource while handles may still be live.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// A texture view by identity; contents are irrelevant to descriptor
/// lifetime management.
#[derive(Debug)]
pub struct TextureView {
    id: TextureViewId,
    destroyed: AtomicBool,
}

impl TextureView {
    pub fn new() -> Arc<TextureView> {
        Arc::new(TextureView {
            id: TextureViewId(NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed)),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> TextureViewId {
        self.id
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}
