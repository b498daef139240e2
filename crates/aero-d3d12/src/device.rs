//! Native descriptor-device seam.
//!
//! The allocators in this crate drive the native API through a deliberately
//! small trait: create a heap, write a descriptor into a CPU-visible slot,
//! and batch-copy slots into a shader-visible heap. A production backend
//! implements [`DescriptorDevice`] over the real driver interface; tests and
//! the hosted path use [`SoftwareDevice`], which stores descriptor contents
//! in plain vectors so they can be inspected.

use std::cell::{Cell, RefCell};

use hashbrown::HashMap;

use crate::resources::TextureViewId;
use crate::sampler::SamplerDesc;

/// The two descriptor heap types. They are entirely independent: each has
/// its own CPU staging pools and its own shader-visible allocator, and the
/// command list binds one current heap of each kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// CBV/SRV/UAV descriptors.
    View,
    /// Sampler descriptors.
    Sampler,
}

/// Opaque identity of a descriptor heap created by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapId(pub u32);

/// CPU-side address of one descriptor slot.
///
/// Valid for CPU-only heaps and for the CPU side of shader-visible heaps
/// (the copy destination when populating).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CpuDescriptorHandle {
    pub heap: HeapId,
    pub index: u32,
}

impl CpuDescriptorHandle {
    pub fn offset(self, count: u32) -> CpuDescriptorHandle {
        CpuDescriptorHandle {
            heap: self.heap,
            index: self.index + count,
        }
    }
}

/// GPU-side address of one descriptor slot in a shader-visible heap.
///
/// This is what gets bound as a root descriptor table base. Equality is
/// meaningful only while the heap generation that produced it is current;
/// the binding tracker resets any cached handles whenever heap pointers
/// change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuDescriptorHandle {
    pub heap: HeapId,
    pub index: u32,
}

/// Contents of one descriptor slot.
#[derive(Clone, Debug, PartialEq)]
pub enum DescriptorWrite {
    UniformBuffer { address: u64, size: u64 },
    ReadOnlyStorageBuffer { address: u64, size: u64 },
    StorageBuffer { address: u64, size: u64 },
    SampledTexture { view: TextureViewId },
    ReadOnlyStorageTexture { view: TextureViewId },
    StorageTexture { view: TextureViewId },
    Sampler(SamplerDesc),
}

/// Fatal, device-level allocation failure. Running out of shader-visible
/// heap *space* is not an error (the ring allocator signals it with `None`);
/// this type covers the driver refusing to create a heap at all.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("out of memory creating {kind:?} descriptor heap of {capacity} descriptors")]
    OutOfMemory { kind: HeapKind, capacity: u32 },
}

/// Minimal native descriptor-heap interface.
///
/// All methods take `&self`; implementations use interior mutability. The
/// write/copy calls are infallible: handing them an out-of-range slot is a
/// programming error in this crate, not a runtime condition.
pub trait DescriptorDevice {
    /// Create a CPU-only (staging) heap.
    fn create_cpu_heap(&self, kind: HeapKind, capacity: u32) -> Result<HeapId, DeviceError>;

    /// Create a shader-visible heap that can be bound to a command list.
    fn create_shader_visible_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<HeapId, DeviceError>;

    /// Release a heap. Outstanding handles into it must not be used again.
    fn destroy_heap(&self, heap: HeapId);

    /// Write one descriptor into a CPU-visible slot.
    fn write_descriptor(&self, dst: CpuDescriptorHandle, write: &DescriptorWrite);

    /// Copy `count` consecutive descriptors from a CPU heap into a
    /// shader-visible heap. One batched native call.
    fn copy_descriptors(&self, src: CpuDescriptorHandle, dst: CpuDescriptorHandle, count: u32);

    /// Page a retired heap out under memory pressure.
    fn evict_heap(&self, heap: HeapId);

    /// Bring an evicted heap back before reuse.
    fn make_resident(&self, heap: HeapId) -> Result<(), DeviceError>;
}

#[derive(Debug)]
struct SoftwareHeap {
    kind: HeapKind,
    shader_visible: bool,
    resident: bool,
    slots: Vec<Option<DescriptorWrite>>,
}

/// In-memory [`DescriptorDevice`] for tests and hosted use.
///
/// Descriptor contents are stored verbatim so tests can assert on what ended
/// up in which slot. Heap creation can be rationed with [`set_heap_budget`]
/// to exercise the fatal out-of-memory path deterministically.
///
/// [`set_heap_budget`]: SoftwareDevice::set_heap_budget
#[derive(Debug, Default)]
pub struct SoftwareDevice {
    heaps: RefCell<HashMap<u32, SoftwareHeap>>,
    next_heap: Cell<u32>,
    /// Remaining heap creations before `OutOfMemory`; `None` = unlimited.
    heap_budget: Cell<Option<u32>>,
    copy_calls: Cell<u64>,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of heap creations that will succeed from now on.
    pub fn set_heap_budget(&self, budget: Option<u32>) {
        self.heap_budget.set(budget);
    }

    /// Number of heaps currently alive (created and not destroyed).
    pub fn live_heap_count(&self) -> usize {
        self.heaps.borrow().len()
    }

    /// Number of batched `copy_descriptors` calls issued so far.
    pub fn descriptor_copy_count(&self) -> u64 {
        self.copy_calls.get()
    }

    pub fn heap_capacity(&self, heap: HeapId) -> Option<u32> {
        self.heaps
            .borrow()
            .get(&heap.0)
            .map(|h| h.slots.len() as u32)
    }

    pub fn is_resident(&self, heap: HeapId) -> Option<bool> {
        self.heaps.borrow().get(&heap.0).map(|h| h.resident)
    }

    /// The contents of one slot, if anything has been written there.
    pub fn descriptor_at(&self, handle: CpuDescriptorHandle) -> Option<DescriptorWrite> {
        self.heaps
            .borrow()
            .get(&handle.heap.0)
            .and_then(|h| h.slots.get(handle.index as usize))
            .and_then(|slot| slot.clone())
    }

    fn create_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<HeapId, DeviceError> {
        if let Some(budget) = self.heap_budget.get() {
            if budget == 0 {
                return Err(DeviceError::OutOfMemory { kind, capacity });
            }
            self.heap_budget.set(Some(budget - 1));
        }

        let id = self.next_heap.get();
        self.next_heap.set(id + 1);
        self.heaps.borrow_mut().insert(
            id,
            SoftwareHeap {
                kind,
                shader_visible,
                resident: true,
                slots: vec![None; capacity as usize],
            },
        );
        Ok(HeapId(id))
    }
}

impl DescriptorDevice for SoftwareDevice {
    fn create_cpu_heap(&self, kind: HeapKind, capacity: u32) -> Result<HeapId, DeviceError> {
        self.create_heap(kind, capacity, false)
    }

    fn create_shader_visible_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<HeapId, DeviceError> {
        self.create_heap(kind, capacity, true)
    }

    fn destroy_heap(&self, heap: HeapId) {
        self.heaps.borrow_mut().remove(&heap.0);
    }

    fn write_descriptor(&self, dst: CpuDescriptorHandle, write: &DescriptorWrite) {
        let mut heaps = self.heaps.borrow_mut();
        let heap = heaps
            .get_mut(&dst.heap.0)
            .unwrap_or_else(|| panic!("write to destroyed heap {:?}", dst.heap));
        debug_assert_eq!(
            heap.kind == HeapKind::Sampler,
            matches!(write, DescriptorWrite::Sampler(_)),
            "descriptor write kind does not match heap kind"
        );
        heap.slots[dst.index as usize] = Some(write.clone());
    }

    fn copy_descriptors(&self, src: CpuDescriptorHandle, dst: CpuDescriptorHandle, count: u32) {
        self.copy_calls.set(self.copy_calls.get() + 1);
        let mut heaps = self.heaps.borrow_mut();
        let copied: Vec<Option<DescriptorWrite>> = {
            let src_heap = heaps
                .get(&src.heap.0)
                .unwrap_or_else(|| panic!("copy from destroyed heap {:?}", src.heap));
            let start = src.index as usize;
            src_heap.slots[start..start + count as usize].to_vec()
        };
        let dst_heap = heaps
            .get_mut(&dst.heap.0)
            .unwrap_or_else(|| panic!("copy to destroyed heap {:?}", dst.heap));
        debug_assert!(dst_heap.shader_visible, "copy destination must be shader-visible");
        let start = dst.index as usize;
        dst_heap.slots[start..start + count as usize].clone_from_slice(&copied);
    }

    fn evict_heap(&self, heap: HeapId) {
        if let Some(h) = self.heaps.borrow_mut().get_mut(&heap.0) {
            h.resident = false;
        }
    }

    fn make_resident(&self, heap: HeapId) -> Result<(), DeviceError> {
        if let Some(h) = self.heaps.borrow_mut().get_mut(&heap.0) {
            h.resident = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_device_stores_and_copies_descriptors() {
        let device = SoftwareDevice::new();
        let cpu = device.create_cpu_heap(HeapKind::View, 8).unwrap();
        let gpu = device.create_shader_visible_heap(HeapKind::View, 8).unwrap();

        let write = DescriptorWrite::UniformBuffer {
            address: 0x1000,
            size: 256,
        };
        let src = CpuDescriptorHandle { heap: cpu, index: 3 };
        device.write_descriptor(src, &write);

        let dst = CpuDescriptorHandle { heap: gpu, index: 5 };
        device.copy_descriptors(src, dst, 1);

        assert_eq!(device.descriptor_at(dst), Some(write));
        assert_eq!(device.descriptor_at(CpuDescriptorHandle { heap: gpu, index: 4 }), None);
    }

    #[test]
    fn heap_budget_exhaustion_is_fatal() {
        let device = SoftwareDevice::new();
        device.set_heap_budget(Some(1));
        assert!(device.create_cpu_heap(HeapKind::View, 8).is_ok());
        assert!(matches!(
            device.create_cpu_heap(HeapKind::View, 8),
            Err(DeviceError::OutOfMemory { .. })
        ));
    }
}
