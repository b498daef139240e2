//! Fixed-size block allocation of CPU-only descriptors.
//!
//! Bind groups and sampler cache entries keep a private CPU-visible copy of
//! their descriptors, written once at creation and batch-copied into the
//! current shader-visible heap whenever they are (re)populated. Those copies
//! come from here: each [`StagingDescriptorAllocator`] owns a growable pool
//! of CPU heaps, every heap subdivided into same-size blocks tracked by a
//! free-index list. Growth appends heaps; existing blocks never move.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::debug;

use crate::device::{CpuDescriptorHandle, DescriptorDevice, DeviceError, HeapId, HeapKind};
use crate::serial::{Serial, SerialQueue};

/// Pool sizing for staging heaps.
#[derive(Clone, Copy, Debug)]
pub struct StagingHeapOptions {
    /// Number of fixed-size blocks carved out of each CPU heap.
    pub blocks_per_heap: u32,
}

impl Default for StagingHeapOptions {
    fn default() -> Self {
        Self { blocks_per_heap: 32 }
    }
}

/// An owning reference to one block of CPU descriptors.
///
/// Cheap to copy, but ownership is logical: exactly one holder may pass a
/// block back to [`StagingDescriptorAllocator::deallocate`], after which
/// every copy is dangling. Transient blocks are deallocated by `tick` and
/// must not be returned manually.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuDescriptorBlock {
    pool_index: u32,
    native: HeapId,
    first: u32,
    count: u32,
}

impl CpuDescriptorBlock {
    /// Handle of the `i`-th descriptor in the block.
    pub fn handle(&self, i: u32) -> CpuDescriptorHandle {
        debug_assert!(i < self.count);
        CpuDescriptorHandle {
            heap: self.native,
            index: self.first + i,
        }
    }

    pub fn base(&self) -> CpuDescriptorHandle {
        CpuDescriptorHandle {
            heap: self.native,
            index: self.first,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Index of the owning heap in the allocator's pool.
    pub fn heap_index(&self) -> u32 {
        self.pool_index
    }
}

#[derive(Debug)]
struct StagingHeap {
    native: HeapId,
    /// Free block indices; popped from the back.
    free: Vec<u32>,
}

/// Allocator of fixed-size CPU descriptor blocks of one [`HeapKind`].
///
/// One instance serves one block size; the per-device registry
/// ([`StagingAllocators`]) keys instances by `(kind, block_size)`.
pub struct StagingDescriptorAllocator {
    device: Arc<dyn DescriptorDevice>,
    kind: HeapKind,
    block_size: u32,
    blocks_per_heap: u32,
    heaps: Vec<StagingHeap>,
    transient: SerialQueue<CpuDescriptorBlock>,
}

impl StagingDescriptorAllocator {
    pub fn new(
        device: Arc<dyn DescriptorDevice>,
        kind: HeapKind,
        block_size: u32,
        options: StagingHeapOptions,
    ) -> Self {
        assert!(block_size > 0, "staging block size must be nonzero");
        assert!(options.blocks_per_heap > 0);
        Self {
            device,
            kind,
            block_size,
            blocks_per_heap: options.blocks_per_heap,
            heaps: Vec::new(),
            transient: SerialQueue::new(),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Allocate one block, growing the pool by one heap if every existing
    /// heap is full. Fails only if native heap creation fails.
    pub fn allocate(&mut self) -> Result<CpuDescriptorBlock, DeviceError> {
        let pool_index = match self.heaps.iter().position(|h| !h.free.is_empty()) {
            Some(i) => i,
            None => self.grow()?,
        };
        let heap = &mut self.heaps[pool_index];
        let block_index = heap.free.pop().expect("heap with free blocks");
        Ok(CpuDescriptorBlock {
            pool_index: pool_index as u32,
            native: heap.native,
            first: block_index * self.block_size,
            count: self.block_size,
        })
    }

    /// Allocate a block that is automatically returned once `pending` has
    /// completed (drained by [`tick`]). The caller must not deallocate it.
    ///
    /// [`tick`]: StagingDescriptorAllocator::tick
    pub fn allocate_transient(&mut self, pending: Serial) -> Result<CpuDescriptorBlock, DeviceError> {
        let block = self.allocate()?;
        self.transient.enqueue(pending, block);
        Ok(block)
    }

    /// Return `block` to its heap's free list.
    pub fn deallocate(&mut self, block: CpuDescriptorBlock) {
        debug_assert_eq!(block.count, self.block_size);
        let heap = &mut self.heaps[block.pool_index as usize];
        debug_assert_eq!(heap.native, block.native);
        let block_index = block.first / self.block_size;
        debug_assert!(
            !heap.free.contains(&block_index),
            "double free of staging descriptor block"
        );
        heap.free.push(block_index);
    }

    /// Release every transient block whose serial has completed.
    pub fn tick(&mut self, completed: Serial) {
        for block in self.transient.drain_completed(completed) {
            self.deallocate(block);
        }
    }

    fn grow(&mut self) -> Result<usize, DeviceError> {
        let capacity = self.blocks_per_heap * self.block_size;
        let native = self.device.create_cpu_heap(self.kind, capacity)?;
        debug!(
            kind = ?self.kind,
            block_size = self.block_size,
            pool_size = self.heaps.len() + 1,
            "grew staging descriptor pool"
        );
        // Reversed so the first pop hands out block 0.
        self.heaps.push(StagingHeap {
            native,
            free: (0..self.blocks_per_heap).rev().collect(),
        });
        Ok(self.heaps.len() - 1)
    }
}

impl Drop for StagingDescriptorAllocator {
    fn drop(&mut self) {
        for heap in &self.heaps {
            self.device.destroy_heap(heap.native);
        }
    }
}

/// Per-device registry of staging allocators, keyed by block size.
///
/// Shared behind `Arc<Mutex<…>>` by everything that must return blocks on
/// drop (bind groups, sampler cache entries).
pub struct StagingAllocators {
    device: Arc<dyn DescriptorDevice>,
    options: StagingHeapOptions,
    view: HashMap<u32, StagingDescriptorAllocator>,
    sampler: HashMap<u32, StagingDescriptorAllocator>,
}

impl StagingAllocators {
    pub fn new(device: Arc<dyn DescriptorDevice>, options: StagingHeapOptions) -> Self {
        Self {
            device,
            options,
            view: HashMap::new(),
            sampler: HashMap::new(),
        }
    }

    fn pool_mut(&mut self, kind: HeapKind, block_size: u32) -> &mut StagingDescriptorAllocator {
        let map = match kind {
            HeapKind::View => &mut self.view,
            HeapKind::Sampler => &mut self.sampler,
        };
        map.entry(block_size).or_insert_with(|| {
            StagingDescriptorAllocator::new(self.device.clone(), kind, block_size, self.options)
        })
    }

    pub fn allocate(
        &mut self,
        kind: HeapKind,
        block_size: u32,
    ) -> Result<CpuDescriptorBlock, DeviceError> {
        self.pool_mut(kind, block_size).allocate()
    }

    pub fn allocate_transient(
        &mut self,
        kind: HeapKind,
        block_size: u32,
        pending: Serial,
    ) -> Result<CpuDescriptorBlock, DeviceError> {
        self.pool_mut(kind, block_size).allocate_transient(pending)
    }

    pub fn deallocate(&mut self, kind: HeapKind, block: CpuDescriptorBlock) {
        self.pool_mut(kind, block.count()).deallocate(block);
    }

    pub fn tick(&mut self, completed: Serial) {
        for allocator in self.view.values_mut().chain(self.sampler.values_mut()) {
            allocator.tick(completed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;

    fn allocator(blocks_per_heap: u32, block_size: u32) -> StagingDescriptorAllocator {
        StagingDescriptorAllocator::new(
            Arc::new(SoftwareDevice::new()),
            HeapKind::View,
            block_size,
            StagingHeapOptions { blocks_per_heap },
        )
    }

    #[test]
    fn fills_heaps_in_order() {
        // Heap capacity 3 blocks, block size 4 descriptors: seven allocations
        // land on heaps [0, 0, 0, 1, 1, 1, 2].
        let mut alloc = allocator(3, 4);
        let heap_indices: Vec<u32> = (0..7)
            .map(|_| alloc.allocate().unwrap().heap_index())
            .collect();
        assert_eq!(heap_indices, [0, 0, 0, 1, 1, 1, 2]);
        assert_eq!(alloc.heap_count(), 3);
    }

    #[test]
    fn deallocated_blocks_are_reused_without_growth() {
        let mut alloc = allocator(4, 2);
        let first: Vec<_> = (0..8).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(alloc.heap_count(), 2);

        let mut first_slots: Vec<_> = first.iter().map(|b| (b.heap_index(), b.base())).collect();
        for block in first {
            alloc.deallocate(block);
        }

        let mut second_slots: Vec<_> = (0..8)
            .map(|_| {
                let b = alloc.allocate().unwrap();
                (b.heap_index(), b.base())
            })
            .collect();
        assert_eq!(alloc.heap_count(), 2);

        // Same slots, possibly permuted.
        first_slots.sort_by_key(|(h, base)| (*h, base.index));
        second_slots.sort_by_key(|(h, base)| (*h, base.index));
        assert_eq!(first_slots, second_slots);
    }

    #[test]
    fn transient_blocks_return_on_tick() {
        let mut alloc = allocator(2, 4);
        let a = alloc.allocate_transient(Serial(1)).unwrap();
        let _b = alloc.allocate_transient(Serial(2)).unwrap();

        alloc.tick(Serial(1));
        // Block `a` is free again and is handed back out first (LIFO reuse).
        let c = alloc.allocate().unwrap();
        assert_eq!(c.base(), a.base());

        alloc.tick(Serial(2));
        assert_eq!(alloc.heap_count(), 1);
    }
}
