//! Ring allocation out of the currently bound shader-visible heap.
//!
//! Only one shader-visible heap of each kind can be bound to a command list,
//! and the hardware caps its size, so allocations are served from a single
//! "current" heap per kind. When it fills up, the caller switches to a fresh
//! heap ([`ShaderVisibleDescriptorAllocator::allocate_and_switch_heap`]) and
//! the generation counter bumps, invalidating every allocation made
//! against the previous heap in O(1) with no per-allocation bookkeeping.
//!
//! Retired heaps park in a FIFO pool keyed by the submission serial that was
//! pending when they were retired; a heap is recycled only once that serial
//! has completed, and only in retirement order.

use std::sync::Arc;

use tracing::debug;

use crate::device::{CpuDescriptorHandle, DescriptorDevice, DeviceError, GpuDescriptorHandle, HeapId, HeapKind};
use crate::residency::{Pageable, ResidencySet};
use crate::serial::{Serial, SerialQueue};

/// Generation counter for the current shader-visible heap of one kind.
///
/// Version 0 means "no heap has ever been bound"; the first switch moves to
/// version 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HeapVersion(pub u64);

impl HeapVersion {
    pub const NONE: HeapVersion = HeapVersion(0);
}

/// A range of descriptors in a shader-visible heap, valid exactly while the
/// version it was allocated against is still the allocator's current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuDescriptorAllocation {
    base: GpuDescriptorHandle,
    count: u32,
    version: HeapVersion,
}

impl GpuDescriptorAllocation {
    /// An allocation that no version check will ever accept.
    pub const INVALID: GpuDescriptorAllocation = GpuDescriptorAllocation {
        base: GpuDescriptorHandle {
            heap: HeapId(u32::MAX),
            index: 0,
        },
        count: 0,
        version: HeapVersion::NONE,
    };

    pub fn base(&self) -> GpuDescriptorHandle {
        self.base
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn version(&self) -> HeapVersion {
        self.version
    }
}

/// Sizing policy for one kind's shader-visible heaps.
#[derive(Clone, Copy, Debug)]
pub struct ShaderVisibleHeapOptions {
    /// Capacity of the first heap created.
    pub initial_capacity: u32,
    /// Hard platform cap; growth doubles up to this.
    pub max_capacity: u32,
}

impl ShaderVisibleHeapOptions {
    /// Defaults matching D3D12 tier limits: a million view descriptors,
    /// 2048 samplers.
    pub fn for_kind(kind: HeapKind) -> Self {
        match kind {
            HeapKind::View => Self {
                initial_capacity: 4096,
                max_capacity: 1_000_000,
            },
            HeapKind::Sampler => Self {
                initial_capacity: 512,
                max_capacity: 2048,
            },
        }
    }
}

/// Counters for heap churn, mostly for tests and diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderVisibleStats {
    pub allocations: u64,
    pub switches: u64,
    pub heaps_created: u64,
    pub heaps_recycled: u64,
    pub heaps_evicted: u64,
}

/// Slot-granular cursor into the current heap.
///
/// Descriptor slots need no alignment, so this is a bump cursor: space frees
/// wholesale when the heap is switched out, never piecemeal.
#[derive(Clone, Copy, Debug, Default)]
struct DescriptorArena {
    capacity: u32,
    cursor: u32,
}

impl DescriptorArena {
    fn new(capacity: u32) -> Self {
        Self { capacity, cursor: 0 }
    }

    fn remaining(&self) -> u32 {
        self.capacity - self.cursor
    }

    fn alloc(&mut self, count: u32) -> Option<u32> {
        debug_assert!(count > 0);
        if count > self.remaining() {
            return None;
        }
        let first = self.cursor;
        self.cursor += count;
        Some(first)
    }
}

struct ShaderVisibleHeap {
    native: HeapId,
    capacity: u32,
    pageable: Pageable,
}

/// Allocator over the one currently bound shader-visible heap of one kind.
pub struct ShaderVisibleDescriptorAllocator {
    device: Arc<dyn DescriptorDevice>,
    kind: HeapKind,
    options: ShaderVisibleHeapOptions,
    current: Option<ShaderVisibleHeap>,
    arena: DescriptorArena,
    version: HeapVersion,
    /// Retired heaps in retirement order, keyed by the serial pending when
    /// each was retired.
    pool: SerialQueue<ShaderVisibleHeap>,
    /// Retired heaps eligible for eviction, oldest first.
    residency: ResidencySet,
    stats: ShaderVisibleStats,
}

impl ShaderVisibleDescriptorAllocator {
    pub fn new(device: Arc<dyn DescriptorDevice>, kind: HeapKind) -> Self {
        Self::with_options(device, kind, ShaderVisibleHeapOptions::for_kind(kind))
    }

    pub fn with_options(
        device: Arc<dyn DescriptorDevice>,
        kind: HeapKind,
        options: ShaderVisibleHeapOptions,
    ) -> Self {
        assert!(options.initial_capacity > 0);
        assert!(options.max_capacity >= options.initial_capacity);
        Self {
            device,
            kind,
            options,
            current: None,
            arena: DescriptorArena::default(),
            version: HeapVersion::NONE,
            pool: SerialQueue::new(),
            residency: ResidencySet::new(),
            stats: ShaderVisibleStats::default(),
        }
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn heap_version(&self) -> HeapVersion {
        self.version
    }

    /// The heap a command list must bind to consume allocations, once any
    /// switch has happened.
    pub fn current_heap(&self) -> Option<HeapId> {
        self.current.as_ref().map(|h| h.native)
    }

    pub fn stats(&self) -> ShaderVisibleStats {
        self.stats
    }

    /// Try to allocate `count` contiguous slots in the current heap.
    ///
    /// `None` is the exhaustion signal (also returned before the first heap
    /// switch): the caller switches heaps and retries. It is never an error.
    /// `pending` is recorded as the heap's last-use serial so the heap can be
    /// recycled once that submission completes.
    pub fn allocate_gpu_descriptors(
        &mut self,
        count: u32,
        pending: Serial,
    ) -> Option<(CpuDescriptorHandle, GpuDescriptorAllocation)> {
        let heap = self.current.as_mut()?;
        let first = self.arena.alloc(count)?;
        heap.pageable.set_last_usage(pending);
        self.stats.allocations += 1;
        Some((
            CpuDescriptorHandle {
                heap: heap.native,
                index: first,
            },
            GpuDescriptorAllocation {
                base: GpuDescriptorHandle {
                    heap: heap.native,
                    index: first,
                },
                count,
                version: self.version,
            },
        ))
    }

    /// `true` iff `allocation` was made against the current heap generation.
    pub fn is_allocation_still_valid(&self, allocation: &GpuDescriptorAllocation) -> bool {
        allocation.version == self.version && self.version != HeapVersion::NONE
    }

    /// Retire the current heap and make a fresh one current, bumping the
    /// generation.
    ///
    /// The pool is reclaimed strictly oldest-first: the heap at the front is
    /// reused iff its retirement serial has completed; otherwise a new heap
    /// is created (doubling capacity up to the platform cap). Fails only on
    /// native allocation failure.
    pub fn allocate_and_switch_heap(
        &mut self,
        pending: Serial,
        completed: Serial,
    ) -> Result<(), DeviceError> {
        debug_assert!(
            pending > completed,
            "pending serial must not already have completed"
        );

        let next_capacity = match &self.current {
            Some(heap) => (heap.capacity.saturating_mul(2)).min(self.options.max_capacity),
            None => self.options.initial_capacity,
        };

        if let Some(mut heap) = self.current.take() {
            heap.pageable.decrement_residency_lock();
            heap.pageable.set_last_submission(pending);
            heap.pageable.set_in_residency_lru(true);
            self.residency.touch(heap.native);
            self.pool.enqueue(pending, heap);
        }

        let mut heap = match self.pool.pop_completed(completed) {
            Some(mut heap) => {
                self.residency.remove(heap.native);
                heap.pageable.set_in_residency_lru(false);
                self.device.make_resident(heap.native)?;
                self.stats.heaps_recycled += 1;
                debug!(kind = ?self.kind, heap = ?heap.native, "recycled shader-visible heap");
                heap
            }
            None => {
                let native = self
                    .device
                    .create_shader_visible_heap(self.kind, next_capacity)?;
                self.stats.heaps_created += 1;
                debug!(
                    kind = ?self.kind,
                    heap = ?native,
                    capacity = next_capacity,
                    "created shader-visible heap"
                );
                ShaderVisibleHeap {
                    native,
                    capacity: next_capacity,
                    pageable: Pageable::new(),
                }
            }
        };

        heap.pageable.increment_residency_lock();
        self.arena = DescriptorArena::new(heap.capacity);
        self.version = HeapVersion(self.version.0 + 1);
        self.current = Some(heap);
        self.stats.switches += 1;
        Ok(())
    }

    /// Completion-tracking hook, called once per completed-serial advance.
    ///
    /// Recycle eligibility is evaluated against the completed serial passed
    /// to [`allocate_and_switch_heap`], so there is nothing to drain here;
    /// the hook exists so the device tick fans out uniformly.
    ///
    /// [`allocate_and_switch_heap`]: ShaderVisibleDescriptorAllocator::allocate_and_switch_heap
    pub fn tick(&mut self, _completed: Serial) {}

    /// Page out retired heaps the GPU is done with, oldest first.
    ///
    /// Returns the number of heaps evicted. Locked heaps (the current one)
    /// are never candidates because they are not in the pool.
    pub fn evict_retired(&mut self, completed: Serial, max_evictions: usize) -> usize {
        let mut evicted = 0;
        for (_, heap) in self.pool.iter_mut() {
            if evicted == max_evictions {
                break;
            }
            if !heap.pageable.is_retired(completed) {
                // Pool order is retirement order; everything behind this
                // heap is younger still.
                break;
            }
            if !heap.pageable.is_in_residency_lru() {
                continue; // already evicted
            }
            debug_assert!(!heap.pageable.is_residency_locked());
            self.device.evict_heap(heap.native);
            heap.pageable.set_in_residency_lru(false);
            self.residency.remove(heap.native);
            self.stats.heaps_evicted += 1;
            evicted += 1;
        }
        evicted
    }
}

impl Drop for ShaderVisibleDescriptorAllocator {
    fn drop(&mut self) {
        if let Some(heap) = self.current.take() {
            self.device.destroy_heap(heap.native);
        }
        for (_, heap) in self.pool.iter() {
            // Forced LRU removal on destruction is deliberate; an entry may
            // already be gone if it was evicted first.
            self.residency.remove(heap.native);
            self.device.destroy_heap(heap.native);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;

    fn allocator(initial: u32, max: u32) -> ShaderVisibleDescriptorAllocator {
        ShaderVisibleDescriptorAllocator::with_options(
            Arc::new(SoftwareDevice::new()),
            HeapKind::View,
            ShaderVisibleHeapOptions {
                initial_capacity: initial,
                max_capacity: max,
            },
        )
    }

    #[test]
    fn arena_bumps_and_exhausts() {
        let mut arena = DescriptorArena::new(8);
        assert_eq!(arena.alloc(5), Some(0));
        assert_eq!(arena.alloc(5), None);
        assert_eq!(arena.alloc(3), Some(5));
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn allocation_before_first_switch_signals_exhaustion() {
        let mut alloc = allocator(8, 64);
        assert!(alloc.allocate_gpu_descriptors(1, Serial(1)).is_none());
        alloc.allocate_and_switch_heap(Serial(1), Serial(0)).unwrap();
        assert!(alloc.allocate_gpu_descriptors(1, Serial(1)).is_some());
    }

    #[test]
    fn switch_invalidates_previous_generation() {
        let mut alloc = allocator(8, 64);
        alloc.allocate_and_switch_heap(Serial(1), Serial(0)).unwrap();

        let (_, first) = alloc.allocate_gpu_descriptors(5, Serial(1)).unwrap();
        assert!(alloc.is_allocation_still_valid(&first));
        assert!(alloc.allocate_gpu_descriptors(5, Serial(1)).is_none());

        alloc.allocate_and_switch_heap(Serial(1), Serial(0)).unwrap();
        assert!(!alloc.is_allocation_still_valid(&first));

        let (_, second) = alloc.allocate_gpu_descriptors(5, Serial(1)).unwrap();
        assert!(alloc.is_allocation_still_valid(&second));
    }

    #[test]
    fn new_heaps_double_up_to_cap() {
        let device = Arc::new(SoftwareDevice::new());
        let mut alloc = ShaderVisibleDescriptorAllocator::with_options(
            device.clone(),
            HeapKind::View,
            ShaderVisibleHeapOptions {
                initial_capacity: 8,
                max_capacity: 20,
            },
        );

        // Nothing ever completes, so every switch creates a new heap:
        // 8, then doubling clamped to the cap.
        let mut capacities = Vec::new();
        for pending in 1..=4u64 {
            alloc
                .allocate_and_switch_heap(Serial(pending), Serial(0))
                .unwrap();
            capacities.push(device.heap_capacity(alloc.current_heap().unwrap()).unwrap());
        }
        assert_eq!(capacities, [8, 16, 20, 20]);

        let stats = alloc.stats();
        assert_eq!(stats.heaps_created, 4);
        assert_eq!(stats.heaps_recycled, 0);
    }

    #[test]
    fn pool_recycles_in_fifo_order() {
        let mut alloc = allocator(8, 64);
        alloc.allocate_and_switch_heap(Serial(1), Serial(0)).unwrap();
        let h1 = alloc.current_heap().unwrap();
        alloc.allocate_and_switch_heap(Serial(2), Serial(0)).unwrap();
        let h2 = alloc.current_heap().unwrap();
        alloc.allocate_and_switch_heap(Serial(3), Serial(0)).unwrap();
        let h3 = alloc.current_heap().unwrap();

        // All three retirements (serials 1..3) completed; the pool must hand
        // them back in retirement order h1, h2, h3.
        alloc.allocate_and_switch_heap(Serial(4), Serial(3)).unwrap();
        assert_eq!(alloc.current_heap(), Some(h1));
        alloc.allocate_and_switch_heap(Serial(5), Serial(4)).unwrap();
        assert_eq!(alloc.current_heap(), Some(h2));
        alloc.allocate_and_switch_heap(Serial(6), Serial(5)).unwrap();
        assert_eq!(alloc.current_heap(), Some(h3));
    }

    #[test]
    fn evicts_only_retired_heaps() {
        let device = Arc::new(SoftwareDevice::new());
        let mut alloc = ShaderVisibleDescriptorAllocator::with_options(
            device.clone(),
            HeapKind::View,
            ShaderVisibleHeapOptions {
                initial_capacity: 8,
                max_capacity: 64,
            },
        );
        alloc.allocate_and_switch_heap(Serial(1), Serial(0)).unwrap();
        let h1 = alloc.current_heap().unwrap();
        alloc.allocate_and_switch_heap(Serial(2), Serial(0)).unwrap();
        let h2 = alloc.current_heap().unwrap();
        alloc.allocate_and_switch_heap(Serial(3), Serial(0)).unwrap();

        // h1 retired at serial 2, h2 at serial 3. Only serial 2 completed.
        assert_eq!(alloc.evict_retired(Serial(2), usize::MAX), 1);
        assert_eq!(device.is_resident(h1), Some(false));
        assert_eq!(device.is_resident(h2), Some(true));

        // Recycling the evicted heap makes it resident again.
        alloc.allocate_and_switch_heap(Serial(4), Serial(2)).unwrap();
        assert_eq!(alloc.current_heap(), Some(h1));
        assert_eq!(device.is_resident(h1), Some(true));
    }
}
