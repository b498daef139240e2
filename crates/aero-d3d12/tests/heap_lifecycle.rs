//! Shader-visible heap lifecycle: generation invalidation, FIFO recycling,
//! and staging block reuse, through the public API.

use std::sync::Arc;

use aero_d3d12::{
    DescriptorDevice, DeviceError, HeapKind, Serial, ShaderVisibleDescriptorAllocator,
    ShaderVisibleHeapOptions, SoftwareDevice, StagingDescriptorAllocator, StagingHeapOptions,
};
use pretty_assertions::assert_eq;

fn view_allocator(device: &Arc<SoftwareDevice>, initial: u32, max: u32) -> ShaderVisibleDescriptorAllocator {
    ShaderVisibleDescriptorAllocator::with_options(
        device.clone() as Arc<dyn DescriptorDevice>,
        HeapKind::View,
        ShaderVisibleHeapOptions {
            initial_capacity: initial,
            max_capacity: max,
        },
    )
}

#[test]
fn generation_invalidation_is_total() {
    let device = Arc::new(SoftwareDevice::new());
    let mut alloc = view_allocator(&device, 64, 1024);
    alloc.allocate_and_switch_heap(Serial(1), Serial(0)).unwrap();

    let before: Vec<_> = (0..5)
        .map(|_| alloc.allocate_gpu_descriptors(4, Serial(1)).unwrap().1)
        .collect();
    for allocation in &before {
        assert!(alloc.is_allocation_still_valid(allocation));
    }

    alloc.allocate_and_switch_heap(Serial(2), Serial(0)).unwrap();

    // Every pre-switch allocation is invalid; every post-switch allocation
    // is valid until the next switch.
    for allocation in &before {
        assert!(!alloc.is_allocation_still_valid(allocation));
    }
    let after: Vec<_> = (0..5)
        .map(|_| alloc.allocate_gpu_descriptors(4, Serial(2)).unwrap().1)
        .collect();
    for allocation in &after {
        assert!(alloc.is_allocation_still_valid(allocation));
    }

    alloc.allocate_and_switch_heap(Serial(3), Serial(0)).unwrap();
    for allocation in &after {
        assert!(!alloc.is_allocation_still_valid(allocation));
    }
}

#[test]
fn ring_exhaustion_and_switch_recovery() {
    // Capacity 8: allocate 5, the next 5 does not fit, switch, then 5 fits
    // and the first batch is invalid.
    let device = Arc::new(SoftwareDevice::new());
    let mut alloc = view_allocator(&device, 8, 8);
    alloc.allocate_and_switch_heap(Serial(1), Serial(0)).unwrap();

    let (_, first) = alloc.allocate_gpu_descriptors(5, Serial(1)).unwrap();
    assert!(alloc.allocate_gpu_descriptors(5, Serial(1)).is_none());
    // The failed attempt mutated nothing: 3 slots are still available.
    assert!(alloc.allocate_gpu_descriptors(3, Serial(1)).is_some());

    alloc.allocate_and_switch_heap(Serial(2), Serial(0)).unwrap();
    let (_, second) = alloc.allocate_gpu_descriptors(5, Serial(2)).unwrap();
    assert!(alloc.is_allocation_still_valid(&second));
    assert!(!alloc.is_allocation_still_valid(&first));
}

#[test]
fn heaps_recycle_in_retirement_order() {
    let device = Arc::new(SoftwareDevice::new());
    let mut alloc = view_allocator(&device, 8, 8);

    alloc.allocate_and_switch_heap(Serial(1), Serial(0)).unwrap();
    let h1 = alloc.current_heap().unwrap();
    alloc.allocate_and_switch_heap(Serial(2), Serial(0)).unwrap();
    let h2 = alloc.current_heap().unwrap();
    alloc.allocate_and_switch_heap(Serial(3), Serial(0)).unwrap();
    let h3 = alloc.current_heap().unwrap();

    // h1, h2, h3 retired at serials 2, 3, 4 respectively. With everything
    // completed, reclaim order must be h1, h2, h3, never h2 before h1.
    alloc.allocate_and_switch_heap(Serial(4), Serial(3)).unwrap();
    assert_eq!(alloc.current_heap(), Some(h1));
    alloc.allocate_and_switch_heap(Serial(5), Serial(4)).unwrap();
    assert_eq!(alloc.current_heap(), Some(h2));
    alloc.allocate_and_switch_heap(Serial(6), Serial(5)).unwrap();
    assert_eq!(alloc.current_heap(), Some(h3));

    let stats = alloc.stats();
    assert_eq!(stats.heaps_created, 3);
    assert_eq!(stats.heaps_recycled, 3);
}

#[test]
fn staging_blocks_reuse_existing_heaps() {
    // Heap capacity 3 blocks of 4 descriptors: seven allocations fill heaps
    // [0, 0, 0, 1, 1, 1, 2].
    let device = Arc::new(SoftwareDevice::new());
    let mut staging = StagingDescriptorAllocator::new(
        device.clone() as Arc<dyn DescriptorDevice>,
        HeapKind::View,
        4,
        StagingHeapOptions { blocks_per_heap: 3 },
    );

    let first: Vec<_> = (0..7).map(|_| staging.allocate().unwrap()).collect();
    let heap_indices: Vec<u32> = first.iter().map(|b| b.heap_index()).collect();
    assert_eq!(heap_indices, vec![0, 0, 0, 1, 1, 1, 2]);
    let heaps_after_first = device.live_heap_count();

    let mut first_slots: Vec<_> = first.iter().map(|b| b.base()).collect();
    for block in first {
        staging.deallocate(block);
    }

    // A second round of seven draws only from the existing pool and hands
    // back a permutation of the first round's slots.
    let mut second_slots: Vec<_> = (0..7)
        .map(|_| staging.allocate().unwrap().base())
        .collect();
    assert_eq!(device.live_heap_count(), heaps_after_first);

    first_slots.sort_by_key(|h| (h.heap.0, h.index));
    second_slots.sort_by_key(|h| (h.heap.0, h.index));
    assert_eq!(first_slots, second_slots);
}

#[test]
fn native_heap_creation_failure_is_fatal() {
    let device = Arc::new(SoftwareDevice::new());
    let mut alloc = view_allocator(&device, 8, 8);
    device.set_heap_budget(Some(0));

    assert!(matches!(
        alloc.allocate_and_switch_heap(Serial(1), Serial(0)),
        Err(DeviceError::OutOfMemory { .. })
    ));
}
