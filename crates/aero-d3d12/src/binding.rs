//! Bind group layouts and bind groups.
//!
//! A layout partitions its entries once, at construction: dynamic buffers
//! become individually bound root descriptors (no heap slot at all), static
//! samplers are baked into the root signature, and everything else gets a
//! precomputed offset into the group's view or sampler descriptor table.
//! Bind groups then write their view descriptors into a private CPU block
//! eagerly at creation, and copy that block into the current shader-visible
//! heap lazily, re-copying only when a heap switch has invalidated the
//! previous copy.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::device::{CpuDescriptorHandle, DescriptorDevice, DescriptorWrite, DeviceError, GpuDescriptorHandle, HeapKind};
use crate::resources::{Buffer, TextureView};
use crate::sampler::{Sampler, SamplerDesc, SamplerHeapCache, SamplerHeapCacheEntry};
use crate::serial::Serial;
use crate::shader_visible::{GpuDescriptorAllocation, ShaderVisibleDescriptorAllocator};
use crate::staging::{CpuDescriptorBlock, StagingAllocators};

bitflags::bitflags! {
    /// Pipeline stages a binding is visible to.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// What one layout entry binds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BindingType {
    UniformBuffer { dynamic: bool },
    StorageBuffer { dynamic: bool, read_only: bool },
    SampledTexture,
    StorageTexture { read_only: bool },
    Sampler,
    /// Baked into the root signature at pipeline-layout build time; no heap
    /// slot, no per-bind-group state.
    StaticSampler(SamplerDesc),
    /// Carried by the frontend enum but not expressible on this backend.
    InputAttachment,
}

/// Descriptor range type, the granularity at which root-signature ranges
/// are declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RangeType {
    Cbv,
    Srv,
    Uav,
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStages,
    pub ty: BindingType,
}

/// A contiguous run of same-type descriptors in a group's table.
///
/// Adjacent same-type bindings coalesce into one range so the root
/// signature stays small; this relies on entries being sorted by binding
/// number, which layout construction asserts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorRange {
    pub ty: RangeType,
    pub first_binding: u32,
    /// Offset of the range's first descriptor within the group's table.
    pub offset: u32,
    pub count: u32,
}

/// Per-entry placement computed at layout construction.
#[derive(Clone, Copy, Debug)]
enum EntryPlacement {
    /// Root-bound: `slot` indexes the layout's dynamic-binding list, which
    /// is also the index into the dynamic offsets supplied at bind time.
    Dynamic { slot: u32, ty: RangeType },
    StaticSampler,
    View { offset: u32 },
    Sampler { offset: u32 },
}

/// Immutable partitioning of a bind group layout's entries.
pub struct BindGroupLayout {
    entries: Vec<BindGroupLayoutEntry>,
    placements: Vec<EntryPlacement>,
    view_count: u32,
    sampler_count: u32,
    dynamic_count: u32,
    dynamic_storage_count: u32,
    static_samplers: Vec<(u32, SamplerDesc)>,
    view_ranges: Vec<DescriptorRange>,
    sampler_ranges: Vec<DescriptorRange>,
    staging: Arc<Mutex<StagingAllocators>>,
}

impl BindGroupLayout {
    /// Partition `entries` (sorted by binding number, which the frontend
    /// guarantees) into root-bound, static, and heap-resident bindings.
    pub fn new(
        staging: Arc<Mutex<StagingAllocators>>,
        entries: Vec<BindGroupLayoutEntry>,
    ) -> Arc<BindGroupLayout> {
        assert!(
            entries.windows(2).all(|w| w[0].binding < w[1].binding),
            "bind group layout entries must be sorted by binding number"
        );

        let mut placements = Vec::with_capacity(entries.len());
        let mut view_count = 0u32;
        let mut sampler_count = 0u32;
        let mut dynamic_count = 0u32;
        let mut dynamic_storage_count = 0u32;
        let mut static_samplers = Vec::new();
        let mut view_ranges: Vec<DescriptorRange> = Vec::new();
        let mut sampler_ranges: Vec<DescriptorRange> = Vec::new();

        for entry in &entries {
            let placement = match entry.ty {
                BindingType::UniformBuffer { dynamic: true } => {
                    let slot = dynamic_count;
                    dynamic_count += 1;
                    EntryPlacement::Dynamic { slot, ty: RangeType::Cbv }
                }
                BindingType::StorageBuffer { dynamic: true, read_only } => {
                    let slot = dynamic_count;
                    dynamic_count += 1;
                    dynamic_storage_count += 1;
                    let ty = if read_only { RangeType::Srv } else { RangeType::Uav };
                    EntryPlacement::Dynamic { slot, ty }
                }
                BindingType::StaticSampler(desc) => {
                    static_samplers.push((entry.binding, desc));
                    EntryPlacement::StaticSampler
                }
                BindingType::Sampler => {
                    let offset = sampler_count;
                    sampler_count += 1;
                    coalesce(&mut sampler_ranges, RangeType::Sampler, entry.binding, offset);
                    EntryPlacement::Sampler { offset }
                }
                BindingType::UniformBuffer { dynamic: false }
                | BindingType::StorageBuffer { dynamic: false, .. }
                | BindingType::SampledTexture
                | BindingType::StorageTexture { .. } => {
                    let ty = match entry.ty {
                        BindingType::UniformBuffer { .. } => RangeType::Cbv,
                        BindingType::StorageBuffer { read_only: true, .. } => RangeType::Srv,
                        BindingType::StorageBuffer { .. } => RangeType::Uav,
                        BindingType::SampledTexture => RangeType::Srv,
                        BindingType::StorageTexture { read_only: true } => RangeType::Srv,
                        BindingType::StorageTexture { .. } => RangeType::Uav,
                        _ => unreachable!(),
                    };
                    let offset = view_count;
                    view_count += 1;
                    coalesce(&mut view_ranges, ty, entry.binding, offset);
                    EntryPlacement::View { offset }
                }
                BindingType::InputAttachment => {
                    panic!("input attachment bindings are not supported by this backend")
                }
            };
            placements.push(placement);
        }

        Arc::new(BindGroupLayout {
            entries,
            placements,
            view_count,
            sampler_count,
            dynamic_count,
            dynamic_storage_count,
            static_samplers,
            view_ranges,
            sampler_ranges,
            staging,
        })
    }

    pub fn entries(&self) -> &[BindGroupLayoutEntry] {
        &self.entries
    }

    /// Heap-resident view descriptors per bind group of this layout.
    pub fn view_count(&self) -> u32 {
        self.view_count
    }

    /// Heap-resident (non-static) samplers per bind group of this layout.
    pub fn sampler_count(&self) -> u32 {
        self.sampler_count
    }

    pub fn dynamic_count(&self) -> u32 {
        self.dynamic_count
    }

    pub fn dynamic_storage_count(&self) -> u32 {
        self.dynamic_storage_count
    }

    pub fn static_samplers(&self) -> &[(u32, SamplerDesc)] {
        &self.static_samplers
    }

    pub fn view_ranges(&self) -> &[DescriptorRange] {
        &self.view_ranges
    }

    pub fn sampler_ranges(&self) -> &[DescriptorRange] {
        &self.sampler_ranges
    }

    /// Build a bind group: allocate its CPU block, write every heap-resident
    /// view descriptor eagerly, and attach the shared sampler cache entry.
    pub fn allocate_bind_group(
        self: &Arc<Self>,
        device: &Arc<dyn DescriptorDevice>,
        sampler_cache: &SamplerHeapCache,
        bindings: &[BindGroupEntry],
    ) -> Result<BindGroup, DeviceError> {
        // Zero view descriptors is a valid no-op, not an error: the group
        // simply never owns a view block.
        let block = if self.view_count > 0 {
            Some(
                self.staging
                    .lock()
                    .unwrap()
                    .allocate(HeapKind::View, self.view_count)?,
            )
        } else {
            None
        };

        let mut samplers: Vec<Arc<Sampler>> = Vec::with_capacity(self.sampler_count as usize);
        let mut dynamic: Vec<DynamicBinding> = Vec::with_capacity(self.dynamic_count as usize);
        let mut dynamic_storage_lengths: Vec<u32> =
            Vec::with_capacity(self.dynamic_storage_count as usize);
        let mut stale = false;

        for (entry, placement) in self.entries.iter().zip(&self.placements) {
            let resource = bindings
                .iter()
                .find(|b| b.binding == entry.binding)
                .map(|b| &b.resource)
                .unwrap_or_else(|| panic!("bind group descriptor missing binding {}", entry.binding));

            match *placement {
                EntryPlacement::Dynamic { slot, ty } => {
                    let BindingResource::Buffer { buffer, offset, size } = resource else {
                        panic!("binding {} expects a buffer", entry.binding);
                    };
                    if buffer.is_destroyed() {
                        stale = true;
                    }
                    dynamic.push(DynamicBinding {
                        slot,
                        ty,
                        visibility: entry.visibility,
                        address: buffer.gpu_va() + offset,
                    });
                    if matches!(entry.ty, BindingType::StorageBuffer { .. }) {
                        dynamic_storage_lengths.push(*size as u32);
                    }
                }
                EntryPlacement::StaticSampler => {
                    debug_assert!(
                        matches!(resource, BindingResource::Sampler(_)),
                        "binding {} expects a sampler",
                        entry.binding
                    );
                }
                EntryPlacement::Sampler { .. } => {
                    let BindingResource::Sampler(sampler) = resource else {
                        panic!("binding {} expects a sampler", entry.binding);
                    };
                    // Offsets are assigned in entry order, so pushing in
                    // iteration order keeps the list positional.
                    samplers.push(Arc::clone(sampler));
                }
                EntryPlacement::View { offset } => {
                    let block = block.as_ref().expect("view placement implies a block");
                    match write_for(entry.ty, resource) {
                        Some(write) => {
                            device.write_descriptor(block.handle(offset), &write);
                        }
                        None => {
                            // Backing resource already destroyed: skip the
                            // write. Submission validation rejects the
                            // group; our only job is to not crash.
                            trace!(binding = entry.binding, "skipping descriptor for destroyed resource");
                            stale = true;
                        }
                    }
                }
            }
        }

        let sampler_entry = if self.sampler_count > 0 {
            Some(sampler_cache.get_or_create(&samplers)?)
        } else {
            None
        };

        Ok(BindGroup {
            layout: Arc::clone(self),
            block,
            gpu_views: Mutex::new(GpuDescriptorAllocation::INVALID),
            samplers: sampler_entry,
            dynamic,
            dynamic_storage_lengths,
            stale,
        })
    }
}

fn coalesce(ranges: &mut Vec<DescriptorRange>, ty: RangeType, binding: u32, offset: u32) {
    if let Some(last) = ranges.last_mut() {
        if last.ty == ty && last.first_binding + last.count == binding {
            last.count += 1;
            return;
        }
    }
    ranges.push(DescriptorRange {
        ty,
        first_binding: binding,
        offset,
        count: 1,
    });
}

fn write_for(ty: BindingType, resource: &BindingResource) -> Option<DescriptorWrite> {
    match (ty, resource) {
        (BindingType::UniformBuffer { .. }, BindingResource::Buffer { buffer, offset, size }) => {
            if buffer.is_destroyed() {
                return None;
            }
            Some(DescriptorWrite::UniformBuffer {
                address: buffer.gpu_va() + offset,
                size: *size,
            })
        }
        (
            BindingType::StorageBuffer { read_only, .. },
            BindingResource::Buffer { buffer, offset, size },
        ) => {
            if buffer.is_destroyed() {
                return None;
            }
            let address = buffer.gpu_va() + offset;
            Some(if read_only {
                DescriptorWrite::ReadOnlyStorageBuffer { address, size: *size }
            } else {
                DescriptorWrite::StorageBuffer { address, size: *size }
            })
        }
        (BindingType::SampledTexture, BindingResource::TextureView(view)) => {
            if view.is_destroyed() {
                return None;
            }
            Some(DescriptorWrite::SampledTexture { view: view.id() })
        }
        (BindingType::StorageTexture { read_only }, BindingResource::TextureView(view)) => {
            if view.is_destroyed() {
                return None;
            }
            Some(if read_only {
                DescriptorWrite::ReadOnlyStorageTexture { view: view.id() }
            } else {
                DescriptorWrite::StorageTexture { view: view.id() }
            })
        }
        _ => panic!("bind group resource does not match layout binding type"),
    }
}

/// One frontend-provided binding in a bind group descriptor.
#[derive(Clone, Debug)]
pub struct BindGroupEntry {
    pub binding: u32,
    pub resource: BindingResource,
}

#[derive(Clone, Debug)]
pub enum BindingResource {
    Buffer {
        buffer: Arc<Buffer>,
        offset: u64,
        size: u64,
    },
    TextureView(Arc<TextureView>),
    Sampler(Arc<Sampler>),
}

/// A dynamic buffer binding, bound per-draw as a root descriptor at
/// `address + dynamic_offset`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DynamicBinding {
    /// Index into both the layout's dynamic-binding list and the dynamic
    /// offsets supplied at bind time.
    pub slot: u32,
    pub ty: RangeType,
    pub visibility: ShaderStages,
    /// Buffer base address plus the static offset from the descriptor.
    pub address: u64,
}

/// A bind group: the private CPU copy of its view descriptors, a shared
/// sampler cache entry, and the lazily maintained GPU-visible copies.
pub struct BindGroup {
    layout: Arc<BindGroupLayout>,
    block: Option<CpuDescriptorBlock>,
    gpu_views: Mutex<GpuDescriptorAllocation>,
    samplers: Option<Arc<SamplerHeapCacheEntry>>,
    dynamic: Vec<DynamicBinding>,
    dynamic_storage_lengths: Vec<u32>,
    stale: bool,
}

impl BindGroup {
    pub fn layout(&self) -> &Arc<BindGroupLayout> {
        &self.layout
    }

    /// Whether any descriptor write was skipped because its backing resource
    /// was already destroyed. Such a group must be rejected at submission
    /// validation; populating and binding it is memory-safe but the skipped
    /// slots hold stale data.
    pub fn has_stale_bindings(&self) -> bool {
        self.stale
    }

    pub fn sampler_cache_entry(&self) -> Option<&Arc<SamplerHeapCacheEntry>> {
        self.samplers.as_ref()
    }

    pub fn cpu_block(&self) -> Option<&CpuDescriptorBlock> {
        self.block.as_ref()
    }

    /// Ensure the group's view descriptors are present in the current
    /// shader-visible view heap.
    ///
    /// No-op success when the group has no view descriptors or its existing
    /// GPU allocation is still in the current generation; `false` propagates
    /// ring exhaustion.
    pub fn populate_views(
        &self,
        device: &dyn DescriptorDevice,
        allocator: &mut ShaderVisibleDescriptorAllocator,
        pending: Serial,
    ) -> bool {
        let Some(block) = &self.block else {
            return true;
        };
        let mut gpu = self.gpu_views.lock().unwrap();
        if allocator.is_allocation_still_valid(&gpu) {
            return true;
        }
        let Some((dst, allocation)) = allocator.allocate_gpu_descriptors(block.count(), pending)
        else {
            return false;
        };
        device.copy_descriptors(block.base(), dst, block.count());
        trace!(count = block.count(), "populated view table");
        *gpu = allocation;
        true
    }

    /// Ensure the shared sampler table is present in the current
    /// shader-visible sampler heap. See [`SamplerHeapCacheEntry::populate`].
    pub fn populate_samplers(
        &self,
        device: &dyn DescriptorDevice,
        allocator: &mut ShaderVisibleDescriptorAllocator,
        pending: Serial,
    ) -> bool {
        match &self.samplers {
            Some(entry) => entry.populate(device, allocator, pending),
            None => true,
        }
    }

    /// GPU base of the view table, if this group has one. Only meaningful
    /// after a successful [`populate_views`] in the current generation.
    ///
    /// [`populate_views`]: BindGroup::populate_views
    pub fn view_table_base(&self) -> Option<GpuDescriptorHandle> {
        self.block
            .as_ref()
            .map(|_| self.gpu_views.lock().unwrap().base())
    }

    pub fn sampler_table_base(&self) -> Option<GpuDescriptorHandle> {
        self.samplers.as_ref().map(|entry| entry.gpu_base())
    }

    /// CPU handle of the `offset`-th view descriptor (test inspection).
    pub fn view_handle(&self, offset: u32) -> Option<CpuDescriptorHandle> {
        self.block.as_ref().map(|b| b.handle(offset))
    }

    pub(crate) fn dynamic_bindings(&self) -> &[DynamicBinding] {
        &self.dynamic
    }

    pub(crate) fn dynamic_storage_lengths(&self) -> &[u32] {
        &self.dynamic_storage_lengths
    }
}

impl Drop for BindGroup {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.layout
                .staging
                .lock()
                .unwrap()
                .deallocate(HeapKind::View, block);
        }
        // The sampler cache entry reference drops with us; if we were the
        // last holder its Drop removes it from the cache index.
    }
}
