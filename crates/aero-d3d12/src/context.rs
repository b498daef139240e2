//! Device-level aggregate wiring the allocators together.
//!
//! One [`DescriptorContext`] per logical device: it owns the staging pools,
//! the two shader-visible ring allocators, and the sampler dedup cache, and
//! fans completed-serial ticks out to all of them. Command recording borrows
//! the pieces it needs through [`DescriptorContext::recording`]; recording
//! threads sharing one device wrap the whole context in a mutex and hold it
//! across each recording burst.

use std::sync::{Arc, Mutex};

use crate::binding::{BindGroup, BindGroupEntry, BindGroupLayout, BindGroupLayoutEntry};
use crate::cmd::CommandRecorder;
use crate::device::{DescriptorDevice, DeviceError, HeapKind};
use crate::sampler::SamplerHeapCache;
use crate::serial::Serial;
use crate::shader_visible::{ShaderVisibleDescriptorAllocator, ShaderVisibleHeapOptions, ShaderVisibleStats};
use crate::staging::{StagingAllocators, StagingHeapOptions};
use crate::tracker::RecordingContext;

#[derive(Clone, Copy, Debug)]
pub struct DescriptorContextOptions {
    pub staging: StagingHeapOptions,
    pub view_heaps: ShaderVisibleHeapOptions,
    pub sampler_heaps: ShaderVisibleHeapOptions,
}

impl Default for DescriptorContextOptions {
    fn default() -> Self {
        Self {
            staging: StagingHeapOptions::default(),
            view_heaps: ShaderVisibleHeapOptions::for_kind(HeapKind::View),
            sampler_heaps: ShaderVisibleHeapOptions::for_kind(HeapKind::Sampler),
        }
    }
}

pub struct DescriptorContext {
    device: Arc<dyn DescriptorDevice>,
    staging: Arc<Mutex<StagingAllocators>>,
    view_allocator: ShaderVisibleDescriptorAllocator,
    sampler_allocator: ShaderVisibleDescriptorAllocator,
    sampler_cache: SamplerHeapCache,
}

impl DescriptorContext {
    pub fn new(device: Arc<dyn DescriptorDevice>) -> Self {
        Self::with_options(device, DescriptorContextOptions::default())
    }

    pub fn with_options(device: Arc<dyn DescriptorDevice>, options: DescriptorContextOptions) -> Self {
        let staging = Arc::new(Mutex::new(StagingAllocators::new(
            device.clone(),
            options.staging,
        )));
        let sampler_cache = SamplerHeapCache::new(device.clone(), staging.clone());
        Self {
            view_allocator: ShaderVisibleDescriptorAllocator::with_options(
                device.clone(),
                HeapKind::View,
                options.view_heaps,
            ),
            sampler_allocator: ShaderVisibleDescriptorAllocator::with_options(
                device.clone(),
                HeapKind::Sampler,
                options.sampler_heaps,
            ),
            device,
            staging,
            sampler_cache,
        }
    }

    pub fn device(&self) -> &Arc<dyn DescriptorDevice> {
        &self.device
    }

    pub fn staging(&self) -> &Arc<Mutex<StagingAllocators>> {
        &self.staging
    }

    pub fn sampler_cache(&self) -> &SamplerHeapCache {
        &self.sampler_cache
    }

    pub fn create_bind_group_layout(&self, entries: Vec<BindGroupLayoutEntry>) -> Arc<BindGroupLayout> {
        BindGroupLayout::new(self.staging.clone(), entries)
    }

    pub fn create_bind_group(
        &self,
        layout: &Arc<BindGroupLayout>,
        bindings: &[BindGroupEntry],
    ) -> Result<Arc<BindGroup>, DeviceError> {
        layout
            .allocate_bind_group(&self.device, &self.sampler_cache, bindings)
            .map(Arc::new)
    }

    /// Borrow the binding machinery for one command list.
    pub fn recording<'a>(
        &'a mut self,
        recorder: &'a mut CommandRecorder,
        pending: Serial,
        completed: Serial,
    ) -> RecordingContext<'a> {
        RecordingContext {
            device: self.device.as_ref(),
            recorder,
            view_allocator: &mut self.view_allocator,
            sampler_allocator: &mut self.sampler_allocator,
            pending,
            completed,
        }
    }

    /// Advance completion tracking: transient staging blocks whose serial
    /// completed are returned, and both ring allocators get their hook.
    pub fn tick(&mut self, completed: Serial) {
        self.staging.lock().unwrap().tick(completed);
        self.view_allocator.tick(completed);
        self.sampler_allocator.tick(completed);
    }

    /// Page out retired shader-visible heaps the GPU is done with.
    pub fn evict_retired(&mut self, completed: Serial, max_evictions: usize) -> usize {
        let evicted = self.view_allocator.evict_retired(completed, max_evictions);
        evicted + self.sampler_allocator.evict_retired(completed, max_evictions - evicted)
    }

    pub fn view_heap_stats(&self) -> ShaderVisibleStats {
        self.view_allocator.stats()
    }

    pub fn sampler_heap_stats(&self) -> ShaderVisibleStats {
        self.sampler_allocator.stats()
    }
}
