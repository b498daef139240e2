//! Per-command-list bind group state tracking.
//!
//! The command stream walker notifies the tracker as it walks SetPipeline /
//! SetBindGroup commands (bookkeeping only, no heap work), then calls
//! [`BindGroupStateTracker::apply`] once before each draw or dispatch. Apply
//! populates whatever the current shader-visible heaps are missing, switches
//! heaps when they run out (a switch invalidates *every* outstanding GPU
//! allocation, so every bound group is re-dirtied, not just the one that hit
//! the wall), and finally flushes the root-parameter binds for slots whose
//! object or dynamic offsets changed.

use std::sync::Arc;

use tracing::debug;

use crate::binding::BindGroup;
use crate::cmd::CommandRecorder;
use crate::device::{DescriptorDevice, DeviceError, GpuDescriptorHandle};
use crate::pipeline::{PipelineKind, PipelineLayout, RootSignatureId, MAX_BIND_GROUPS};
use crate::serial::Serial;
use crate::shader_visible::ShaderVisibleDescriptorAllocator;

/// Everything one command list's binding work needs, borrowed for the
/// duration of recording. When several recording threads share one device's
/// allocators, the external lock is held across the whole borrow.
pub struct RecordingContext<'a> {
    pub device: &'a dyn DescriptorDevice,
    pub recorder: &'a mut CommandRecorder,
    pub view_allocator: &'a mut ShaderVisibleDescriptorAllocator,
    pub sampler_allocator: &'a mut ShaderVisibleDescriptorAllocator,
    /// Serial assigned to this command list's eventual submission.
    pub pending: Serial,
    /// Last serial the GPU is known to have finished.
    pub completed: Serial,
}

#[derive(Clone, Copy, Default)]
struct PopulateFailures {
    views: bool,
    samplers: bool,
}

impl PopulateFailures {
    fn any(self) -> bool {
        self.views || self.samplers
    }
}

/// Dirty-slot tracking for one pipeline kind (graphics or compute).
pub struct BindGroupStateTracker {
    kind: PipelineKind,
    layout: Option<Arc<PipelineLayout>>,
    groups: [Option<Arc<BindGroup>>; MAX_BIND_GROUPS],
    dynamic_offsets: [Vec<u32>; MAX_BIND_GROUPS],
    /// Slots whose group object changed (or everything, after a heap
    /// switch): these need their descriptors (re)populated.
    dirty_populate: u32,
    /// Slots whose object or dynamic offsets changed: these need their root
    /// parameters re-emitted.
    dirty_bind: u32,
    /// Last sampler table bound per slot. Two consecutive draws whose bind
    /// groups share a dedup-cache entry produce the same table handle, and
    /// the second bind is skipped.
    cached_sampler_tables: [Option<GpuDescriptorHandle>; MAX_BIND_GROUPS],
    last_root_signature: Option<RootSignatureId>,
}

impl BindGroupStateTracker {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            layout: None,
            groups: Default::default(),
            dynamic_offsets: Default::default(),
            dirty_populate: 0,
            dirty_bind: 0,
            cached_sampler_tables: Default::default(),
            last_root_signature: None,
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Walker notification: a pipeline with `layout` was set.
    pub fn on_set_pipeline(&mut self, layout: &Arc<PipelineLayout>) {
        let changed = self
            .layout
            .as_ref()
            .map_or(true, |current| current.id() != layout.id());
        self.layout = Some(Arc::clone(layout));
        if changed {
            // Every bound slot's tables must be re-emitted under the new
            // root signature; populate passes are cheap no-ops for groups
            // whose allocations are still current.
            let bound = self.bound_mask();
            self.dirty_populate |= bound;
            self.dirty_bind |= bound;
        }
    }

    /// Walker notification: `group` was bound at `index`.
    pub fn on_set_bind_group(&mut self, index: usize, group: &Arc<BindGroup>, dynamic_offsets: &[u32]) {
        assert!(index < MAX_BIND_GROUPS);
        assert_eq!(
            dynamic_offsets.len() as u32,
            group.layout().dynamic_count(),
            "dynamic offset count must match the layout"
        );

        let same_object = self.groups[index]
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, group));
        let same_offsets = self.dynamic_offsets[index] == dynamic_offsets;
        if same_object && same_offsets {
            return;
        }

        if !same_object {
            self.groups[index] = Some(Arc::clone(group));
            self.dirty_populate |= 1 << index;
        }
        self.dynamic_offsets[index].clear();
        self.dynamic_offsets[index].extend_from_slice(dynamic_offsets);
        self.dirty_bind |= 1 << index;
    }

    /// Flush binding state ahead of one draw/dispatch.
    ///
    /// The only error path is native heap creation failing during a switch;
    /// exhaustion itself always resolves via switch-and-repopulate.
    pub fn apply(&mut self, ctx: &mut RecordingContext<'_>) -> Result<(), DeviceError> {
        let layout = self
            .layout
            .clone()
            .expect("pipeline must be set before draw/dispatch");

        // A root-signature change invalidates the meaning of every cached
        // table slot.
        if self.last_root_signature != Some(layout.id()) {
            ctx.recorder.set_root_signature(self.kind, layout.id());
            self.last_root_signature = Some(layout.id());
            self.cached_sampler_tables = Default::default();
            let bound = self.bound_mask();
            self.dirty_populate |= bound;
            self.dirty_bind |= bound;
        }

        self.bind_current_heaps(ctx);

        let failures = self.populate_dirty_groups(ctx);
        if failures.any() {
            // Switch only the heap kind(s) that actually ran out.
            if failures.views {
                ctx.view_allocator
                    .allocate_and_switch_heap(ctx.pending, ctx.completed)?;
            }
            if failures.samplers {
                ctx.sampler_allocator
                    .allocate_and_switch_heap(ctx.pending, ctx.completed)?;
            }
            debug!(
                kind = ?self.kind,
                views = failures.views,
                samplers = failures.samplers,
                "shader-visible heap exhausted; switched heaps"
            );

            // The switch invalidated every outstanding GPU allocation, so
            // every bound slot, not just the one that failed, must be
            // repopulated and rebound.
            let bound = self.bound_mask();
            self.dirty_populate |= bound;
            self.dirty_bind |= bound;
            self.bind_current_heaps(ctx);

            let retry = self.populate_dirty_groups(ctx);
            assert!(
                !retry.any(),
                "freshly switched shader-visible heap cannot fit the bound working set"
            );
        }

        self.flush_root_bindings(ctx, &layout);
        self.dirty_populate = 0;
        self.dirty_bind = 0;
        Ok(())
    }

    fn bound_mask(&self) -> u32 {
        let mut mask = 0;
        for (i, group) in self.groups.iter().enumerate() {
            if group.is_some() {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Re-emit heap pointers if the current heaps are not the ones bound on
    /// the command list. Rebinding heap pointers invalidates any previously
    /// cached table handles.
    fn bind_current_heaps(&mut self, ctx: &mut RecordingContext<'_>) {
        let view = ctx.view_allocator.current_heap();
        let sampler = ctx.sampler_allocator.current_heap();
        if view.is_none() && sampler.is_none() {
            return;
        }
        if ctx.recorder.set_descriptor_heaps(view, sampler) {
            self.cached_sampler_tables = Default::default();
        }
    }

    /// Populate every dirty slot, stopping at the first failure. Both heap
    /// kinds are attempted for the failing group so a single retry can
    /// switch view and sampler heaps together when both are exhausted.
    fn populate_dirty_groups(&self, ctx: &mut RecordingContext<'_>) -> PopulateFailures {
        let mut failures = PopulateFailures::default();
        let scan = self.dirty_populate & self.bound_mask();
        for index in 0..MAX_BIND_GROUPS {
            if scan & (1 << index) == 0 {
                continue;
            }
            let group = self.groups[index].as_ref().expect("bound slot");
            debug_assert!(
                !group.has_stale_bindings(),
                "bind group referencing destroyed resources must be rejected before recording"
            );
            failures.views |= !group.populate_views(ctx.device, ctx.view_allocator, ctx.pending);
            failures.samplers |=
                !group.populate_samplers(ctx.device, ctx.sampler_allocator, ctx.pending);
            if failures.any() {
                break;
            }
        }
        failures
    }

    fn flush_root_bindings(&mut self, ctx: &mut RecordingContext<'_>, layout: &PipelineLayout) {
        let stages = self.kind.stages();
        let flush = self.dirty_bind & self.bound_mask();
        for index in 0..layout.group_count().min(MAX_BIND_GROUPS) {
            if flush & (1 << index) == 0 {
                continue;
            }
            let group = self.groups[index].as_ref().expect("bound slot");
            let params = *layout.root_params(index);

            for binding in group.dynamic_bindings() {
                // Bindings with no visibility in this pipeline kind have no
                // root parameter to set.
                if !binding.visibility.intersects(stages) {
                    continue;
                }
                let dynamic_offset = self.dynamic_offsets[index][binding.slot as usize] as u64;
                ctx.recorder.set_root_buffer_view(
                    self.kind,
                    params.first_dynamic_param + binding.slot,
                    binding.ty,
                    binding.address + dynamic_offset,
                );
            }

            if let Some(param) = params.view_table_param {
                let base = group.view_table_base().expect("views populated");
                ctx.recorder.set_root_descriptor_table(self.kind, param, base);
            }

            if let Some(param) = params.sampler_table_param {
                let base = group.sampler_table_base().expect("samplers populated");
                // Dedup-cache payoff: consecutive draws sharing a sampler
                // set resolve to the same populated table.
                if self.cached_sampler_tables[index] != Some(base) {
                    ctx.recorder.set_root_descriptor_table(self.kind, param, base);
                    self.cached_sampler_tables[index] = Some(base);
                }
            }

            if let Some(param) = params.length_constants_param {
                ctx.recorder.set_root_constants(
                    self.kind,
                    param,
                    group.dynamic_storage_lengths().to_vec(),
                );
            }
        }
    }
}
