//! Slim pipeline-layout / root-signature model.
//!
//! Full root-signature construction lives with pipeline compilation and is
//! out of scope here; the binding tracker only needs to know, per bind group
//! slot, which root parameter indices its tables, dynamic buffers, and
//! length constants land on, plus an identity to detect root-signature
//! changes between pipelines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::binding::{BindGroupLayout, ShaderStages};

/// Bind group slots addressable by a pipeline layout.
pub const MAX_BIND_GROUPS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

impl PipelineKind {
    /// Stages that exist on this pipeline kind.
    pub fn stages(self) -> ShaderStages {
        match self {
            PipelineKind::Graphics => ShaderStages::VERTEX | ShaderStages::FRAGMENT,
            PipelineKind::Compute => ShaderStages::COMPUTE,
        }
    }
}

/// Identity of a root signature. Two pipeline layouts with different ids
/// place parameters differently; binding state cached under one id is
/// meaningless under another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootSignatureId(pub u64);

/// Root parameter indices assigned to one bind group slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootParams {
    /// Descriptor table over the group's view descriptors, if it has any.
    pub view_table_param: Option<u32>,
    /// Descriptor table over the group's samplers, if it has any.
    pub sampler_table_param: Option<u32>,
    /// First of `dynamic_count` consecutive root-descriptor parameters, one
    /// per dynamic buffer binding in layout order.
    pub first_dynamic_param: u32,
    /// Root constants carrying dynamic storage-buffer lengths, if any.
    pub length_constants_param: Option<u32>,
}

static NEXT_ROOT_SIGNATURE_ID: AtomicU64 = AtomicU64::new(1);

pub struct PipelineLayout {
    id: RootSignatureId,
    groups: Vec<(Arc<BindGroupLayout>, RootParams)>,
}

impl PipelineLayout {
    /// Assign root parameter indices sequentially across `group_layouts`:
    /// view table, sampler table, dynamic root descriptors, then length
    /// constants, per group.
    pub fn new(group_layouts: Vec<Arc<BindGroupLayout>>) -> Arc<PipelineLayout> {
        assert!(
            group_layouts.len() <= MAX_BIND_GROUPS,
            "pipeline layout exceeds {MAX_BIND_GROUPS} bind groups"
        );

        let mut next_param = 0u32;
        let groups = group_layouts
            .into_iter()
            .map(|layout| {
                let view_table_param = if layout.view_count() > 0 {
                    let param = next_param;
                    next_param += 1;
                    Some(param)
                } else {
                    None
                };
                let sampler_table_param = if layout.sampler_count() > 0 {
                    let param = next_param;
                    next_param += 1;
                    Some(param)
                } else {
                    None
                };
                let first_dynamic_param = next_param;
                next_param += layout.dynamic_count();
                let length_constants_param = if layout.dynamic_storage_count() > 0 {
                    let param = next_param;
                    next_param += 1;
                    Some(param)
                } else {
                    None
                };
                (
                    layout,
                    RootParams {
                        view_table_param,
                        sampler_table_param,
                        first_dynamic_param,
                        length_constants_param,
                    },
                )
            })
            .collect();

        Arc::new(PipelineLayout {
            id: RootSignatureId(NEXT_ROOT_SIGNATURE_ID.fetch_add(1, Ordering::Relaxed)),
            groups,
        })
    }

    pub fn id(&self) -> RootSignatureId {
        self.id
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_layout(&self, index: usize) -> &Arc<BindGroupLayout> {
        &self.groups[index].0
    }

    pub fn root_params(&self, index: usize) -> &RootParams {
        &self.groups[index].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindGroupLayoutEntry, BindingType};
    use crate::device::SoftwareDevice;
    use crate::staging::{StagingAllocators, StagingHeapOptions};
    use std::sync::Mutex;

    #[test]
    fn root_params_are_assigned_sequentially() {
        let device = Arc::new(SoftwareDevice::new());
        let staging = Arc::new(Mutex::new(StagingAllocators::new(
            device,
            StagingHeapOptions::default(),
        )));

        let group0 = BindGroupLayout::new(
            staging.clone(),
            vec![
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::VERTEX,
                    ty: BindingType::UniformBuffer { dynamic: false },
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Sampler,
                },
            ],
        );
        let group1 = BindGroupLayout::new(
            staging,
            vec![
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::VERTEX,
                    ty: BindingType::StorageBuffer { dynamic: true, read_only: false },
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::VERTEX,
                    ty: BindingType::UniformBuffer { dynamic: true },
                },
            ],
        );

        let layout = PipelineLayout::new(vec![group0, group1]);

        // Group 0: view table 0, sampler table 1.
        assert_eq!(
            *layout.root_params(0),
            RootParams {
                view_table_param: Some(0),
                sampler_table_param: Some(1),
                first_dynamic_param: 2,
                length_constants_param: None,
            }
        );
        // Group 1: no tables; dynamic params 2..4, then length constants.
        assert_eq!(
            *layout.root_params(1),
            RootParams {
                view_table_param: None,
                sampler_table_param: None,
                first_dynamic_param: 2,
                length_constants_param: Some(4),
            }
        );
    }
}
