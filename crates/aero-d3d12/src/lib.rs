//! `aero-d3d12` implements the descriptor-heap and residency side of a
//! D3D12-style command translation backend.
//!
//! Currently this crate provides:
//! - Fixed-size block allocation of CPU staging descriptors, with
//!   serial-keyed transient blocks (see [`StagingDescriptorAllocator`]).
//! - Ring allocation out of the bound shader-visible heaps, with
//!   generation-tagged validity and FIFO heap recycling (see
//!   [`ShaderVisibleDescriptorAllocator`]).
//! - Content-keyed dedup of sampler descriptor blocks (see
//!   [`SamplerHeapCache`]).
//! - Bind group layouts/groups with eager CPU writes and lazy
//!   shader-visible population (see [`binding`]).
//! - Per-pipeline-kind dirty tracking that decides when heaps switch and
//!   which root parameters need re-emitting (see
//!   [`BindGroupStateTracker`]).
//! - Residency bookkeeping for evictable heaps (see [`residency`]).
//!
//! The native API is abstracted behind [`DescriptorDevice`]; the in-memory
//! [`SoftwareDevice`] backs tests and the hosted path.

pub mod binding;
pub mod residency;

mod cmd;
mod context;
mod device;
mod pipeline;
mod resources;
mod sampler;
mod serial;
mod shader_visible;
mod staging;
mod tracker;

pub use cmd::{CommandRecorder, NativeCall};
pub use context::{DescriptorContext, DescriptorContextOptions};
pub use device::{
    CpuDescriptorHandle, DescriptorDevice, DescriptorWrite, DeviceError, GpuDescriptorHandle,
    HeapId, HeapKind, SoftwareDevice,
};
pub use pipeline::{PipelineKind, PipelineLayout, RootParams, RootSignatureId, MAX_BIND_GROUPS};
pub use resources::{Buffer, BufferId, TextureView, TextureViewId};
pub use sampler::{
    AddressMode, CompareFunction, FilterMode, Sampler, SamplerDesc, SamplerHeapCache,
    SamplerHeapCacheEntry, SamplerId,
};
pub use serial::{Serial, SerialQueue};
pub use shader_visible::{
    GpuDescriptorAllocation, HeapVersion, ShaderVisibleDescriptorAllocator,
    ShaderVisibleHeapOptions, ShaderVisibleStats,
};
pub use staging::{
    CpuDescriptorBlock, StagingAllocators, StagingDescriptorAllocator, StagingHeapOptions,
};
pub use tracker::{BindGroupStateTracker, RecordingContext};
