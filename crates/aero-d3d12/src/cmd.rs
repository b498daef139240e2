//! Recorded native binding calls.
//!
//! The binding tracker emits its root-parameter and heap-pointer changes
//! into a [`CommandRecorder`] rather than straight into a driver command
//! list. The recorded stream is what a backend encoder walks to issue the
//! real calls, and it is what tests inspect to prove redundant binds were
//! elided.

use crate::binding::RangeType;
use crate::device::{GpuDescriptorHandle, HeapId};
use crate::pipeline::{PipelineKind, RootSignatureId};

/// One native call the binding subsystem issues on a command list.
#[derive(Clone, Debug, PartialEq)]
pub enum NativeCall {
    /// Bind the current shader-visible heap of each kind. At most one heap
    /// per kind can be bound, so this always names both.
    SetDescriptorHeaps {
        view_heap: Option<HeapId>,
        sampler_heap: Option<HeapId>,
    },
    SetRootSignature {
        kind: PipelineKind,
        root_signature: RootSignatureId,
    },
    SetRootDescriptorTable {
        kind: PipelineKind,
        param: u32,
        base: GpuDescriptorHandle,
    },
    /// A dynamic buffer bound directly as a root descriptor.
    SetRootBufferView {
        kind: PipelineKind,
        param: u32,
        ty: RangeType,
        address: u64,
    },
    SetRootConstants {
        kind: PipelineKind,
        param: u32,
        values: Vec<u32>,
    },
}

/// Accumulates the native calls for one command list.
#[derive(Debug, Default)]
pub struct CommandRecorder {
    calls: Vec<NativeCall>,
    bound_view_heap: Option<HeapId>,
    bound_sampler_heap: Option<HeapId>,
}

impl CommandRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[NativeCall] {
        &self.calls
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn bound_heaps(&self) -> (Option<HeapId>, Option<HeapId>) {
        (self.bound_view_heap, self.bound_sampler_heap)
    }

    /// Bind heap pointers, eliding the call when both are already bound.
    /// Returns whether a call was recorded (heap pointers changed).
    pub fn set_descriptor_heaps(
        &mut self,
        view_heap: Option<HeapId>,
        sampler_heap: Option<HeapId>,
    ) -> bool {
        if self.bound_view_heap == view_heap && self.bound_sampler_heap == sampler_heap {
            return false;
        }
        self.bound_view_heap = view_heap;
        self.bound_sampler_heap = sampler_heap;
        self.calls.push(NativeCall::SetDescriptorHeaps {
            view_heap,
            sampler_heap,
        });
        true
    }

    pub fn set_root_signature(&mut self, kind: PipelineKind, root_signature: RootSignatureId) {
        self.calls.push(NativeCall::SetRootSignature {
            kind,
            root_signature,
        });
    }

    pub fn set_root_descriptor_table(
        &mut self,
        kind: PipelineKind,
        param: u32,
        base: GpuDescriptorHandle,
    ) {
        self.calls
            .push(NativeCall::SetRootDescriptorTable { kind, param, base });
    }

    pub fn set_root_buffer_view(
        &mut self,
        kind: PipelineKind,
        param: u32,
        ty: RangeType,
        address: u64,
    ) {
        self.calls.push(NativeCall::SetRootBufferView {
            kind,
            param,
            ty,
            address,
        });
    }

    pub fn set_root_constants(&mut self, kind: PipelineKind, param: u32, values: Vec<u32>) {
        self.calls
            .push(NativeCall::SetRootConstants { kind, param, values });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_heap_binds_are_elided() {
        let mut recorder = CommandRecorder::new();
        assert!(recorder.set_descriptor_heaps(Some(HeapId(1)), None));
        assert!(!recorder.set_descriptor_heaps(Some(HeapId(1)), None));
        assert!(recorder.set_descriptor_heaps(Some(HeapId(1)), Some(HeapId(2))));
        assert_eq!(recorder.call_count(), 2);
    }
}
