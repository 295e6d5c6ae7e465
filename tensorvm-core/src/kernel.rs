use crate::{AlgoInfo, HostTensor, OpDef, Result, TensorLayout};

/// The device-kernel boundary.
///
/// The channel worker calls a kernel for shape inference of undetermined
/// outputs, for the candidate algorithms of an operator and to execute it.
/// The provided methods dispatch to the reference CPU implementations of the
/// operator table; a backend overrides what it implements natively.
pub trait Kernel: Send + Sync {
    /// Part of the algorithm cache key.
    fn name(&self) -> &str {
        "cpu"
    }

    fn infer_output_layouts(
        &self,
        op: &OpDef,
        inputs: &[TensorLayout],
    ) -> Result<(Vec<TensorLayout>, bool)> {
        op.infer_output_layouts(inputs)
    }

    /// Candidate algorithms in priority order.
    fn algorithms(
        &self,
        op: &OpDef,
        inputs: &[TensorLayout],
        outputs: &[TensorLayout],
    ) -> Vec<AlgoInfo> {
        (op.kind.op_trait().algorithms)(&op.kind, inputs, outputs)
    }

    fn execute(
        &self,
        op: &OpDef,
        algo: &AlgoInfo,
        inputs: &[HostTensor],
        outputs: &mut [HostTensor],
        workspace: &mut [u8],
    ) -> Result<()> {
        (op.kind.op_trait().execute)(&op.kind, algo, inputs, outputs, workspace)
    }
}

/// Reference kernels running on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernel;

impl Kernel for CpuKernel {}
