//! Operator descriptors.
//!
//! [`OpKind`] is a closed set of operators. Per-kind behavior lives in a
//! static [`OpTrait`] table entry selected by [`OpKind::op_trait`], so adding
//! an operator means adding a variant and a table entry, never a trait object.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{AlgoInfo, CompNode, DType, HostTensor, Result, TensorLayout};

mod conv;
mod elemwise;
mod indexing;
mod matmul;
mod misc;

pub use conv::{ConvFormat, ConvParam, ConvSparse};
pub use elemwise::ElemwiseMode;
pub use matmul::MatMulParam;

pub(crate) use conv::infer_conv_shape;
pub(crate) use elemwise::broadcast_shapes;

/// Infers output layouts. The flag is `false` when some output shape could
/// not be determined from the given input layouts.
pub type InferFn = fn(&OpKind, &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)>;
/// Lists candidate algorithms in priority order.
pub type AlgorithmsFn = fn(&OpKind, &[TensorLayout], &[TensorLayout]) -> Vec<AlgoInfo>;
/// Runs the reference CPU kernel.
pub type ExecuteFn =
    fn(&OpKind, &AlgoInfo, &[HostTensor], &mut [HostTensor], &mut [u8]) -> Result<()>;

/// Behavior bundle of one operator kind.
pub struct OpTrait {
    pub name: &'static str,
    pub infer_output_layouts: InferFn,
    pub algorithms: AlgorithmsFn,
    pub execute: ExecuteFn,
}

/// Preferred algorithm and workspace budget.
///
/// Part of the algorithm cache key: a distinct hint always triggers a fresh
/// selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub algo: Option<String>,
    pub workspace_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Convolution(ConvParam),
    MatrixMul(MatMulParam),
    Elemwise(ElemwiseMode),
    IndexingOneHot {
        axis: usize,
    },
    TypeCvt {
        dtype: DType,
    },
    Reshape {
        shape: Vec<usize>,
    },
    Uniform {
        shape: Vec<usize>,
        device: CompNode,
        seed: u64,
    },
    Gaussian {
        shape: Vec<usize>,
        device: CompNode,
        mean: f64,
        std: f64,
        seed: u64,
    },
    /// Release the input's device storage.
    Drop,
    /// Name a traced variable.
    TraceMark {
        name: String,
    },
    Rename {
        name: String,
    },
    /// Stop gradient tracking of the input.
    DetachGrad,
}

impl OpKind {
    pub fn op_trait(&self) -> &'static OpTrait {
        match self {
            Self::Convolution(_) => &conv::CONVOLUTION,
            Self::MatrixMul(_) => &matmul::MATRIX_MUL,
            Self::Elemwise(_) => &elemwise::ELEMWISE,
            Self::IndexingOneHot { .. } => &indexing::INDEXING_ONE_HOT,
            Self::TypeCvt { .. } => &misc::TYPE_CVT,
            Self::Reshape { .. } => &misc::RESHAPE,
            Self::Uniform { .. } => &misc::UNIFORM,
            Self::Gaussian { .. } => &misc::GAUSSIAN,
            Self::Drop => &misc::DROP,
            Self::TraceMark { .. } => &misc::TRACE_MARK,
            Self::Rename { .. } => &misc::RENAME,
            Self::DetachGrad => &misc::DETACH_GRAD,
        }
    }

    pub fn name(&self) -> &'static str {
        self.op_trait().name
    }

    /// Control commands are consumed by transformations and never reach a kernel.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Drop | Self::TraceMark { .. } | Self::Rename { .. } | Self::DetachGrad
        )
    }
}

/// An immutable operator descriptor: kind, parameters and policy hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDef {
    pub kind: OpKind,
    #[serde(default)]
    pub policy: ExecutionPolicy,
}

impl OpDef {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            policy: ExecutionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn conv(param: ConvParam) -> Self {
        Self::new(OpKind::Convolution(param))
    }

    pub fn matmul(transpose_a: bool, transpose_b: bool) -> Self {
        Self::new(OpKind::MatrixMul(MatMulParam {
            transpose_a,
            transpose_b,
        }))
    }

    pub fn elemwise(mode: ElemwiseMode) -> Self {
        Self::new(OpKind::Elemwise(mode))
    }

    pub fn one_hot(axis: usize) -> Self {
        Self::new(OpKind::IndexingOneHot { axis })
    }

    pub fn type_cvt(dtype: DType) -> Self {
        Self::new(OpKind::TypeCvt { dtype })
    }

    pub fn reshape(shape: impl Into<Vec<usize>>) -> Self {
        Self::new(OpKind::Reshape {
            shape: shape.into(),
        })
    }

    pub fn uniform(shape: impl Into<Vec<usize>>, device: CompNode, seed: u64) -> Self {
        Self::new(OpKind::Uniform {
            shape: shape.into(),
            device,
            seed,
        })
    }

    pub fn gaussian(
        shape: impl Into<Vec<usize>>,
        device: CompNode,
        mean: f64,
        std: f64,
        seed: u64,
    ) -> Self {
        Self::new(OpKind::Gaussian {
            shape: shape.into(),
            device,
            mean,
            std,
            seed,
        })
    }

    pub fn drop_op() -> Self {
        Self::new(OpKind::Drop)
    }

    pub fn trace_mark(name: impl Into<String>) -> Self {
        Self::new(OpKind::TraceMark { name: name.into() })
    }

    pub fn rename(name: impl Into<String>) -> Self {
        Self::new(OpKind::Rename { name: name.into() })
    }

    pub fn detach_grad() -> Self {
        Self::new(OpKind::DetachGrad)
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_control(&self) -> bool {
        self.kind.is_control()
    }

    pub fn infer_output_layouts(
        &self,
        inputs: &[TensorLayout],
    ) -> Result<(Vec<TensorLayout>, bool)> {
        (self.kind.op_trait().infer_output_layouts)(&self.kind, inputs)
    }

    /// Key of the operator's parameters, used by the algorithm cache.
    pub fn param_key(&self) -> String {
        format!("{:?}", self.kind)
    }
}

impl Display for OpDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OpKind::Elemwise(mode) => write!(f, "Elemwise({mode:?})"),
            OpKind::TraceMark { name } => write!(f, "TraceMark({name})"),
            OpKind::Rename { name } => write!(f, "Rename({name})"),
            OpKind::TypeCvt { dtype } => write!(f, "TypeCvt({dtype})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Check the number of inputs an operator receives.
pub(crate) fn check_arity(kind: &OpKind, inputs: usize, expected: usize) -> Result<()> {
    if inputs != expected {
        crate::shape_bail!(
            "{} expects {expected} inputs, got {inputs}",
            kind.name()
        );
    }
    Ok(())
}

/// The single algorithm of operators without alternatives.
pub(crate) fn default_algorithm(
    _: &OpKind,
    _: &[TensorLayout],
    _: &[TensorLayout],
) -> Vec<AlgoInfo> {
    vec![AlgoInfo::new("DEFAULT", 0)]
}
