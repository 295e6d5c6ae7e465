//! tensorvm is an imperative tensor-operation dispatch engine.
//!
//! Every operator application goes through `apply(op, inputs)`, which walks a stack of
//! interpreter layers ([`Transformation`]s). A layer may resolve the call, rewrite it and pass
//! it down, or decline it. At the bottom sits an Eval layer: either the interpreter, which
//! enqueues the operator on an asynchronous execution [`Channel`], or a symbolic layer that
//! records graph nodes without touching device memory.
//!
//! The channel executes commands in submission order on a single worker thread. Device memory
//! comes from the process-wide [`BlobManager`], kernel strategies from the process-wide
//! [`AlgoChooser`]. Errors raised on the worker are reported later, at the next sync point, as
//! [`Error::Async`].
//!
//! ## A quick guide
//! - Create a [`Runtime`]. It owns a channel and registers the default layers.
//! - Upload data with [`Runtime::put`], or pass [`HostTensor`]s wrapped in [`Value`]s directly.
//! - Build operators with the [`OpDef`] constructors and run them with [`Runtime::apply`].
//! - Read results with [`Runtime::to_host`], which waits for the channel.
//! - Record a region once with a [`Trace`] and replay it on later entries.
//!
//! ## What can you do with it?
//! ```
//! use tensorvm_core::{CompNode, ConvParam, HostTensor, OpDef, Runtime};
//!
//! let rt = Runtime::new().unwrap();
//! let dev = CompNode::cpu(0);
//! let x = rt
//!     .put(HostTensor::from_f32(&[1, 1, 3, 3], dev, &[1.0; 9]).unwrap())
//!     .unwrap();
//! let w = rt
//!     .put(HostTensor::from_f32(&[1, 1, 2, 2], dev, &[1.0; 4]).unwrap())
//!     .unwrap();
//!
//! let y = rt.apply(&OpDef::conv(ConvParam::default()), &[x, w]).unwrap();
//! assert_eq!(y[0].shape(), vec![1, 1, 2, 2]);
//!
//! let host = rt.to_host(&y[0]).unwrap();
//! assert_eq!(host.to_f32_vec(), vec![4.0; 4]);
//! rt.close().unwrap();
//! ```

mod algo;
mod blob;
mod channel;
mod device;
mod dtype;
mod error;
mod kernel;
mod layout;
mod op;
mod runtime;
mod tensor;
pub mod trace;
pub mod transformation;
mod value;

pub use algo::{AlgoChooser, AlgoInfo};
pub use blob::{Blob, BlobManager, BlobStats, ALIGNMENT, DEFAULT_DEVICE_CAPACITY};
pub use channel::{
    Channel, ChannelOptions, ChannelStats, TensorHandle, ASYNC_LEVEL, ENABLE_AUTO_DROP,
    RECORD_INPUT_SHAPES,
};
pub use device::{CompNode, DeviceKind};
pub use dtype::DType;
pub use error::{AsyncOrigin, Context, Error, Result};
pub use kernel::{CpuKernel, Kernel};
pub use layout::{contiguous_strides, TensorLayout};
pub use op::{
    ConvFormat, ConvParam, ConvSparse, ElemwiseMode, ExecutionPolicy, MatMulParam, OpDef, OpKind,
    OpTrait,
};
pub use runtime::Runtime;
pub use tensor::HostTensor;
pub use trace::{Trace, TraceDump, TraceResult, TraceState, ValueComparator};
pub use transformation::{
    ComputingGraph, LazyEvalTransformation, Segment, SymbolTransformation, Transformation,
    TransformationManager,
};
pub use value::{GradValue, ScalarValue, SymbolicNode, TracedValue, Value, ValueKind};
