use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard,
    },
};

use crate::{CompNode, DType, HostTensor, TensorHandle, TensorLayout};

static VALUE_ID: AtomicU64 = AtomicU64::new(1);

/// A host scalar handled on the scalar fast path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarValue {
    pub value: f64,
    pub dtype: DType,
    pub device: CompNode,
}

/// A node of a symbolic [`crate::ComputingGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicNode {
    pub graph: u64,
    pub node: usize,
    pub layout: TensorLayout,
}

/// A value tracked by a gradient key.
#[derive(Debug, Clone)]
pub struct GradValue {
    pub key: u64,
    pub inner: Value,
}

/// A variable of a trace, optionally carrying the concrete value it stands for.
#[derive(Debug, Clone)]
pub struct TracedValue {
    pub trace: u64,
    pub var: usize,
    pub layout: TensorLayout,
    pub inner: Option<Value>,
}

/// Interpretation stage of a [`Value`]. Only the transformation that
/// introduced a variant unwraps it.
#[derive(Debug, Clone)]
pub enum ValueKind {
    Host(HostTensor),
    Device(TensorHandle),
    Scalar(ScalarValue),
    Symbolic(SymbolicNode),
    Grad(GradValue),
    TraceMark(TracedValue),
}

impl ValueKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Host(_) => "Host",
            Self::Device(_) => "Device",
            Self::Scalar(_) => "Scalar",
            Self::Symbolic(_) => "Symbolic",
            Self::Grad(_) => "Grad",
            Self::TraceMark(_) => "TraceMark",
        }
    }
}

struct ValueCell {
    id: u64,
    kind: RwLock<ValueKind>,
}

/// A reference-counted handle to a tensor-like quantity.
///
/// Clones share the same cell, so a transformation that rebinds a value on
/// unregistration is seen by every holder.
#[derive(Clone)]
pub struct Value(Arc<ValueCell>);

impl Value {
    pub fn new(kind: ValueKind) -> Self {
        Self(Arc::new(ValueCell {
            id: VALUE_ID.fetch_add(1, Ordering::Relaxed),
            kind: RwLock::new(kind),
        }))
    }

    pub fn host(tensor: HostTensor) -> Self {
        Self::new(ValueKind::Host(tensor))
    }

    pub fn device(handle: TensorHandle) -> Self {
        Self::new(ValueKind::Device(handle))
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::new(ValueKind::Scalar(ScalarValue {
            value,
            dtype,
            device: CompNode::default(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn kind(&self) -> RwLockReadGuard<'_, ValueKind> {
        self.0.kind.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tag(&self) -> &'static str {
        self.kind().tag()
    }

    /// Replace what the handle stands for.
    pub(crate) fn rebind(&self, kind: ValueKind) {
        *self.0.kind.write().unwrap_or_else(|e| e.into_inner()) = kind;
    }

    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn layout(&self) -> TensorLayout {
        match &*self.kind() {
            ValueKind::Host(t) => t.layout().clone(),
            ValueKind::Device(h) => h.layout(),
            ValueKind::Scalar(s) => TensorLayout::new(Vec::new(), s.dtype, s.device),
            ValueKind::Symbolic(n) => n.layout.clone(),
            ValueKind::Grad(g) => g.inner.layout(),
            ValueKind::TraceMark(t) => t.layout.clone(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.layout().dtype
    }

    pub fn shape(&self) -> Vec<usize> {
        self.layout().shape
    }

    pub fn is_scalar(&self) -> bool {
        matches!(&*self.kind(), ValueKind::Scalar(_))
    }

    pub fn as_scalar(&self) -> Option<ScalarValue> {
        match &*self.kind() {
            ValueKind::Scalar(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_host(&self) -> Option<HostTensor> {
        match &*self.kind() {
            ValueKind::Host(t) => Some(t.clone()),
            _ => None,
        }
    }

    pub fn as_device(&self) -> Option<TensorHandle> {
        match &*self.kind() {
            ValueKind::Device(h) => Some(h.clone()),
            _ => None,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value#{}({:?})", self.0.id, &*self.kind())
    }
}

impl From<HostTensor> for Value {
    fn from(t: HostTensor) -> Self {
        Self::host(t)
    }
}
