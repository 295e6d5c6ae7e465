use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use super::{Rest, Transformation};
use crate::{GradValue, OpDef, OpKind, Result, Value, ValueKind};

static GRAD_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// One recorded forward operation.
#[derive(Debug, Clone)]
pub struct TapeEntry {
    pub op: OpDef,
    pub inputs: Vec<Value>,
    pub outputs: Vec<Value>,
}

#[derive(Debug)]
struct GradKeyInner {
    id: u64,
    name: String,
    tape: Mutex<Vec<TapeEntry>>,
}

/// Identifies one gradient recording and owns its tape.
#[derive(Debug, Clone)]
pub struct GradKey(Arc<GradKeyInner>);

impl GradKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::new(GradKeyInner {
            id: GRAD_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            tape: Mutex::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn tape(&self) -> Vec<TapeEntry> {
        self.0.tape.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Records operations touching attached values on a [`GradKey`] tape.
///
/// Only the forward record is kept; computing gradients is left to kernels
/// outside this crate.
pub struct GradTransformation {
    key: GradKey,
    wrapped: Mutex<Vec<Value>>,
}

impl GradTransformation {
    pub fn new(key: GradKey) -> Self {
        Self {
            key,
            wrapped: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &GradKey {
        &self.key
    }

    fn wrap(&self, inner: Value) -> Value {
        let v = Value::new(ValueKind::Grad(GradValue {
            key: self.key.id(),
            inner,
        }));
        self.wrapped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(v.clone());
        v
    }

    /// Start tracking `value`.
    pub fn attach(&self, value: &Value) -> Value {
        self.wrap(value.clone())
    }

    /// The inner value if `value` is tracked by this key.
    fn own(&self, value: &Value) -> Option<Value> {
        match &*value.kind() {
            ValueKind::Grad(g) if g.key == self.key.id() => Some(g.inner.clone()),
            _ => None,
        }
    }
}

impl Transformation for GradTransformation {
    fn name(&self) -> String {
        format!("Grad({})", self.key.name())
    }

    fn try_handle(&self, op: &OpDef, inputs: &[Value], rest: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        if !inputs.iter().any(|v| self.own(v).is_some()) {
            return Ok(None);
        }
        let unwrapped: Vec<Value> = inputs
            .iter()
            .map(|v| self.own(v).unwrap_or_else(|| v.clone()))
            .collect();
        if let OpKind::DetachGrad = op.kind {
            return Ok(Some(unwrapped));
        }
        let outputs = rest.apply(op, &unwrapped)?;
        self.key
            .0
            .tape
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TapeEntry {
                op: op.clone(),
                inputs: unwrapped,
                outputs: outputs.clone(),
            });
        Ok(Some(outputs.into_iter().map(|o| self.wrap(o)).collect()))
    }

    fn on_unregister(&self) {
        let wrapped = std::mem::take(&mut *self.wrapped.lock().unwrap_or_else(|e| e.into_inner()));
        for v in wrapped {
            if let Some(inner) = self.own(&v) {
                let kind = inner.kind().clone();
                v.rebind(kind);
            }
        }
    }
}
