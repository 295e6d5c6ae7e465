//! The transformation stack.
//!
//! `apply(op, inputs)` descends through registered layers grouped by
//! [`Segment`]. Segments are consulted in declaration order; within a segment
//! the most recently registered layer goes first. A layer either resolves the
//! call, or rewrites it and re-invokes the layers below it through [`Rest`].
//! The Eval segment is terminal: only its topmost layer is consulted.

use std::{
    cell::Cell,
    fmt::Debug,
    sync::{Arc, RwLock},
};

use log::debug;

use crate::{Error, OpDef, Result, Value};

mod dtype_promote;
mod eval;
mod grad;
mod module_trace;
mod scalar;
mod symbol;

pub use dtype_promote::DTypePromoteTransformation;
pub use eval::InterpreterTransformation;
pub use grad::{GradKey, GradTransformation, TapeEntry};
pub use module_trace::{ModuleHook, ModuleTraceTransformation};
pub use scalar::ScalarTransformation;
pub use symbol::{ComputingGraph, GraphNode, LazyEvalTransformation, SymbolTransformation};

/// Extension points of the stack, in consultation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    ModuleTrace,
    DTypePromote,
    Grad,
    Scalar,
    Trace,
    Eval,
}

/// An interpreter layer.
pub trait Transformation: Send + Sync {
    fn name(&self) -> String;

    /// Resolve the call, or return `None` to delegate to the layers below.
    fn try_handle(&self, op: &OpDef, inputs: &[Value], rest: &Rest<'_>) -> Result<Option<Vec<Value>>>;

    /// Called once the layer left the stack. Layers that introduced wrapper
    /// values rebind them here.
    fn on_unregister(&self) {}
}

#[derive(Clone)]
struct Entry {
    segment: Segment,
    layer: Arc<dyn Transformation>,
}

/// The layers below the one currently handling a call.
pub struct Rest<'a> {
    entries: &'a [Entry],
}

impl Rest<'_> {
    pub fn apply(&self, op: &OpDef, inputs: &[Value]) -> Result<Vec<Value>> {
        for (i, entry) in self.entries.iter().enumerate() {
            let rest = Rest {
                entries: &self.entries[i + 1..],
            };
            if entry.segment == Segment::Eval {
                return match entry.layer.try_handle(op, inputs, &Rest { entries: &[] })? {
                    Some(outputs) => Ok(outputs),
                    None => Err(Error::config(format!(
                        "eval layer `{}` declined {op}",
                        entry.layer.name()
                    ))),
                };
            }
            if let Some(outputs) = entry.layer.try_handle(op, inputs, &rest)? {
                return Ok(outputs);
            }
        }
        Err(Error::config(format!(
            "no eval transformation registered to handle {op}"
        )))
    }

    /// True if nothing is left below.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run `op` on an eval layer outside of any stack.
pub(crate) fn run_terminal(layer: &dyn Transformation, op: &OpDef, inputs: &[Value]) -> Result<Vec<Value>> {
    match layer.try_handle(op, inputs, &Rest { entries: &[] })? {
        Some(outputs) => Ok(outputs),
        None => Err(Error::config(format!(
            "eval layer `{}` declined {op}",
            layer.name()
        ))),
    }
}

thread_local! {
    static IN_FLIGHT: Cell<usize> = const { Cell::new(0) };
}

struct InFlight;

impl InFlight {
    fn enter() -> Self {
        IN_FLIGHT.with(|c| c.set(c.get() + 1));
        Self
    }

    fn active() -> bool {
        IN_FLIGHT.with(|c| c.get() > 0)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        IN_FLIGHT.with(|c| c.set(c.get() - 1));
    }
}

/// Ordered registry of transformation layers.
///
/// Push and pop are the only mutators, and they are rejected while an
/// `apply` is in flight on the calling thread.
#[derive(Default)]
pub struct TransformationManager {
    entries: RwLock<Vec<Entry>>,
}

impl TransformationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, segment: Segment, layer: Arc<dyn Transformation>) -> Result<()> {
        if InFlight::active() {
            return Err(Error::config(format!(
                "cannot register `{}` while an apply is in flight",
                layer.name()
            )));
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.iter().any(|e| Arc::ptr_eq(&e.layer, &layer)) {
            return Err(Error::config(format!(
                "`{}` is already registered",
                layer.name()
            )));
        }
        // Newest first within its segment.
        let pos = entries
            .iter()
            .position(|e| e.segment >= segment)
            .unwrap_or(entries.len());
        debug!("register {} at {segment:?}", layer.name());
        entries.insert(pos, Entry { segment, layer });
        Ok(())
    }

    pub fn unregister(&self, layer: &Arc<dyn Transformation>) -> Result<()> {
        if InFlight::active() {
            return Err(Error::config(format!(
                "cannot unregister `{}` while an apply is in flight",
                layer.name()
            )));
        }
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(&e.layer, layer)) else {
                return Err(Error::config(format!(
                    "`{}` is not registered",
                    layer.name()
                )));
            };
            entries.remove(pos)
        };
        debug!("unregister {} from {:?}", removed.layer.name(), removed.segment);
        removed.layer.on_unregister();
        Ok(())
    }

    pub fn is_registered(&self, layer: &Arc<dyn Transformation>) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| Arc::ptr_eq(&e.layer, layer))
    }

    /// `(segment, layer name)` in consultation order.
    pub fn layers(&self) -> Vec<(Segment, String)> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| (e.segment, e.layer.name()))
            .collect()
    }

    /// Dispatch `op` through the stack.
    pub fn apply(&self, op: &OpDef, inputs: &[Value]) -> Result<Vec<Value>> {
        let snapshot = self.entries.read().unwrap_or_else(|e| e.into_inner()).clone();
        let _guard = InFlight::enter();
        Rest { entries: &snapshot }.apply(op, inputs)
    }
}

impl Debug for TransformationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.layers()).finish()
    }
}

/// Unwrap trace and gradient wrappers down to the value they carry.
pub(crate) fn strip(value: &Value) -> Option<Value> {
    match &*value.kind() {
        crate::ValueKind::Grad(g) => Some(g.inner.clone()),
        crate::ValueKind::TraceMark(t) => t.inner.clone(),
        _ => None,
    }
}
