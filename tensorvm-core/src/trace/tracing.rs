use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex, MutexGuard,
};

use log::trace;

use crate::{
    transformation::{Rest, Transformation},
    Error, OpDef, OpKind, Result, TensorLayout, TracedValue, Value, ValueKind,
};

static TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Where a trace variable comes from.
#[derive(Debug, Clone)]
pub enum VarSource {
    /// Bound by name through `mark_input`.
    Input(String),
    /// A concrete value captured while tracing.
    Const(Value),
    /// Output `index` of step `step`.
    Step { step: usize, index: usize },
}

#[derive(Debug, Clone)]
pub struct TraceVar {
    pub id: usize,
    pub layout: TensorLayout,
    pub source: VarSource,
    /// Set by `TraceMark`/`Rename` ops.
    pub name: Option<String>,
    /// The concrete value seen while tracing, absent in symbolic traces.
    pub value: Option<Value>,
}

/// One recorded operator application.
#[derive(Debug, Clone)]
pub struct TraceStep {
    pub op: OpDef,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub input_shapes: Option<Vec<Vec<usize>>>,
}

/// The immutable product of a finished trace.
#[derive(Debug, Clone)]
pub struct TraceResult {
    pub id: u64,
    pub vars: Vec<TraceVar>,
    pub steps: Vec<TraceStep>,
    pub inputs: Vec<(String, usize)>,
    pub outputs: Vec<(String, usize)>,
}

impl TraceResult {
    pub fn input(&self, name: &str) -> Option<&TraceVar> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| &self.vars[*v])
    }

    pub fn output(&self, name: &str) -> Option<&TraceVar> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| &self.vars[*v])
    }
}

#[derive(Default)]
struct Recorder {
    vars: Vec<TraceVar>,
    steps: Vec<TraceStep>,
    inputs: Vec<(String, usize)>,
    outputs: Vec<(String, usize)>,
    wrappers: Vec<Value>,
}

impl Recorder {
    fn add_var(&mut self, layout: TensorLayout, source: VarSource, value: Option<Value>) -> usize {
        let id = self.vars.len();
        self.vars.push(TraceVar {
            id,
            layout,
            source,
            name: None,
            value,
        });
        id
    }
}

/// Replace a traced value by the concrete value it carries.
pub(crate) fn untrace(value: &Value, trace: u64) -> Result<Value> {
    match &*value.kind() {
        ValueKind::TraceMark(t) if t.trace == trace => t.inner.clone().ok_or_else(|| {
            Error::trace_violation(format!(
                "var {} of trace {trace} has no value in a symbolic trace",
                t.var
            ))
        }),
        _ => Ok(value.clone()),
    }
}

/// Records every operator application passing the trace segment.
pub struct TracingTransformation {
    id: u64,
    symbolic: bool,
    capture_as_const: bool,
    record_input_shapes: bool,
    excluded: AtomicBool,
    recorder: Mutex<Recorder>,
}

impl TracingTransformation {
    pub fn new(symbolic: bool, capture_as_const: bool, record_input_shapes: bool) -> Self {
        Self {
            id: TRACE_ID.fetch_add(1, Ordering::Relaxed),
            symbolic,
            capture_as_const,
            record_input_shapes,
            excluded: AtomicBool::new(false),
            recorder: Mutex::new(Recorder::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_excluded(&self, excluded: bool) {
        self.excluded.store(excluded, Ordering::SeqCst);
    }

    fn wrap(&self, rec: &mut Recorder, var: usize, layout: TensorLayout, inner: Option<Value>) -> Value {
        let v = Value::new(ValueKind::TraceMark(TracedValue {
            trace: self.id,
            var,
            layout,
            inner,
        }));
        rec.wrappers.push(v.clone());
        v
    }

    /// The var a value stands for, capturing untraced values as constants.
    fn var_of(&self, rec: &mut Recorder, value: &Value) -> Result<usize> {
        if let ValueKind::TraceMark(t) = &*value.kind() {
            if t.trace == self.id {
                return Ok(t.var);
            }
            crate::bail!(
                "value #{} belongs to trace {}, not trace {}",
                value.id(),
                t.trace,
                self.id
            );
        }
        if !self.capture_as_const {
            return Err(Error::trace_violation(format!(
                "value #{} entered the trace without mark_input; mark it or enable capture_as_const",
                value.id()
            )));
        }
        Ok(rec.add_var(value.layout(), VarSource::Const(value.clone()), Some(value.clone())))
    }

    /// Declare `value` as the named trace input.
    pub fn mark_input(&self, name: &str, value: &Value) -> Result<Value> {
        let mut rec = self.recorder();
        if rec.inputs.iter().any(|(n, _)| n == name) {
            return Err(Error::trace_violation(format!("input `{name}` marked twice")));
        }
        let layout = value.layout();
        let var = rec.add_var(layout.clone(), VarSource::Input(name.to_string()), Some(value.clone()));
        rec.vars[var].name = Some(name.to_string());
        rec.inputs.push((name.to_string(), var));
        Ok(self.wrap(&mut rec, var, layout, Some(value.clone())))
    }

    /// Declare `value` as the named trace output.
    pub fn mark_output(&self, name: &str, value: &Value) -> Result<()> {
        let mut rec = self.recorder();
        let var = self.var_of(&mut rec, value)?;
        if rec.outputs.iter().any(|(n, _)| n == name) {
            return Err(Error::trace_violation(format!("output `{name}` marked twice")));
        }
        rec.outputs.push((name.to_string(), var));
        Ok(())
    }

    /// Freeze what was recorded. Wrapper values handed out stay valid.
    pub fn result(&self) -> TraceResult {
        let rec = self.recorder();
        TraceResult {
            id: self.id,
            vars: rec.vars.clone(),
            steps: rec.steps.clone(),
            inputs: rec.inputs.clone(),
            outputs: rec.outputs.clone(),
        }
    }

    /// Wrapper values created for step outputs, with their var ids.
    pub(crate) fn produced(&self) -> Vec<(usize, Value)> {
        self.recorder()
            .wrappers
            .iter()
            .filter_map(|v| match &*v.kind() {
                ValueKind::TraceMark(t) if t.trace == self.id => Some((t.var, v.clone())),
                _ => None,
            })
            .collect()
    }
}

impl Transformation for TracingTransformation {
    fn name(&self) -> String {
        format!("Tracing({})", self.id)
    }

    fn try_handle(&self, op: &OpDef, inputs: &[Value], rest: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        if self.excluded.load(Ordering::SeqCst) {
            let concrete = inputs
                .iter()
                .map(|v| untrace(v, self.id))
                .collect::<Result<Vec<_>>>()?;
            return rest.apply(op, &concrete).map(Some);
        }
        match &op.kind {
            OpKind::TraceMark { name } | OpKind::Rename { name } => {
                let mut rec = self.recorder();
                for v in inputs {
                    let var = self.var_of(&mut rec, v)?;
                    rec.vars[var].name = Some(name.clone());
                }
                return Ok(Some(inputs.to_vec()));
            }
            OpKind::DetachGrad => return Ok(Some(inputs.to_vec())),
            OpKind::Drop => {
                if self.symbolic {
                    return Ok(Some(Vec::new()));
                }
                let concrete = inputs
                    .iter()
                    .map(|v| untrace(v, self.id))
                    .collect::<Result<Vec<_>>>()?;
                return rest.apply(op, &concrete).map(Some);
            }
            _ => {}
        }

        let mut rec = self.recorder();
        let in_vars = inputs
            .iter()
            .map(|v| self.var_of(&mut rec, v))
            .collect::<Result<Vec<_>>>()?;
        let layouts: Vec<TensorLayout> = in_vars.iter().map(|v| rec.vars[*v].layout.clone()).collect();

        let outputs: Vec<(TensorLayout, Option<Value>)> = if self.symbolic {
            let (out, _) = op.infer_output_layouts(&layouts)?;
            out.into_iter().map(|l| (l, None)).collect()
        } else {
            let concrete = inputs
                .iter()
                .map(|v| untrace(v, self.id))
                .collect::<Result<Vec<_>>>()?;
            // Layers below may re-enter apply; do not hold the recorder.
            drop(rec);
            let out = rest.apply(op, &concrete)?;
            rec = self.recorder();
            out.into_iter().map(|v| (v.layout(), Some(v))).collect()
        };

        let step = rec.steps.len();
        let mut out_vars = Vec::with_capacity(outputs.len());
        let mut wrapped = Vec::with_capacity(outputs.len());
        for (index, (layout, inner)) in outputs.into_iter().enumerate() {
            let var = rec.add_var(layout.clone(), VarSource::Step { step, index }, inner.clone());
            out_vars.push(var);
            wrapped.push(self.wrap(&mut rec, var, layout, inner));
        }
        trace!("trace {} step {step}: {op} {in_vars:?} -> {out_vars:?}", self.id);
        rec.steps.push(TraceStep {
            op: op.clone(),
            inputs: in_vars,
            outputs: out_vars,
            input_shapes: self
                .record_input_shapes
                .then(|| layouts.iter().map(|l| l.shape.clone()).collect()),
        });
        Ok(Some(wrapped))
    }

    fn on_unregister(&self) {
        let wrappers = std::mem::take(&mut self.recorder().wrappers);
        for v in wrappers {
            let inner = match &*v.kind() {
                ValueKind::TraceMark(t) if t.trace == self.id => t.inner.clone(),
                _ => None,
            };
            if let Some(inner) = inner {
                let kind = inner.kind().clone();
                v.rebind(kind);
            }
        }
    }
}
