use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use log::debug;
use petgraph::{algo::toposort, graph::NodeIndex, Graph as PetGraph};

use super::tracing::{untrace, TraceResult, VarSource};
use crate::{
    transformation::{Rest, Transformation},
    Error, OpDef, OpKind, Result, TensorLayout, TracedValue, Value, ValueKind,
};

/// Checks that `layout` matches what the trace recorded for `var`.
fn check_layout(result: &TraceResult, var: usize, layout: &TensorLayout, what: &str) -> Result<()> {
    let expected = &result.vars[var].layout;
    if expected.is_known() && layout.is_known() && expected.shape != layout.shape {
        return Err(Error::trace_violation(format!(
            "{what}: recorded shape {:?}, got {:?}",
            expected.shape, layout.shape
        )));
    }
    if expected.dtype != layout.dtype {
        return Err(Error::trace_violation(format!(
            "{what}: recorded dtype {}, got {}",
            expected.dtype, layout.dtype
        )));
    }
    Ok(())
}

#[derive(Default)]
struct Session {
    pc: usize,
    env: HashMap<usize, Value>,
    wrappers: Vec<Value>,
}

/// Replays a [`TraceResult`].
///
/// Steps are ordered by a topological sort of their data dependencies.
/// While registered, each intercepted apply must match the next recorded
/// step; its inputs come from the bound trace inputs, captured constants
/// and earlier outputs rather than from the caller.
pub struct CompiledTransformation {
    result: Arc<TraceResult>,
    order: Vec<usize>,
    excluded: AtomicBool,
    session: Mutex<Session>,
}

impl CompiledTransformation {
    pub fn new(result: Arc<TraceResult>) -> Result<Self> {
        let mut g = PetGraph::<usize, ()>::new();
        let nodes: Vec<NodeIndex> = (0..result.steps.len()).map(|i| g.add_node(i)).collect();
        for (i, step) in result.steps.iter().enumerate() {
            for var in &step.inputs {
                if let VarSource::Step { step: src, .. } = result.vars[*var].source {
                    g.add_edge(nodes[src], nodes[i], ());
                }
            }
        }
        let order = toposort(&g, None)
            .map_err(|c| Error::trace_violation(format!("trace has a cycle at step {}", g[c.node_id()])))?
            .into_iter()
            .map(|n| g[n])
            .collect();
        debug!("compiled trace {} with {} steps", result.id, result.steps.len());
        Ok(Self {
            result,
            order,
            excluded: AtomicBool::new(false),
            session: Mutex::new(Session::default()),
        })
    }

    pub fn result(&self) -> &Arc<TraceResult> {
        &self.result
    }

    /// Step indices in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_excluded(&self, excluded: bool) {
        self.excluded.store(excluded, Ordering::SeqCst);
    }

    /// Start a new replay.
    pub fn reset(&self) {
        *self.session() = Session::default();
    }

    fn wrap(&self, session: &mut Session, var: usize, inner: Value) -> Value {
        let v = Value::new(ValueKind::TraceMark(TracedValue {
            trace: self.result.id,
            var,
            layout: inner.layout(),
            inner: Some(inner),
        }));
        session.wrappers.push(v.clone());
        v
    }

    /// Bind the named input of this replay.
    pub fn mark_input(&self, name: &str, value: &Value) -> Result<Value> {
        let var = self
            .result
            .inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| Error::trace_violation(format!("trace has no input `{name}`")))?;
        check_layout(&self.result, var, &value.layout(), &format!("input `{name}`"))?;
        let mut session = self.session();
        session.env.insert(var, value.clone());
        Ok(self.wrap(&mut session, var, value.clone()))
    }

    /// The replayed value of the named output.
    pub fn output(&self, name: &str) -> Result<Value> {
        let var = self
            .result
            .outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| Error::trace_violation(format!("trace has no output `{name}`")))?;
        self.session()
            .env
            .get(&var)
            .cloned()
            .ok_or_else(|| Error::trace_violation(format!("output `{name}` was not produced")))
    }

    /// Checks that `value` is the replayed var recorded as output `name`.
    pub fn mark_output(&self, name: &str, value: &Value) -> Result<()> {
        let expected = self
            .result
            .outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| Error::trace_violation(format!("trace has no output `{name}`")))?;
        match &*value.kind() {
            ValueKind::TraceMark(t) if t.trace == self.result.id && t.var == expected => Ok(()),
            _ => Err(Error::trace_violation(format!(
                "output `{name}` is not the value recorded for it"
            ))),
        }
    }

    fn lookup(&self, env: &HashMap<usize, Value>, var: usize) -> Result<Value> {
        if let Some(v) = env.get(&var) {
            return Ok(v.clone());
        }
        match &self.result.vars[var].source {
            VarSource::Const(v) => Ok(v.clone()),
            VarSource::Input(name) => Err(Error::trace_violation(format!("input `{name}` is not bound"))),
            VarSource::Step { step, .. } => Err(Error::trace_violation(format!(
                "var {var} needs step {step}, which has not run"
            ))),
        }
    }

    fn run_step(
        &self,
        env: &HashMap<usize, Value>,
        index: usize,
        exec: &mut dyn FnMut(&OpDef, &[Value]) -> Result<Vec<Value>>,
    ) -> Result<Vec<(usize, Value)>> {
        let step = &self.result.steps[index];
        let inputs = step
            .inputs
            .iter()
            .map(|v| self.lookup(env, *v))
            .collect::<Result<Vec<_>>>()?;
        let outputs = exec(&step.op, &inputs)?;
        if outputs.len() != step.outputs.len() {
            return Err(Error::trace_violation(format!(
                "step {index} `{}` produced {} outputs, recorded {}",
                step.op,
                outputs.len(),
                step.outputs.len()
            )));
        }
        step.outputs
            .iter()
            .zip(outputs)
            .map(|(var, out)| {
                check_layout(&self.result, *var, &out.layout(), &format!("step {index} `{}`", step.op))?;
                Ok((*var, out))
            })
            .collect()
    }

    /// Execute every step on `exec` with the given named inputs, returning
    /// all var values.
    pub fn run(
        &self,
        inputs: &HashMap<String, Value>,
        exec: &mut dyn FnMut(&OpDef, &[Value]) -> Result<Vec<Value>>,
    ) -> Result<HashMap<usize, Value>> {
        let mut env = HashMap::new();
        for (name, var) in &self.result.inputs {
            let value = inputs
                .get(name)
                .ok_or_else(|| Error::trace_violation(format!("input `{name}` is not bound")))?;
            check_layout(&self.result, *var, &value.layout(), &format!("input `{name}`"))?;
            env.insert(*var, value.clone());
        }
        for index in &self.order {
            let outs = self.run_step(&env, *index, exec)?;
            env.extend(outs);
        }
        Ok(env)
    }

    /// Checks that the replay ran every step.
    pub fn finish(&self) -> Result<()> {
        let pc = self.session().pc;
        if pc != self.result.steps.len() {
            return Err(Error::trace_violation(format!(
                "replay stopped after {pc} of {} steps",
                self.result.steps.len()
            )));
        }
        Ok(())
    }
}

impl Transformation for CompiledTransformation {
    fn name(&self) -> String {
        format!("Compiled({})", self.result.id)
    }

    fn try_handle(&self, op: &OpDef, inputs: &[Value], rest: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        let id = self.result.id;
        if self.excluded.load(Ordering::SeqCst) {
            let concrete = inputs.iter().map(|v| untrace(v, id)).collect::<Result<Vec<_>>>()?;
            return rest.apply(op, &concrete).map(Some);
        }
        match &op.kind {
            OpKind::TraceMark { .. } | OpKind::Rename { .. } | OpKind::DetachGrad => {
                return Ok(Some(inputs.to_vec()))
            }
            OpKind::Drop => {
                let concrete = inputs.iter().map(|v| untrace(v, id)).collect::<Result<Vec<_>>>()?;
                return rest.apply(op, &concrete).map(Some);
            }
            _ => {}
        }

        let (index, env) = {
            let session = self.session();
            (session.pc, session.env.clone())
        };
        let Some(step) = self.result.steps.get(index) else {
            return Err(Error::trace_violation(format!(
                "unexpected {op} after the last of {} recorded steps",
                self.result.steps.len()
            )));
        };
        if step.op != *op {
            return Err(Error::trace_violation(format!(
                "step {index}: expected {}, got {op}",
                step.op
            )));
        }
        if inputs.len() != step.inputs.len() {
            return Err(Error::trace_violation(format!(
                "step {index} `{op}`: {} inputs, recorded {}",
                inputs.len(),
                step.inputs.len()
            )));
        }
        for (i, (v, expected)) in inputs.iter().zip(&step.inputs).enumerate() {
            let matches = match &*v.kind() {
                ValueKind::TraceMark(t) if t.trace == id => t.var == *expected,
                _ => matches!(self.result.vars[*expected].source, VarSource::Const(_)),
            };
            if !matches {
                return Err(Error::trace_violation(format!(
                    "step {index} `{op}`: input {i} is not the recorded var {expected}"
                )));
            }
        }

        let outs = self.run_step(&env, index, &mut |op, inputs| rest.apply(op, inputs))?;
        let mut session = self.session();
        session.pc = index + 1;
        let mut wrapped = Vec::with_capacity(outs.len());
        for (var, value) in outs {
            session.env.insert(var, value.clone());
            wrapped.push(self.wrap(&mut session, var, value));
        }
        Ok(Some(wrapped))
    }

    fn on_unregister(&self) {
        let wrappers = std::mem::take(&mut self.session().wrappers);
        for v in wrappers {
            let inner = match &*v.kind() {
                ValueKind::TraceMark(t) => t.inner.clone(),
                _ => None,
            };
            if let Some(inner) = inner {
                let kind = inner.kind().clone();
                v.rebind(kind);
            }
        }
    }
}
