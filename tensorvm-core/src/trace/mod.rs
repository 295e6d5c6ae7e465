//! Trace recording and compiled replay.
//!
//! A [`Trace`] moves through `Untraced -> Tracing -> Traced -> Compiling ->
//! Compiled`. The first `enter` installs a [`TracingTransformation`] that
//! records every apply; `exit` freezes the recording into a [`TraceResult`].
//! Every later `enter` installs a [`CompiledTransformation`] that serves the
//! same sequence of applies from the recorded steps and rejects any
//! deviation with [`crate::Error::TraceContractViolation`].

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use log::debug;

use crate::{
    transformation::{Segment, Transformation},
    Error, HostTensor, Result, Runtime, Value,
};

mod compiled;
mod dump;
mod tracing;

pub use compiled::CompiledTransformation;
pub use dump::{DumpSource, DumpStep, DumpVar, TraceDump, DUMP_VERSION};
pub use tracing::{TraceResult, TraceStep, TraceVar, TracingTransformation, VarSource};

/// Compares a recorded output with its replayed counterpart.
pub type ValueComparator = Arc<dyn Fn(&HostTensor, &HostTensor) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Untraced,
    Tracing,
    Traced,
    Compiling,
    Compiled,
}

enum Active {
    Tracing(Arc<TracingTransformation>),
    Compiled(Arc<CompiledTransformation>),
}

impl Active {
    fn layer(&self) -> Arc<dyn Transformation> {
        match self {
            Self::Tracing(t) => t.clone(),
            Self::Compiled(c) => c.clone(),
        }
    }

    fn set_excluded(&self, excluded: bool) {
        match self {
            Self::Tracing(t) => t.set_excluded(excluded),
            Self::Compiled(c) => c.set_excluded(excluded),
        }
    }
}

/// A recordable, replayable region of operator applications.
pub struct Trace {
    symbolic: bool,
    no_exec: bool,
    capture_as_const: bool,
    record_input_shapes: bool,
    comparator: Option<ValueComparator>,
    state: TraceState,
    result: Option<Arc<TraceResult>>,
    compiled: Option<Arc<CompiledTransformation>>,
    active: Option<Active>,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace {
    pub fn new() -> Self {
        Self {
            symbolic: false,
            no_exec: false,
            capture_as_const: false,
            record_input_shapes: false,
            comparator: None,
            state: TraceState::Untraced,
            result: None,
            compiled: None,
            active: None,
        }
    }

    /// Record without executing; outputs get their layouts from shape inference.
    pub fn symbolic(mut self, symbolic: bool) -> Self {
        self.symbolic = symbolic;
        self
    }

    /// In symbolic mode, skip the execution that normally happens at exit.
    pub fn no_exec(mut self, no_exec: bool) -> Self {
        self.no_exec = no_exec;
        self
    }

    /// Capture unmarked inputs as constants instead of rejecting them.
    pub fn capture_as_const(mut self, capture: bool) -> Self {
        self.capture_as_const = capture;
        self
    }

    pub fn record_input_shapes(mut self, record: bool) -> Self {
        self.record_input_shapes = record;
        self
    }

    /// Compare outputs of each replay with the recorded ones.
    pub fn value_comparator(mut self, comparator: ValueComparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn result(&self) -> Option<&Arc<TraceResult>> {
        self.result.as_ref()
    }

    pub fn enter(&mut self, runtime: &Runtime) -> Result<()> {
        if self.active.is_some() {
            return Err(Error::config("trace is already entered"));
        }
        let active = match self.state {
            TraceState::Untraced => {
                let layer = Arc::new(TracingTransformation::new(
                    self.symbolic,
                    self.capture_as_const,
                    self.record_input_shapes,
                ));
                runtime.register(Segment::Trace, layer.clone())?;
                self.state = TraceState::Tracing;
                Active::Tracing(layer)
            }
            TraceState::Traced | TraceState::Compiled => {
                let compiled = self.compile()?;
                compiled.reset();
                runtime.register(Segment::Trace, compiled.clone())?;
                self.state = TraceState::Compiled;
                Active::Compiled(compiled)
            }
            TraceState::Tracing | TraceState::Compiling => {
                return Err(Error::config(format!("cannot enter a trace in state {:?}", self.state)))
            }
        };
        self.active = Some(active);
        Ok(())
    }

    fn compile(&mut self) -> Result<Arc<CompiledTransformation>> {
        if let Some(c) = &self.compiled {
            return Ok(c.clone());
        }
        let result = self
            .result
            .clone()
            .ok_or_else(|| Error::config("trace has no recorded result"))?;
        self.state = TraceState::Compiling;
        match CompiledTransformation::new(result) {
            Ok(c) => {
                let c = Arc::new(c);
                self.compiled = Some(c.clone());
                Ok(c)
            }
            Err(e) => {
                self.state = TraceState::Traced;
                Err(e)
            }
        }
    }

    pub fn exit(&mut self, runtime: &Runtime) -> Result<()> {
        let active = self
            .active
            .take()
            .ok_or_else(|| Error::config("trace is not entered"))?;
        match active {
            Active::Tracing(layer) => {
                let produced = layer.produced();
                runtime.unregister(&(layer.clone() as Arc<dyn Transformation>))?;
                let result = Arc::new(layer.result());
                debug!(
                    "trace {} recorded {} steps over {} vars",
                    result.id,
                    result.steps.len(),
                    result.vars.len()
                );
                self.result = Some(result.clone());
                self.state = TraceState::Traced;
                if self.symbolic && !self.no_exec {
                    let inputs: HashMap<String, Value> = result
                        .inputs
                        .iter()
                        .filter_map(|(name, var)| {
                            result.vars[*var].value.clone().map(|v| (name.clone(), v))
                        })
                        .collect();
                    let compiled = self.compile()?;
                    self.state = TraceState::Traced;
                    let env = compiled.run(&inputs, &mut |op, args| runtime.apply(op, args))?;
                    for (var, wrapper) in produced {
                        if let Some(v) = env.get(&var) {
                            let kind = v.kind().clone();
                            wrapper.rebind(kind);
                        }
                    }
                }
                Ok(())
            }
            Active::Compiled(compiled) => {
                runtime.unregister(&(compiled.clone() as Arc<dyn Transformation>))?;
                compiled.finish()?;
                if let Some(cmp) = &self.comparator {
                    self.compare(runtime, &compiled, cmp)?;
                }
                Ok(())
            }
        }
    }

    fn compare(
        &self,
        runtime: &Runtime,
        compiled: &CompiledTransformation,
        cmp: &ValueComparator,
    ) -> Result<()> {
        let result = compiled.result();
        for (name, var) in &result.outputs {
            let Some(recorded) = &result.vars[*var].value else {
                continue;
            };
            let replayed = compiled.output(name)?;
            let (a, b) = (runtime.to_host(recorded)?, runtime.to_host(&replayed)?);
            if !cmp(&a, &b) {
                return Err(Error::trace_violation(format!(
                    "output `{name}` differs from the recorded value"
                )));
            }
        }
        Ok(())
    }

    fn active(&self) -> Result<&Active> {
        self.active
            .as_ref()
            .ok_or_else(|| Error::config("trace is not entered"))
    }

    /// Ops applied until [`Trace::end_excluded_region`] are neither recorded
    /// nor checked against the trace.
    pub fn begin_excluded_region(&self) -> Result<()> {
        self.active()?.set_excluded(true);
        Ok(())
    }

    pub fn end_excluded_region(&self) -> Result<()> {
        self.active()?.set_excluded(false);
        Ok(())
    }

    /// Bind a named input. Use the returned value inside the trace.
    pub fn mark_input(&self, name: &str, value: &Value) -> Result<Value> {
        match self.active()? {
            Active::Tracing(t) => t.mark_input(name, value),
            Active::Compiled(c) => c.mark_input(name, value),
        }
    }

    pub fn mark_output(&self, name: &str, value: &Value) -> Result<()> {
        match self.active()? {
            Active::Tracing(t) => t.mark_output(name, value),
            Active::Compiled(c) => c.mark_output(name, value),
        }
    }

    /// Execute the recorded steps directly, bypassing the per-op stack
    /// above the eval layer.
    pub fn run(
        &mut self,
        runtime: &Runtime,
        inputs: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        if self.active.is_some() {
            return Err(Error::config("cannot run a trace while it is entered"));
        }
        let compiled = self.compile()?;
        if self.state == TraceState::Compiling {
            self.state = TraceState::Traced;
        }
        let interpreter = runtime.interpreter();
        let env = compiled.run(inputs, &mut |op, args| {
            crate::transformation::run_terminal(interpreter.as_ref(), op, args)
        })?;
        compiled
            .result()
            .outputs
            .iter()
            .map(|(name, var)| {
                env.get(var)
                    .cloned()
                    .map(|v| (name.clone(), v))
                    .ok_or_else(|| Error::trace_violation(format!("output `{name}` was not produced")))
            })
            .collect()
    }

    /// Serialize the recorded trace.
    pub fn dump(&self, runtime: &Runtime) -> Result<TraceDump> {
        let result = self
            .result
            .as_ref()
            .ok_or_else(|| Error::config("trace has no recorded result"))?;
        TraceDump::from_result(result, runtime)
    }

    pub fn layer(&self) -> Option<Arc<dyn Transformation>> {
        self.active.as_ref().map(Active::layer)
    }
}

impl Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("state", &self.state)
            .field("symbolic", &self.symbolic)
            .field("capture_as_const", &self.capture_as_const)
            .field("steps", &self.result.as_ref().map(|r| r.steps.len()))
            .finish()
    }
}
