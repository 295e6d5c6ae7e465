use std::sync::atomic::{AtomicBool, Ordering};

use super::{Rest, Transformation};
use crate::{OpDef, Result, Value};

/// Observer of every operator application passing the module-trace segment.
pub type ModuleHook = Box<dyn Fn(&OpDef, &[Value], &[Value]) + Send + Sync>;

/// Reports `(op, inputs, outputs)` of each apply to a hook while enabled.
pub struct ModuleTraceTransformation {
    hook: ModuleHook,
    enabled: AtomicBool,
}

impl ModuleTraceTransformation {
    pub fn new(hook: ModuleHook) -> Self {
        Self {
            hook,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl Transformation for ModuleTraceTransformation {
    fn name(&self) -> String {
        "ModuleTrace".to_string()
    }

    fn try_handle(&self, op: &OpDef, inputs: &[Value], rest: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let outputs = rest.apply(op, inputs)?;
        (self.hook)(op, inputs, &outputs);
        Ok(Some(outputs))
    }
}
