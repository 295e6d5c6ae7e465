use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use serde::{Deserialize, Serialize};

use super::tracing::{TraceResult, VarSource};
use crate::{Context, Error, HostTensor, OpDef, Result, Runtime, TensorLayout, Value};

pub const DUMP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DumpSource {
    Input { name: String },
    Const { data: Vec<u8> },
    Step { step: usize, index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpVar {
    pub layout: TensorLayout,
    pub source: DumpSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpStep {
    pub op: OpDef,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// A serialized trace: vars, steps and named bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceDump {
    pub version: u32,
    pub vars: Vec<DumpVar>,
    pub steps: Vec<DumpStep>,
    pub inputs: Vec<(String, usize)>,
    pub outputs: Vec<(String, usize)>,
}

impl TraceDump {
    /// Build a dump, reading captured constants back through `runtime`.
    pub fn from_result(result: &TraceResult, runtime: &Runtime) -> Result<Self> {
        let vars = result
            .vars
            .iter()
            .map(|v| {
                let source = match &v.source {
                    VarSource::Input(name) => DumpSource::Input { name: name.clone() },
                    VarSource::Const(value) => {
                        let host = runtime
                            .to_host(value)
                            .with_context(|| format!("reading constant var {}", v.id))?;
                        DumpSource::Const {
                            data: host.into_bytes(),
                        }
                    }
                    VarSource::Step { step, index } => DumpSource::Step {
                        step: *step,
                        index: *index,
                    },
                };
                Ok(DumpVar {
                    layout: v.layout.clone(),
                    source,
                    name: v.name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let steps = result
            .steps
            .iter()
            .map(|s| DumpStep {
                op: s.op.clone(),
                inputs: s.inputs.clone(),
                outputs: s.outputs.clone(),
            })
            .collect();
        Ok(Self {
            version: DUMP_VERSION,
            vars,
            steps,
            inputs: result.inputs.clone(),
            outputs: result.outputs.clone(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let dump: Self = serde_json::from_str(json)?;
        if dump.version != DUMP_VERSION {
            crate::bail!(
                "unsupported trace dump version {} (expected {DUMP_VERSION})",
                dump.version
            );
        }
        Ok(dump)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        debug!("trace dump saved to {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading trace dump {}", path.as_ref().display()))?;
        Self::from_json(&json)
    }

    /// Default location of a named dump under the user cache directory.
    pub fn cache_path(name: &str) -> Result<PathBuf> {
        let dir = dirs::cache_dir().context("no user cache directory")?;
        Ok(dir.join("tensorvm").join("traces").join(format!("{name}.json")))
    }

    /// Re-apply the dumped ops through `runtime`, returning named outputs.
    pub fn replay(
        &self,
        runtime: &Runtime,
        inputs: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let mut env: HashMap<usize, Value> = HashMap::new();
        for (name, var) in &self.inputs {
            let value = inputs
                .get(name)
                .ok_or_else(|| Error::trace_violation(format!("input `{name}` is not bound")))?;
            let expected = &self.var(*var)?.layout;
            if expected.shape != value.shape() || expected.dtype != value.dtype() {
                return Err(Error::trace_violation(format!(
                    "input `{name}`: recorded {}, got {}",
                    expected.signature(),
                    value.layout().signature()
                )));
            }
            env.insert(*var, value.clone());
        }
        for (i, step) in self.steps.iter().enumerate() {
            let args = step
                .inputs
                .iter()
                .map(|var| self.resolve(&env, *var))
                .collect::<Result<Vec<_>>>()?;
            let outs = runtime.apply(&step.op, &args)?;
            if outs.len() != step.outputs.len() {
                return Err(Error::trace_violation(format!(
                    "step {i} `{}` produced {} outputs, recorded {}",
                    step.op,
                    outs.len(),
                    step.outputs.len()
                )));
            }
            for (var, out) in step.outputs.iter().zip(outs) {
                let expected = &self.var(*var)?.layout;
                if expected.is_known() && expected.shape != out.shape() {
                    return Err(Error::trace_violation(format!(
                        "step {i} `{}`: recorded shape {:?}, got {:?}",
                        step.op,
                        expected.shape,
                        out.shape()
                    )));
                }
                env.insert(*var, out);
            }
        }
        self.outputs
            .iter()
            .map(|(name, var)| Ok((name.clone(), self.resolve(&env, *var)?)))
            .collect()
    }

    fn var(&self, id: usize) -> Result<&DumpVar> {
        self.vars
            .get(id)
            .ok_or_else(|| Error::trace_violation(format!("dump refers to missing var {id}")))
    }

    fn resolve(&self, env: &HashMap<usize, Value>, id: usize) -> Result<Value> {
        if let Some(v) = env.get(&id) {
            return Ok(v.clone());
        }
        let var = self.var(id)?;
        match &var.source {
            DumpSource::Const { data } => Ok(Value::host(HostTensor::from_bytes(
                var.layout.contiguous(),
                data.clone(),
            )?)),
            DumpSource::Input { name } => Err(Error::trace_violation(format!("input `{name}` is not bound"))),
            DumpSource::Step { step, .. } => Err(Error::trace_violation(format!(
                "var {id} needs step {step}, which has not run"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_is_under_the_user_cache() {
        // Headless environments may have no cache directory at all.
        if let Ok(path) = TraceDump::cache_path("resnet_block") {
            assert!(path.ends_with("tensorvm/traces/resnet_block.json"));
        }
    }
}
