use std::sync::Arc;

use super::{Rest, Transformation};
use crate::{Channel, Error, HostTensor, OpDef, OpKind, Result, TensorHandle, Value, ValueKind};

/// Terminal layer executing operators on an execution channel.
pub struct InterpreterTransformation {
    channel: Arc<Channel>,
}

impl InterpreterTransformation {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// The device tensor behind `value`, uploading host data when needed.
    pub fn to_device(&self, value: &Value) -> Result<TensorHandle> {
        let kind = value.kind().clone();
        match kind {
            ValueKind::Device(h) => Ok(h),
            ValueKind::Host(t) => self.channel.put(t),
            ValueKind::Scalar(s) => self.channel.put(HostTensor::scalar(s.value, s.dtype, s.device)),
            other => Err(Error::GraphMismatch(format!(
                "{} value #{} reached the interpreter; the layer that created it is not active",
                other.tag(),
                value.id()
            ))),
        }
    }
}

impl Transformation for InterpreterTransformation {
    fn name(&self) -> String {
        format!("Interpreter(channel {})", self.channel.id())
    }

    fn try_handle(&self, op: &OpDef, inputs: &[Value], _: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        match &op.kind {
            OpKind::Drop => {
                for v in inputs {
                    if let Some(h) = v.as_device() {
                        self.channel.drop_tensor(&h)?;
                    }
                }
                return Ok(Some(Vec::new()));
            }
            OpKind::TraceMark { .. } | OpKind::Rename { .. } | OpKind::DetachGrad => {
                return Ok(Some(inputs.to_vec()));
            }
            _ => {}
        }
        let handles = inputs
            .iter()
            .map(|v| self.to_device(v))
            .collect::<Result<Vec<_>>>()?;
        let outputs = self.channel.apply_op(op, &handles)?;
        Ok(Some(outputs.into_iter().map(Value::device).collect()))
    }
}
