use super::{Rest, Transformation};
use crate::{HostTensor, OpDef, OpKind, Result, ScalarValue, Value, ValueKind};

/// Fast path for element-wise arithmetic on scalars.
///
/// When every input of an element-wise op is a scalar (or a 0-dim host
/// tensor) the result is computed in place and returned as a scalar. Any
/// other op receiving scalars sees them as 0-dim host tensors.
#[derive(Debug, Default)]
pub struct ScalarTransformation;

impl ScalarTransformation {
    pub fn new() -> Self {
        Self
    }
}

fn as_scalar(value: &Value) -> Option<ScalarValue> {
    match &*value.kind() {
        ValueKind::Scalar(s) => Some(*s),
        ValueKind::Host(t) if t.layout().is_scalar() => Some(ScalarValue {
            value: t.get(0),
            dtype: t.dtype(),
            device: t.layout().device,
        }),
        _ => None,
    }
}

impl Transformation for ScalarTransformation {
    fn name(&self) -> String {
        "Scalar".to_string()
    }

    fn try_handle(&self, op: &OpDef, inputs: &[Value], rest: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        if let OpKind::Elemwise(mode) = &op.kind {
            let scalars: Option<Vec<ScalarValue>> = inputs.iter().map(as_scalar).collect();
            if let Some(scalars) = scalars.filter(|s| s.len() == mode.arity()) {
                let dtype = scalars
                    .iter()
                    .skip(1)
                    .fold(scalars[0].dtype, |acc, s| acc.promote(s.dtype));
                let b = scalars.get(1).map(|s| s.value).unwrap_or(0.0);
                // Round-trip through the dtype to get its casting semantics.
                let out = HostTensor::scalar(mode.eval(scalars[0].value, b), dtype, scalars[0].device);
                return Ok(Some(vec![Value::new(ValueKind::Scalar(ScalarValue {
                    value: out.get(0),
                    dtype,
                    device: scalars[0].device,
                }))]));
            }
        }
        if !inputs.iter().any(Value::is_scalar) {
            return Ok(None);
        }
        let unwrapped: Vec<Value> = inputs
            .iter()
            .map(|v| match v.as_scalar() {
                Some(s) => Value::host(HostTensor::scalar(s.value, s.dtype, s.device)),
                None => v.clone(),
            })
            .collect();
        rest.apply(op, &unwrapped).map(Some)
    }
}
