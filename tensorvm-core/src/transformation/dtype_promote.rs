use super::{Rest, Transformation};
use crate::{DType, ElemwiseMode, OpDef, OpKind, Result, ScalarValue, Value, ValueKind};

/// Inserts implicit casts so mixed-dtype operands meet at a common dtype.
///
/// Tensor operands promote along the dtype lattice. Scalars only contribute
/// their category: a float scalar lifts an integral tensor op to `float32`,
/// an integral scalar never widens a tensor.
#[derive(Debug, Default)]
pub struct DTypePromoteTransformation;

impl DTypePromoteTransformation {
    pub fn new() -> Self {
        Self
    }
}

fn target_dtype(op: &OpDef, inputs: &[Value]) -> Option<DType> {
    let promotes = match &op.kind {
        OpKind::Elemwise(mode) => mode.arity() == 2 || matches!(mode, ElemwiseMode::Sqrt | ElemwiseMode::Exp),
        OpKind::MatrixMul(_) | OpKind::Convolution(_) => true,
        _ => false,
    };
    if !promotes || inputs.is_empty() {
        return None;
    }
    let tensors: Vec<DType> = inputs
        .iter()
        .filter(|v| !v.is_scalar())
        .map(Value::dtype)
        .collect();
    let scalar_float = inputs
        .iter()
        .filter_map(Value::as_scalar)
        .any(|s| s.dtype.is_float());
    let mut target = match tensors.split_first() {
        Some((first, rest)) => rest.iter().fold(*first, |acc, d| acc.promote(*d)),
        None => inputs
            .iter()
            .skip(1)
            .fold(inputs[0].dtype(), |acc, v| acc.promote(v.dtype())),
    };
    if target.is_integral() && scalar_float {
        target = DType::F32;
    }
    if let OpKind::Elemwise(ElemwiseMode::Sqrt | ElemwiseMode::Exp) = op.kind {
        if target.is_integral() {
            target = DType::F32;
        }
    }
    Some(target)
}

impl Transformation for DTypePromoteTransformation {
    fn name(&self) -> String {
        "DTypePromote".to_string()
    }

    fn try_handle(&self, op: &OpDef, inputs: &[Value], rest: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        let Some(target) = target_dtype(op, inputs) else {
            return Ok(None);
        };
        if inputs.iter().all(|v| v.dtype() == target) {
            return Ok(None);
        }
        let mut converted = Vec::with_capacity(inputs.len());
        for v in inputs {
            if v.dtype() == target {
                converted.push(v.clone());
            } else if let Some(s) = v.as_scalar() {
                converted.push(Value::new(ValueKind::Scalar(ScalarValue {
                    dtype: target,
                    ..s
                })));
            } else {
                let cast = rest.apply(&OpDef::type_cvt(target), std::slice::from_ref(v))?;
                match cast.into_iter().next() {
                    Some(c) => converted.push(c),
                    None => crate::bail!("type cast to {} produced no output", target.name()),
                }
            }
        }
        rest.apply(op, &converted).map(Some)
    }
}
