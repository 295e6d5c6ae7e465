use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{default_algorithm, OpKind, OpTrait};
use crate::{layout::contiguous_strides, shape_bail, AlgoInfo, Error, HostTensor, Result, TensorLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemwiseMode {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Neg,
    Sqrt,
    Relu,
    Exp,
}

impl ElemwiseMode {
    pub fn arity(&self) -> usize {
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Max | Self::Min => 2,
            Self::Neg | Self::Sqrt | Self::Relu | Self::Exp => 1,
        }
    }

    /// Apply to one element. `b` is ignored by unary modes.
    #[inline]
    pub fn eval(&self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Max => a.max(b),
            Self::Min => a.min(b),
            Self::Neg => -a,
            Self::Sqrt => a.sqrt(),
            Self::Relu => a.max(0.0),
            Self::Exp => a.exp(),
        }
    }
}

pub(super) static ELEMWISE: OpTrait = OpTrait {
    name: "Elemwise",
    infer_output_layouts: infer,
    algorithms: default_algorithm,
    execute,
};

fn mode(kind: &OpKind) -> Result<ElemwiseMode> {
    match kind {
        OpKind::Elemwise(m) => Ok(*m),
        other => Err(Error::msg(format!("{} is not elemwise", other.name()))),
    }
}

/// Numpy-style broadcast of two shapes.
pub(crate) fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0; ndim];
    for i in 0..ndim {
        let da = if i + a.len() >= ndim { a[i + a.len() - ndim] } else { 1 };
        let db = if i + b.len() >= ndim { b[i + b.len() - ndim] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => shape_bail!("cannot broadcast {a:?} with {b:?}"),
        };
    }
    Ok(out)
}

/// Element strides of `shape` read as a broadcast operand of `target`.
fn broadcast_strides(shape: &[usize], target: &[usize]) -> Vec<usize> {
    let own = contiguous_strides(shape);
    let offset = target.len() - shape.len();
    (0..target.len())
        .map(|i| {
            if i < offset || shape[i - offset] == 1 {
                0
            } else {
                own[i - offset]
            }
        })
        .collect()
}

fn infer(kind: &OpKind, inputs: &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)> {
    let mode = mode(kind)?;
    super::check_arity(kind, inputs.len(), mode.arity())?;
    let dtype = inputs
        .iter()
        .skip(1)
        .fold(inputs[0].dtype, |acc, l| acc.promote(l.dtype));
    let device = inputs[0].device;
    if inputs.iter().any(|l| !l.is_known()) {
        return Ok((vec![TensorLayout::unknown(dtype, device)], false));
    }
    let mut shape = inputs[0].shape.clone();
    for l in &inputs[1..] {
        shape = broadcast_shapes(&shape, &l.shape)?;
    }
    Ok((vec![TensorLayout::new(shape, dtype, device)], true))
}

fn execute(
    kind: &OpKind,
    _: &AlgoInfo,
    inputs: &[HostTensor],
    outputs: &mut [HostTensor],
    _: &mut [u8],
) -> Result<()> {
    let mode = mode(kind)?;
    let target = outputs[0].shape().to_vec();
    let out_strides = contiguous_strides(&target);
    let operands: Vec<(Vec<f64>, Vec<usize>)> = inputs
        .iter()
        .map(|t| (t.to_f64_vec(), broadcast_strides(t.shape(), &target)))
        .collect();
    let read = |k: usize, linear: usize| {
        let (data, strides) = &operands[k];
        let mut rem = linear;
        let mut off = 0;
        for (os, s) in out_strides.iter().zip(strides) {
            off += (rem / os) * s;
            rem %= os;
        }
        data[off]
    };
    let values: Vec<f64> = (0..outputs[0].num_elements())
        .into_par_iter()
        .map(|i| {
            let a = read(0, i);
            let b = if operands.len() > 1 { read(1, i) } else { 0.0 };
            mode.eval(a, b)
        })
        .collect();
    for (i, v) in values.into_iter().enumerate() {
        outputs[0].set(i, v);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasting_rules() {
        assert_eq!(broadcast_shapes(&[2, 1, 3], &[4, 1]).unwrap(), vec![2, 4, 3]);
        assert_eq!(broadcast_shapes(&[], &[5]).unwrap(), vec![5]);
        assert!(broadcast_shapes(&[2, 3], &[4]).is_err());
    }
}
