use gemm::{gemm, Parallelism};
use serde::{Deserialize, Serialize};

use super::{check_arity, OpKind, OpTrait};
use crate::{shape_bail, AlgoInfo, DType, Error, HostTensor, Result, TensorLayout};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatMulParam {
    pub transpose_a: bool,
    pub transpose_b: bool,
}

pub(super) static MATRIX_MUL: OpTrait = OpTrait {
    name: "MatrixMul",
    infer_output_layouts: infer,
    algorithms,
    execute,
};

fn param(kind: &OpKind) -> Result<MatMulParam> {
    match kind {
        OpKind::MatrixMul(p) => Ok(*p),
        other => Err(Error::msg(format!("{} is not a matrix mul", other.name()))),
    }
}

/// `(m, n, k)` of the product, validating the operands.
fn dims(p: MatMulParam, a: &TensorLayout, b: &TensorLayout) -> Result<(usize, usize, usize)> {
    if a.ndim() != 2 || b.ndim() != 2 {
        shape_bail!(
            "matrix mul expects 2-dim operands, got {:?} and {:?}",
            a.shape,
            b.shape
        );
    }
    let (m, k) = if p.transpose_a {
        (a.shape[1], a.shape[0])
    } else {
        (a.shape[0], a.shape[1])
    };
    let (kb, n) = if p.transpose_b {
        (b.shape[1], b.shape[0])
    } else {
        (b.shape[0], b.shape[1])
    };
    if k != kb {
        shape_bail!(
            "matrix mul reduction mismatch: {:?}{} x {:?}{}",
            a.shape,
            if p.transpose_a { "^T" } else { "" },
            b.shape,
            if p.transpose_b { "^T" } else { "" }
        );
    }
    Ok((m, n, k))
}

fn infer(kind: &OpKind, inputs: &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)> {
    check_arity(kind, inputs.len(), 2)?;
    let (a, b) = (&inputs[0], &inputs[1]);
    let dtype = a.dtype.promote(b.dtype);
    if !a.is_known() || !b.is_known() {
        return Ok((vec![TensorLayout::unknown(dtype, a.device)], false));
    }
    let (m, n, _) = dims(param(kind)?, a, b)?;
    Ok((vec![TensorLayout::new([m, n], dtype, a.device)], true))
}

fn algorithms(_: &OpKind, inputs: &[TensorLayout], outputs: &[TensorLayout]) -> Vec<AlgoInfo> {
    let float = outputs.first().is_some_and(|o| o.dtype.is_float())
        && inputs.iter().all(|i| Some(i.dtype) == outputs.first().map(|o| o.dtype));
    let gemm = if float {
        AlgoInfo::new("GEMM", 0)
    } else {
        AlgoInfo::infeasible("GEMM")
    };
    vec![gemm, AlgoInfo::new("NAIVE", 0)]
}

/// Row and column strides of an operand viewed as its (possibly transposed) matrix.
fn strides(layout: &TensorLayout, transpose: bool) -> (isize, isize) {
    let (rs, cs) = (layout.shape[1] as isize, 1);
    if transpose {
        (cs, rs)
    } else {
        (rs, cs)
    }
}

macro_rules! launch_gemm {
    ($rt:ty, $from:ident, $a:expr, $b:expr, $out:expr, $p:expr, $m:expr, $n:expr, $k:expr) => {{
        let num_threads = num_cpus::get();
        let parallelism = if num_threads > 1 {
            Parallelism::Rayon(num_threads)
        } else {
            Parallelism::None
        };
        let lhs: Vec<$rt> = $a.$from();
        let rhs: Vec<$rt> = $b.$from();
        let mut dst = vec![0 as $rt; $m * $n];
        let (lhs_rs, lhs_cs) = strides($a.layout(), $p.transpose_a);
        let (rhs_rs, rhs_cs) = strides($b.layout(), $p.transpose_b);
        unsafe {
            gemm(
                /* m: usize = */ $m,
                /* n: usize = */ $n,
                /* k: usize = */ $k,
                /* dst: *mut T = */ dst.as_mut_ptr(),
                /* dst_cs: isize = */ 1,
                /* dst_rs: isize = */ $n as isize,
                /* read_dst: bool = */ false,
                /* lhs: *const T = */ lhs.as_ptr(),
                /* lhs_cs: isize = */ lhs_cs,
                /* lhs_rs: isize = */ lhs_rs,
                /* rhs: *const T = */ rhs.as_ptr(),
                /* rhs_cs: isize = */ rhs_cs,
                /* rhs_rs: isize = */ rhs_rs,
                /* alpha: T = */ 0 as $rt,
                /* beta: T = */ 1 as $rt,
                /* conj_dst: bool = */ false,
                /* conj_lhs: bool = */ false,
                /* conj_rhs: bool = */ false,
                parallelism,
            )
        }
        for (i, v) in dst.into_iter().enumerate() {
            $out.set(i, v as f64);
        }
    }};
}

fn execute(
    kind: &OpKind,
    algo: &AlgoInfo,
    inputs: &[HostTensor],
    outputs: &mut [HostTensor],
    _: &mut [u8],
) -> Result<()> {
    let p = param(kind)?;
    let (a, b) = (&inputs[0], &inputs[1]);
    let (m, n, k) = dims(p, a.layout(), b.layout())?;
    let out = &mut outputs[0];
    match (algo.name, out.dtype()) {
        ("GEMM", DType::F32) => launch_gemm!(f32, to_f32_vec, a, b, out, p, m, n, k),
        ("GEMM", DType::F64) => launch_gemm!(f64, to_f64_vec, a, b, out, p, m, n, k),
        ("GEMM", other) => crate::bail!("GEMM does not support {other}"),
        _ => {
            let (a_rs, a_cs) = strides(a.layout(), p.transpose_a);
            let (b_rs, b_cs) = strides(b.layout(), p.transpose_b);
            let (lhs, rhs) = (a.to_f64_vec(), b.to_f64_vec());
            for i in 0..m {
                for j in 0..n {
                    let mut sum = 0.0;
                    for q in 0..k {
                        let l = lhs[(i as isize * a_rs + q as isize * a_cs) as usize];
                        let r = rhs[(q as isize * b_rs + j as isize * b_cs) as usize];
                        sum += l * r;
                    }
                    out.set(i * n + j, sum);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompNode;

    fn run(algo: &'static str, p: MatMulParam, a: HostTensor, b: HostTensor) -> Vec<f32> {
        let kind = OpKind::MatrixMul(p);
        let (layouts, _) = infer(&kind, &[a.layout().clone(), b.layout().clone()]).unwrap();
        let mut out = vec![HostTensor::zeros(layouts[0].clone())];
        let algo = AlgoInfo::new(algo, 0);
        execute(&kind, &algo, &[a, b], &mut out, &mut []).unwrap();
        out[0].to_f32_vec()
    }

    #[test]
    fn gemm_matches_naive_with_transpose() {
        let dev = CompNode::cpu(0);
        let a = HostTensor::from_f32(&[3, 2], dev, &[1., 2., 3., 4., 5., 6.]).unwrap();
        let b = HostTensor::from_f32(&[3, 2], dev, &[1., 0., 0., 1., 1., 1.]).unwrap();
        let p = MatMulParam {
            transpose_a: true,
            transpose_b: false,
        };
        let expected = vec![6.0, 8.0, 8.0, 10.0];
        assert_eq!(run("GEMM", p, a.clone(), b.clone()), expected);
        assert_eq!(run("NAIVE", p, a, b), expected);
    }
}
