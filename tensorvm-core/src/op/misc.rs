use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::{check_arity, default_algorithm, OpKind, OpTrait};
use crate::{shape_bail, AlgoInfo, DType, Error, HostTensor, Result, TensorLayout};

pub(super) static TYPE_CVT: OpTrait = OpTrait {
    name: "TypeCvt",
    infer_output_layouts: infer_type_cvt,
    algorithms: default_algorithm,
    execute: copy_values,
};

pub(super) static RESHAPE: OpTrait = OpTrait {
    name: "Reshape",
    infer_output_layouts: infer_reshape,
    algorithms: default_algorithm,
    execute: copy_values,
};

pub(super) static UNIFORM: OpTrait = OpTrait {
    name: "Uniform",
    infer_output_layouts: infer_random,
    algorithms: default_algorithm,
    execute: execute_uniform,
};

pub(super) static GAUSSIAN: OpTrait = OpTrait {
    name: "Gaussian",
    infer_output_layouts: infer_random,
    algorithms: default_algorithm,
    execute: execute_gaussian,
};

pub(super) static DROP: OpTrait = OpTrait {
    name: "Drop",
    infer_output_layouts: infer_drop,
    algorithms: no_algorithm,
    execute: no_kernel,
};

pub(super) static TRACE_MARK: OpTrait = OpTrait {
    name: "TraceMark",
    infer_output_layouts: infer_identity,
    algorithms: no_algorithm,
    execute: no_kernel,
};

pub(super) static RENAME: OpTrait = OpTrait {
    name: "Rename",
    infer_output_layouts: infer_identity,
    algorithms: no_algorithm,
    execute: no_kernel,
};

pub(super) static DETACH_GRAD: OpTrait = OpTrait {
    name: "DetachGrad",
    infer_output_layouts: infer_identity,
    algorithms: no_algorithm,
    execute: no_kernel,
};

fn infer_type_cvt(kind: &OpKind, inputs: &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)> {
    check_arity(kind, inputs.len(), 1)?;
    let OpKind::TypeCvt { dtype } = kind else {
        crate::bail!("{} is not a type conversion", kind.name())
    };
    let out = if inputs[0].is_known() {
        inputs[0].contiguous().with_dtype(*dtype)
    } else {
        inputs[0].with_dtype(*dtype)
    };
    Ok((vec![out], inputs[0].is_known()))
}

fn infer_reshape(kind: &OpKind, inputs: &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)> {
    check_arity(kind, inputs.len(), 1)?;
    let OpKind::Reshape { shape } = kind else {
        crate::bail!("{} is not a reshape", kind.name())
    };
    let src = &inputs[0];
    let out = TensorLayout::new(shape.clone(), src.dtype, src.device);
    if src.is_known() && src.num_elements() != out.num_elements() {
        shape_bail!("cannot reshape {:?} into {:?}", src.shape, shape);
    }
    Ok((vec![out], true))
}

fn infer_random(kind: &OpKind, inputs: &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)> {
    check_arity(kind, inputs.len(), 0)?;
    match kind {
        OpKind::Uniform { shape, device, .. } => {
            Ok((vec![TensorLayout::new(shape.clone(), DType::F32, *device)], true))
        }
        OpKind::Gaussian {
            shape, device, std, ..
        } => {
            if !std.is_finite() || *std < 0.0 {
                crate::bail!("gaussian std must be finite and non-negative, got {std}");
            }
            Ok((vec![TensorLayout::new(shape.clone(), DType::F32, *device)], true))
        }
        other => crate::bail!("{} is not a random op", other.name()),
    }
}

fn infer_drop(kind: &OpKind, inputs: &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)> {
    check_arity(kind, inputs.len(), 1)?;
    Ok((Vec::new(), true))
}

fn infer_identity(kind: &OpKind, inputs: &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)> {
    check_arity(kind, inputs.len(), 1)?;
    Ok((inputs.to_vec(), inputs[0].is_known()))
}

fn no_algorithm(_: &OpKind, _: &[TensorLayout], _: &[TensorLayout]) -> Vec<AlgoInfo> {
    Vec::new()
}

fn no_kernel(kind: &OpKind, _: &AlgoInfo, _: &[HostTensor], _: &mut [HostTensor], _: &mut [u8]) -> Result<()> {
    Err(Error::Kernel {
        kernel: kind.name().to_string(),
        msg: "control command has no kernel".to_string(),
    })
}

/// Element-wise copy with the output's dtype; serves both casts and reshapes.
fn copy_values(
    _: &OpKind,
    _: &AlgoInfo,
    inputs: &[HostTensor],
    outputs: &mut [HostTensor],
    _: &mut [u8],
) -> Result<()> {
    let src = &inputs[0];
    if src.dtype() == outputs[0].dtype() {
        outputs[0].bytes_mut().copy_from_slice(src.bytes());
        return Ok(());
    }
    for i in 0..src.num_elements() {
        outputs[0].set(i, src.get(i));
    }
    Ok(())
}

fn execute_uniform(
    kind: &OpKind,
    _: &AlgoInfo,
    _: &[HostTensor],
    outputs: &mut [HostTensor],
    _: &mut [u8],
) -> Result<()> {
    let OpKind::Uniform { seed, .. } = kind else {
        crate::bail!("{} is not uniform", kind.name())
    };
    let mut rng = StdRng::seed_from_u64(*seed);
    for i in 0..outputs[0].num_elements() {
        let v: f32 = rng.gen();
        outputs[0].set(i, v as f64);
    }
    Ok(())
}

fn execute_gaussian(
    kind: &OpKind,
    _: &AlgoInfo,
    _: &[HostTensor],
    outputs: &mut [HostTensor],
    _: &mut [u8],
) -> Result<()> {
    let OpKind::Gaussian {
        mean, std, seed, ..
    } = kind
    else {
        crate::bail!("{} is not gaussian", kind.name())
    };
    let normal = Normal::new(*mean, *std).map_err(|e| Error::Kernel {
        kernel: "Gaussian".to_string(),
        msg: e.to_string(),
    })?;
    let mut rng = StdRng::seed_from_u64(*seed);
    for i in 0..outputs[0].num_elements() {
        outputs[0].set(i, normal.sample(&mut rng));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompNode;

    #[test]
    fn seeded_uniform_is_deterministic() {
        let dev = CompNode::cpu(0);
        let kind = OpKind::Uniform {
            shape: vec![8],
            device: dev,
            seed: 42,
        };
        let (layouts, _) = infer_random(&kind, &[]).unwrap();
        let run = || {
            let mut out = vec![HostTensor::zeros(layouts[0].clone())];
            execute_uniform(&kind, &AlgoInfo::new("DEFAULT", 0), &[], &mut out, &mut []).unwrap();
            out.remove(0).to_f32_vec()
        };
        let a = run();
        assert_eq!(a, run());
        assert!(a.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn reshape_checks_element_count() {
        let dev = CompNode::cpu(0);
        let kind = OpKind::Reshape { shape: vec![3, 2] };
        let src = TensorLayout::new([2, 3], DType::F32, dev);
        assert!(infer_reshape(&kind, &[src]).is_ok());
        let bad = TensorLayout::new([4], DType::F32, dev);
        assert!(infer_reshape(&kind, &[bad]).is_err());
    }
}
