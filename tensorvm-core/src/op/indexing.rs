use super::{check_arity, OpKind, OpTrait};
use crate::{shape_bail, AlgoInfo, Error, HostTensor, Result, TensorLayout};

pub(super) static INDEXING_ONE_HOT: OpTrait = OpTrait {
    name: "IndexingOneHot",
    infer_output_layouts: infer,
    algorithms,
    execute,
};

fn axis(kind: &OpKind) -> Result<usize> {
    match kind {
        OpKind::IndexingOneHot { axis } => Ok(*axis),
        other => Err(Error::msg(format!("{} is not one-hot indexing", other.name()))),
    }
}

fn check(axis: usize, src: &TensorLayout, index: &TensorLayout) -> Result<()> {
    if axis >= src.ndim() {
        shape_bail!("axis {axis} out of range for source {:?}", src.shape);
    }
    if !index.dtype.is_integral() {
        shape_bail!("one-hot index must be integral, got {}", index.dtype);
    }
    let mut expected = src.shape.clone();
    expected.remove(axis);
    if index.shape != expected {
        shape_bail!(
            "index shape {:?} must equal source {:?} without axis {axis}",
            index.shape,
            src.shape
        );
    }
    Ok(())
}

fn infer(kind: &OpKind, inputs: &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)> {
    check_arity(kind, inputs.len(), 2)?;
    let axis = axis(kind)?;
    let (src, index) = (&inputs[0], &inputs[1]);
    if !src.is_known() || !index.is_known() {
        return Ok((vec![TensorLayout::unknown(src.dtype, src.device)], false));
    }
    check(axis, src, index)?;
    let mut shape = index.shape.clone();
    shape.insert(axis, 1);
    Ok((vec![TensorLayout::new(shape, src.dtype, src.device)], true))
}

/// The index is relaid out into the workspace with the axis added.
fn algorithms(_: &OpKind, inputs: &[TensorLayout], _: &[TensorLayout]) -> Vec<AlgoInfo> {
    let ws = inputs.get(1).map(|i| i.num_elements() * 8).unwrap_or(0);
    vec![AlgoInfo::new("GATHER", ws)]
}

fn execute(
    kind: &OpKind,
    _: &AlgoInfo,
    inputs: &[HostTensor],
    outputs: &mut [HostTensor],
    workspace: &mut [u8],
) -> Result<()> {
    let axis = axis(kind)?;
    let (src, index) = (&inputs[0], &inputs[1]);
    check(axis, src.layout(), index.layout())?;
    let count = index.num_elements();
    if workspace.len() < count * 8 {
        crate::bail!("GATHER needs {} bytes of workspace, got {}", count * 8, workspace.len());
    }
    for i in 0..count {
        workspace[i * 8..i * 8 + 8].copy_from_slice(&(index.get(i) as i64).to_le_bytes());
    }
    let shape = src.shape();
    let len = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    for i in 0..count {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&workspace[i * 8..i * 8 + 8]);
        let idx = i64::from_le_bytes(raw);
        if idx < 0 || idx as usize >= len {
            return Err(Error::Kernel {
                kernel: "IndexingOneHot".to_string(),
                msg: format!("index {idx} out of range for axis {axis} of size {len}"),
            });
        }
        let (outer, rest) = (i / inner, i % inner);
        let offset = (outer * len + idx as usize) * inner + rest;
        outputs[0].set(i, src.get(offset));
    }
    Ok(())
}
