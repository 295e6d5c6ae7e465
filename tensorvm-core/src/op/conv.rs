use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{check_arity, OpKind, OpTrait};
use crate::{shape_bail, AlgoInfo, Error, HostTensor, Result, TensorLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvSparse {
    /// Filter is `(oc, ic, fh, fw)` (NCHW) or `(oc, fh, fw, ic)` (NHWC).
    Dense,
    /// Filter carries a leading group dim: `(g, ocpg, icpg, fh, fw)` or
    /// `(g, ocpg, fh, fw, icpg)`.
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvFormat {
    NCHW,
    NHWC,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvParam {
    pub sparse: ConvSparse,
    pub format: ConvFormat,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub dilate_h: usize,
    pub dilate_w: usize,
}

impl Default for ConvParam {
    fn default() -> Self {
        Self {
            sparse: ConvSparse::Dense,
            format: ConvFormat::NCHW,
            stride_h: 1,
            stride_w: 1,
            pad_h: 0,
            pad_w: 0,
            dilate_h: 1,
            dilate_w: 1,
        }
    }
}

impl ConvParam {
    pub fn with_stride(mut self, h: usize, w: usize) -> Self {
        self.stride_h = h;
        self.stride_w = w;
        self
    }

    pub fn with_padding(mut self, h: usize, w: usize) -> Self {
        self.pad_h = h;
        self.pad_w = w;
        self
    }

    pub fn with_dilation(mut self, h: usize, w: usize) -> Self {
        self.dilate_h = h;
        self.dilate_w = w;
        self
    }

    pub fn group(mut self) -> Self {
        self.sparse = ConvSparse::Group;
        self
    }

    pub fn nhwc(mut self) -> Self {
        self.format = ConvFormat::NHWC;
        self
    }
}

pub(super) static CONVOLUTION: OpTrait = OpTrait {
    name: "Convolution",
    infer_output_layouts: infer,
    algorithms,
    execute,
};

/// Output size of one spatial dim.
pub(crate) fn infer_conv_shape(inp: usize, flt: usize, stride: usize, pad: usize) -> Result<usize> {
    if inp + 2 * pad < flt {
        shape_bail!("input={inp} padding={pad} filter={flt}: filter larger than padded input");
    }
    if stride == 0 {
        shape_bail!("convolution stride must be positive");
    }
    Ok((inp + 2 * pad - flt) / stride + 1)
}

/// Resolved convolution geometry.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    n: usize,
    group: usize,
    icpg: usize,
    ocpg: usize,
    ih: usize,
    iw: usize,
    fh: usize,
    fw: usize,
    oh: usize,
    ow: usize,
}

fn param(kind: &OpKind) -> Result<&ConvParam> {
    match kind {
        OpKind::Convolution(p) => Ok(p),
        other => Err(Error::msg(format!("{} is not a convolution", other.name()))),
    }
}

fn geometry(p: &ConvParam, src: &TensorLayout, filter: &TensorLayout) -> Result<Geometry> {
    if src.ndim() != 4 {
        shape_bail!(
            "only 2D convolution is supported, and input should be 4-dim; got input dim = {}",
            src.ndim()
        );
    }
    let img_ndim = 2;
    let (group, flt_start) = match p.sparse {
        ConvSparse::Dense => {
            if filter.ndim() != img_ndim + 2 {
                shape_bail!(
                    "bad filter ndim for dense convolution: spatial_ndim={img_ndim} filter_ndim={}",
                    filter.ndim()
                );
            }
            (1, 0)
        }
        ConvSparse::Group => {
            if filter.ndim() != img_ndim + 3 {
                shape_bail!(
                    "bad filter ndim for group convolution: spatial_ndim={img_ndim} filter_ndim={}",
                    filter.ndim()
                );
            }
            (filter.shape[0], 1)
        }
    };
    let (flt_spatial, icpg_pos, c_pos, spatial) = match p.format {
        ConvFormat::NCHW => (2, 1, 1, 2),
        ConvFormat::NHWC => (1, 3, 3, 1),
    };
    let ocpg = filter.shape[flt_start];
    let icpg = filter.shape[flt_start + icpg_pos];
    let dilation = [p.dilate_h, p.dilate_w];
    let mut flt = [0; 2];
    for (i, d) in dilation.iter().enumerate() {
        if *d == 0 {
            shape_bail!("invalid dilation on spatial dim {i}: {d}");
        }
        flt[i] = filter.shape[flt_start + flt_spatial + i];
        if flt[i] == 0 {
            shape_bail!("empty filter on spatial dim {i}");
        }
    }
    if icpg * group != src.shape[c_pos] {
        shape_bail!(
            "group conv invalid: icpg={icpg} group={group} input channels={}",
            src.shape[c_pos]
        );
    }
    let ih = src.shape[spatial];
    let iw = src.shape[spatial + 1];
    let oh = infer_conv_shape(ih, (flt[0] - 1) * p.dilate_h + 1, p.stride_h, p.pad_h)?;
    let ow = infer_conv_shape(iw, (flt[1] - 1) * p.dilate_w + 1, p.stride_w, p.pad_w)?;
    Ok(Geometry {
        n: src.shape[0],
        group,
        icpg,
        ocpg,
        ih,
        iw,
        fh: flt[0],
        fw: flt[1],
        oh,
        ow,
    })
}

fn infer(kind: &OpKind, inputs: &[TensorLayout]) -> Result<(Vec<TensorLayout>, bool)> {
    check_arity(kind, inputs.len(), 2)?;
    let p = param(kind)?;
    let (src, filter) = (&inputs[0], &inputs[1]);
    let dtype = src.dtype.promote(filter.dtype);
    if !src.is_known() || !filter.is_known() {
        return Ok((vec![TensorLayout::unknown(dtype, src.device)], false));
    }
    let g = geometry(p, src, filter)?;
    let oc = g.ocpg * g.group;
    let shape = match p.format {
        ConvFormat::NCHW => vec![g.n, oc, g.oh, g.ow],
        ConvFormat::NHWC => vec![g.n, g.oh, g.ow, oc],
    };
    Ok((vec![TensorLayout::new(shape, dtype, src.device)], true))
}

fn algorithms(kind: &OpKind, inputs: &[TensorLayout], _: &[TensorLayout]) -> Vec<AlgoInfo> {
    let direct = AlgoInfo::new("DIRECT", 0);
    let im2col = match param(kind).and_then(|p| geometry(p, &inputs[0], &inputs[1])) {
        Ok(g) => AlgoInfo::new("IM2COL", g.icpg * g.fh * g.fw * g.oh * g.ow * 4),
        Err(_) => AlgoInfo::infeasible("IM2COL"),
    };
    vec![im2col, direct]
}

/// Flat offsets into source, filter and destination for a format.
struct Indexer {
    format: ConvFormat,
    g: Geometry,
}

impl Indexer {
    fn src(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        let Geometry { ih, iw, icpg, group, .. } = self.g;
        let ic = icpg * group;
        match self.format {
            ConvFormat::NCHW => ((n * ic + c) * ih + h) * iw + w,
            ConvFormat::NHWC => ((n * ih + h) * iw + w) * ic + c,
        }
    }

    /// Filter element for group `grp`, channel `oc` within the group.
    fn filter(&self, grp: usize, oc: usize, ic: usize, kh: usize, kw: usize) -> usize {
        let Geometry { ocpg, icpg, fh, fw, .. } = self.g;
        let base = (grp * ocpg + oc) * icpg * fh * fw;
        match self.format {
            ConvFormat::NCHW => base + (ic * fh + kh) * fw + kw,
            ConvFormat::NHWC => base + (kh * fw + kw) * icpg + ic,
        }
    }

    fn dst(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        let Geometry { oh, ow, ocpg, group, .. } = self.g;
        let oc = ocpg * group;
        match self.format {
            ConvFormat::NCHW => ((n * oc + c) * oh + h) * ow + w,
            ConvFormat::NHWC => ((n * oh + h) * ow + w) * oc + c,
        }
    }
}

/// Source row/column hit by output position `o` and filter tap `k`, if any.
#[inline]
fn src_pos(o: usize, k: usize, stride: usize, dilate: usize, pad: usize, size: usize) -> Option<usize> {
    let pos = (o * stride + k * dilate) as isize - pad as isize;
    (pos >= 0 && (pos as usize) < size).then_some(pos as usize)
}

fn execute(
    kind: &OpKind,
    algo: &AlgoInfo,
    inputs: &[HostTensor],
    outputs: &mut [HostTensor],
    workspace: &mut [u8],
) -> Result<()> {
    let p = param(kind)?;
    let g = geometry(p, inputs[0].layout(), inputs[1].layout())?;
    let idx = Indexer {
        format: p.format,
        g,
    };
    let src = inputs[0].to_f64_vec();
    let flt = inputs[1].to_f64_vec();
    let mut dst = vec![0f64; outputs[0].num_elements()];
    match algo.name {
        "IM2COL" => im2col(p, &idx, &src, &flt, &mut dst, workspace)?,
        "DIRECT" => direct(p, &idx, &src, &flt, &mut dst),
        other => crate::bail!("unknown convolution algorithm {other}"),
    }
    for (i, v) in dst.into_iter().enumerate() {
        outputs[0].set(i, v);
    }
    Ok(())
}

fn direct(p: &ConvParam, idx: &Indexer, src: &[f64], flt: &[f64], dst: &mut [f64]) {
    let g = idx.g;
    let planes: Vec<(usize, usize)> = (0..g.n)
        .flat_map(|n| (0..g.group * g.ocpg).map(move |c| (n, c)))
        .collect();
    let planes: Vec<Vec<(usize, f64)>> = planes
        .par_iter()
        .map(|&(n, c)| {
            let (grp, oc) = (c / g.ocpg, c % g.ocpg);
            let mut plane = Vec::with_capacity(g.oh * g.ow);
            for oh in 0..g.oh {
                for ow in 0..g.ow {
                    let mut acc = 0.0;
                    for ic in 0..g.icpg {
                        for kh in 0..g.fh {
                            let Some(h) = src_pos(oh, kh, p.stride_h, p.dilate_h, p.pad_h, g.ih)
                            else {
                                continue;
                            };
                            for kw in 0..g.fw {
                                let Some(w) =
                                    src_pos(ow, kw, p.stride_w, p.dilate_w, p.pad_w, g.iw)
                                else {
                                    continue;
                                };
                                acc += src[idx.src(n, grp * g.icpg + ic, h, w)]
                                    * flt[idx.filter(grp, oc, ic, kh, kw)];
                            }
                        }
                    }
                    plane.push((idx.dst(n, c, oh, ow), acc));
                }
            }
            plane
        })
        .collect();
    for (i, v) in planes.into_iter().flatten() {
        dst[i] = v;
    }
}

fn im2col(
    p: &ConvParam,
    idx: &Indexer,
    src: &[f64],
    flt: &[f64],
    dst: &mut [f64],
    workspace: &mut [u8],
) -> Result<()> {
    let g = idx.g;
    let rows = g.icpg * g.fh * g.fw;
    let cols = g.oh * g.ow;
    if workspace.len() < rows * cols * 4 {
        crate::bail!(
            "IM2COL needs {} bytes of workspace, got {}",
            rows * cols * 4,
            workspace.len()
        );
    }
    let write = |ws: &mut [u8], i: usize, v: f32| ws[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    let read = |ws: &[u8], i: usize| f32::from_le_bytes([ws[i * 4], ws[i * 4 + 1], ws[i * 4 + 2], ws[i * 4 + 3]]);
    for n in 0..g.n {
        for grp in 0..g.group {
            for ic in 0..g.icpg {
                for kh in 0..g.fh {
                    for kw in 0..g.fw {
                        let r = (ic * g.fh + kh) * g.fw + kw;
                        for oh in 0..g.oh {
                            for ow in 0..g.ow {
                                let v = match (
                                    src_pos(oh, kh, p.stride_h, p.dilate_h, p.pad_h, g.ih),
                                    src_pos(ow, kw, p.stride_w, p.dilate_w, p.pad_w, g.iw),
                                ) {
                                    (Some(h), Some(w)) => src[idx.src(n, grp * g.icpg + ic, h, w)],
                                    _ => 0.0,
                                };
                                write(workspace, r * cols + oh * g.ow + ow, v as f32);
                            }
                        }
                    }
                }
            }
            let ws: &[u8] = workspace;
            let results: Vec<(usize, f64)> = (0..g.ocpg)
                .into_par_iter()
                .flat_map_iter(|oc| {
                    (0..cols).map(move |col| {
                        let mut acc = 0.0;
                        for ic in 0..g.icpg {
                            for kh in 0..g.fh {
                                for kw in 0..g.fw {
                                    let r = (ic * g.fh + kh) * g.fw + kw;
                                    acc += flt[idx.filter(grp, oc, ic, kh, kw)]
                                        * read(ws, r * cols + col) as f64;
                                }
                            }
                        }
                        (idx.dst(n, grp * g.ocpg + oc, col / g.ow, col % g.ow), acc)
                    })
                })
                .collect();
            for (i, v) in results {
                dst[i] = v;
            }
        }
    }
    Ok(())
}
