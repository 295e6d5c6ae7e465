use serde::{Deserialize, Serialize};

use crate::{shape_bail, CompNode, DType, Result};

/// Compute default (contiguous) strides for a tensor of given shape.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(shape.len());
    let mut acc = 1;
    // Iterate dims in reverse to accumulate products
    for dim in shape.iter().rev() {
        strides.push(acc);
        acc *= *dim;
    }
    strides.reverse();
    strides
}

/// Shape, strides (in elements), dtype and device of a tensor.
///
/// A layout with `known == false` describes a tensor whose shape is not
/// determined yet (for example an output whose inputs are still pending on
/// the channel). A known layout with an empty shape is a 0-dim scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorLayout {
    pub shape: Vec<usize>,
    pub stride: Vec<usize>,
    pub dtype: DType,
    pub device: CompNode,
    known: bool,
}

impl TensorLayout {
    /// A contiguous layout.
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType, device: CompNode) -> Self {
        let shape = shape.into();
        let stride = contiguous_strides(&shape);
        Self {
            shape,
            stride,
            dtype,
            device,
            known: true,
        }
    }

    /// A layout with explicit strides, validated against the shape.
    pub fn with_stride(
        shape: impl Into<Vec<usize>>,
        stride: impl Into<Vec<usize>>,
        dtype: DType,
        device: CompNode,
    ) -> Result<Self> {
        let layout = Self {
            shape: shape.into(),
            stride: stride.into(),
            dtype,
            device,
            known: true,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// A layout whose shape is deferred.
    pub fn unknown(dtype: DType, device: CompNode) -> Self {
        Self {
            shape: Vec::new(),
            stride: Vec::new(),
            dtype,
            device,
            known: false,
        }
    }

    pub fn is_known(&self) -> bool {
        self.known
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.known && self.shape.is_empty()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size in bytes of the memory span the layout addresses.
    pub fn span_bytes(&self) -> usize {
        if self.shape.iter().any(|d| *d == 0) {
            return 0;
        }
        let last: usize = self
            .shape
            .iter()
            .zip(&self.stride)
            .map(|(d, s)| (d - 1) * s)
            .sum();
        (last + 1) * self.dtype.size_of()
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride == contiguous_strides(&self.shape)
    }

    /// Same shape, dtype, device; strides reset to contiguous.
    pub fn contiguous(&self) -> Self {
        Self::new(self.shape.clone(), self.dtype, self.device)
    }

    pub fn with_dtype(&self, dtype: DType) -> Self {
        let mut out = self.clone();
        out.dtype = dtype;
        out
    }

    /// Check the stride/shape consistency invariant.
    pub fn validate(&self) -> Result<()> {
        if !self.known {
            return Ok(());
        }
        if self.shape.len() != self.stride.len() {
            shape_bail!(
                "layout has {} dims but {} strides",
                self.shape.len(),
                self.stride.len()
            );
        }
        // Non-overlapping: sorted by stride, each stride must cover the span
        // of the faster-moving dims.
        let mut dims: Vec<(usize, usize)> = self
            .shape
            .iter()
            .copied()
            .zip(self.stride.iter().copied())
            .filter(|(d, _)| *d > 1)
            .collect();
        dims.sort_by_key(|(_, s)| *s);
        let mut covered = 1;
        for (dim, stride) in dims {
            if stride < covered {
                shape_bail!(
                    "overlapping layout: shape {:?} stride {:?}",
                    self.shape,
                    self.stride
                );
            }
            covered = stride * dim;
        }
        Ok(())
    }

    /// Shape-and-dtype signature used by caches and comparators.
    pub fn signature(&self) -> String {
        if self.known {
            format!("{}{:?}", self.dtype, self.shape)
        } else {
            format!("{}[?]", self.dtype)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides_row_major() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn overlapping_strides_rejected() {
        let dev = CompNode::cpu(0);
        assert!(TensorLayout::with_stride([2, 3], [1, 1], DType::F32, dev).is_err());
        let t = TensorLayout::with_stride([2, 3], [1, 2], DType::F32, dev).unwrap();
        assert!(!t.is_contiguous());
        assert_eq!(t.span_bytes(), 6 * 4);
    }
}
