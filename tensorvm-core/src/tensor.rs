use crate::{shape_bail, CompNode, DType, Result, TensorLayout};

/// A host-visible tensor: a contiguous layout plus its bytes.
///
/// This is what callers hand to [`crate::Runtime::put`] and what
/// [`crate::Runtime::to_host`] returns. Kernels receive their inputs and
/// write their outputs as `HostTensor`s copied to and from device memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    layout: TensorLayout,
    data: Vec<u8>,
}

impl HostTensor {
    /// Wrap raw little-endian bytes. The layout must be contiguous.
    pub fn from_bytes(layout: TensorLayout, data: Vec<u8>) -> Result<Self> {
        if !layout.is_known() {
            shape_bail!("host tensor needs a known layout");
        }
        if !layout.is_contiguous() {
            shape_bail!("host tensor must be contiguous, got stride {:?}", layout.stride);
        }
        let expected = layout.num_elements() * layout.dtype.size_of();
        if data.len() != expected {
            shape_bail!(
                "data length {} does not match layout {} (expected {expected} bytes)",
                data.len(),
                layout.signature()
            );
        }
        Ok(Self { layout, data })
    }

    /// Zero-filled tensor.
    pub fn zeros(layout: TensorLayout) -> Self {
        let layout = layout.contiguous();
        let data = vec![0u8; layout.num_elements() * layout.dtype.size_of()];
        Self { layout, data }
    }

    /// Build from `f64` values, cast to `dtype`.
    pub fn from_f64(shape: &[usize], dtype: DType, device: CompNode, values: &[f64]) -> Result<Self> {
        let layout = TensorLayout::new(shape, dtype, device);
        if values.len() != layout.num_elements() {
            shape_bail!(
                "{} values do not fill shape {:?}",
                values.len(),
                layout.shape
            );
        }
        let mut out = Self::zeros(layout);
        for (i, v) in values.iter().enumerate() {
            out.set(i, *v);
        }
        Ok(out)
    }

    pub fn from_f32(shape: &[usize], device: CompNode, values: &[f32]) -> Result<Self> {
        let values: Vec<f64> = values.iter().map(|v| *v as f64).collect();
        Self::from_f64(shape, DType::F32, device, &values)
    }

    pub fn from_i32(shape: &[usize], device: CompNode, values: &[i32]) -> Result<Self> {
        let values: Vec<f64> = values.iter().map(|v| *v as f64).collect();
        Self::from_f64(shape, DType::I32, device, &values)
    }

    /// A 0-dim tensor holding one value.
    pub fn scalar(v: f64, dtype: DType, device: CompNode) -> Self {
        let mut out = Self::zeros(TensorLayout::new(Vec::new(), dtype, device));
        out.set(0, v);
        out
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    pub fn shape(&self) -> &[usize] {
        &self.layout.shape
    }

    pub fn dtype(&self) -> DType {
        self.layout.dtype
    }

    pub fn num_elements(&self) -> usize {
        self.layout.num_elements()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    pub fn get(&self, idx: usize) -> f64 {
        self.layout.dtype.read_f64(&self.data, idx)
    }

    #[inline]
    pub fn set(&mut self, idx: usize, v: f64) {
        let dtype = self.layout.dtype;
        dtype.write_f64(&mut self.data, idx, v)
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.num_elements()).map(|i| self.get(i)).collect()
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        (0..self.num_elements()).map(|i| self.get(i) as f32).collect()
    }

    pub fn to_i32_vec(&self) -> Vec<i32> {
        (0..self.num_elements()).map(|i| self.get(i) as i32).collect()
    }

    /// Same data viewed with another shape of equal element count.
    pub fn reshaped(mut self, shape: &[usize]) -> Result<Self> {
        let layout = TensorLayout::new(shape, self.layout.dtype, self.layout.device);
        if layout.num_elements() != self.num_elements() {
            shape_bail!(
                "cannot reshape {:?} into {:?}",
                self.layout.shape,
                layout.shape
            );
        }
        self.layout = layout;
        Ok(self)
    }

    /// Value equality with an absolute tolerance, shapes and dtypes must match.
    pub fn allclose(&self, other: &HostTensor, atol: f64) -> bool {
        self.layout.shape == other.layout.shape
            && self.layout.dtype == other.layout.dtype
            && (0..self.num_elements()).all(|i| (self.get(i) - other.get(i)).abs() <= atol)
    }
}
