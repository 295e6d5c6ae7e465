use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
///
/// Data is stored little-endian in device memory; kernels read and write it
/// through [`DType::read_f64`] / [`DType::write_f64`], so every element type
/// can round-trip through `f64` losslessly except `I64` beyond 2^53.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    pub const fn size_of(&self) -> usize {
        match self {
            Self::Bool | Self::U8 => 1,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "uint8",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub const fn is_integral(&self) -> bool {
        !self.is_float()
    }

    /// Position in the promotion lattice; the higher rank wins.
    const fn rank(&self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::U8 => 1,
            Self::I32 => 2,
            Self::I64 => 3,
            Self::F32 => 4,
            Self::F64 => 5,
        }
    }

    /// The common type two tensor operands are promoted to.
    pub fn promote(self, other: DType) -> DType {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    /// Decode the `idx`-th element of `bytes`.
    pub fn read_f64(&self, bytes: &[u8], idx: usize) -> f64 {
        let sz = self.size_of();
        let b = &bytes[idx * sz..(idx + 1) * sz];
        match self {
            Self::Bool | Self::U8 => b[0] as f64,
            Self::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Self::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Self::I64 => {
                i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
            }
            Self::F64 => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        }
    }

    /// Encode `v` as the `idx`-th element of `bytes`, with C-style casting.
    pub fn write_f64(&self, bytes: &mut [u8], idx: usize, v: f64) {
        let sz = self.size_of();
        let b = &mut bytes[idx * sz..(idx + 1) * sz];
        match self {
            Self::Bool => b[0] = (v != 0.0) as u8,
            Self::U8 => b[0] = v as u8,
            Self::I32 => b.copy_from_slice(&(v as i32).to_le_bytes()),
            Self::F32 => b.copy_from_slice(&(v as f32).to_le_bytes()),
            Self::I64 => b.copy_from_slice(&(v as i64).to_le_bytes()),
            Self::F64 => b.copy_from_slice(&v.to_le_bytes()),
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::DType;

    #[test]
    fn promotion_prefers_float_and_width() {
        assert_eq!(DType::I32.promote(DType::F32), DType::F32);
        assert_eq!(DType::F32.promote(DType::F64), DType::F64);
        assert_eq!(DType::U8.promote(DType::I32), DType::I32);
        assert_eq!(DType::Bool.promote(DType::Bool), DType::Bool);
    }

    #[test]
    fn bytes_round_trip_with_casting() {
        let mut buf = vec![0u8; 8];
        DType::I32.write_f64(&mut buf, 1, -3.7);
        assert_eq!(DType::I32.read_f64(&buf, 1), -3.0);
        DType::F32.write_f64(&mut buf, 0, 1.5);
        assert_eq!(DType::F32.read_f64(&buf, 0), 1.5);
    }
}
