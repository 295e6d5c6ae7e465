use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Host memory arena driven by the reference CPU kernels.
    Cpu,
}

/// A concrete compute node: a device kind plus an ordinal.
///
/// Memory pools and algorithm choices are keyed by `CompNode`, so two
/// ordinals never share free-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompNode {
    pub kind: DeviceKind,
    pub ordinal: u32,
}

impl CompNode {
    pub const fn cpu(ordinal: u32) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            ordinal,
        }
    }

    /// The default device, `cpu0`.
    pub const fn default_device() -> Self {
        Self::cpu(0)
    }
}

impl Default for CompNode {
    fn default() -> Self {
        Self::default_device()
    }
}

impl Display for CompNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu{}", self.ordinal),
        }
    }
}
