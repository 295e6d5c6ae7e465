use std::{collections::HashSet, sync::mpsc::Sender};

use super::{ChannelOptions, TensorHandle};
use crate::{HostTensor, OpDef, Result, TensorLayout};

/// Unit of work consumed by the channel worker, in submission order.
pub(crate) enum Command {
    Put {
        seq: u64,
        dest: TensorHandle,
        value: HostTensor,
    },
    ApplyOp {
        seq: u64,
        op: OpDef,
        inputs: Vec<TensorHandle>,
        outputs: Vec<TensorHandle>,
    },
    Drop {
        tensor: TensorHandle,
    },
    GetValue {
        tensor: TensorHandle,
        reply: Sender<Result<HostTensor>>,
    },
    GetLayout {
        tensor: TensorHandle,
        reply: Sender<Result<TensorLayout>>,
    },
    Sync {
        reply: Sender<()>,
    },
    SetOption {
        options: ChannelOptions,
    },
    Close,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Put { .. } => "Put",
            Self::ApplyOp { .. } => "ApplyOp",
            Self::Drop { .. } => "Drop",
            Self::GetValue { .. } => "GetValue",
            Self::GetLayout { .. } => "GetLayout",
            Self::Sync { .. } => "Sync",
            Self::SetOption { .. } => "SetOption",
            Self::Close => "Close",
        }
    }

    /// Ids of the tensors the command reads or writes.
    pub fn touches(&self, ids: &mut HashSet<u64>) {
        match self {
            Self::Put { dest, .. } => {
                ids.insert(dest.id());
            }
            Self::ApplyOp {
                inputs, outputs, ..
            } => ids.extend(inputs.iter().chain(outputs).map(TensorHandle::id)),
            Self::Drop { tensor }
            | Self::GetValue { tensor, .. }
            | Self::GetLayout { tensor, .. } => {
                ids.insert(tensor.id());
            }
            Self::Sync { .. } | Self::SetOption { .. } | Self::Close => {}
        }
    }
}
