use std::{
    collections::{HashSet, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{atomic::Ordering, mpsc::Receiver, Arc},
};

use log::{debug, trace};

use super::{ChannelOptions, Command, Producer, Shared, TensorHandle, TensorState};
use crate::{
    error::AsyncOrigin, AlgoChooser, Blob, BlobManager, Error, HostTensor, Kernel, OpDef, Result,
    TensorLayout,
};

/// The consumer side of a channel. Runs on its own thread.
pub(crate) struct Worker {
    rx: Receiver<Command>,
    /// Commands received but not yet executed.
    queue: VecDeque<Command>,
    shared: Arc<Shared>,
    kernel: Arc<dyn Kernel>,
    options: ChannelOptions,
}

impl Worker {
    pub fn new(
        rx: Receiver<Command>,
        shared: Arc<Shared>,
        kernel: Arc<dyn Kernel>,
        options: ChannelOptions,
    ) -> Self {
        Self {
            rx,
            queue: VecDeque::new(),
            shared,
            kernel,
            options,
        }
    }

    fn fill_queue(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            self.queue.push_back(cmd);
        }
    }

    fn next(&mut self) -> Option<Command> {
        if let Some(cmd) = self.queue.pop_front() {
            return Some(cmd);
        }
        self.rx.recv().ok()
    }

    pub fn run(mut self) {
        while let Some(cmd) = self.next() {
            trace!("executing {}", cmd.kind());
            let close = matches!(cmd, Command::Close);
            self.process(cmd);
            self.shared.executed.fetch_add(1, Ordering::SeqCst);
            if close {
                break;
            }
        }
        debug!("channel worker exiting");
    }

    fn process(&mut self, cmd: Command) {
        match cmd {
            Command::Put { seq, dest, value } => {
                if self.shared.is_poisoned() {
                    *dest.state() = TensorState::Failed("skipped: channel is poisoned".to_string());
                    return;
                }
                let bytes = value.bytes().len();
                let result = self
                    .alloc(dest.device(), bytes, &[dest.id()])
                    .and_then(|blob| blob.write(value.bytes()).map(|_| blob));
                match result {
                    Ok(blob) => *dest.state() = TensorState::Ready(blob),
                    Err(e) => {
                        let origin = self.origin(seq, "Put", &[value.layout().clone()]);
                        *dest.state() = TensorState::Failed(e.to_string());
                        self.shared.poison(e, origin);
                    }
                }
            }
            Command::ApplyOp {
                seq,
                op,
                inputs,
                outputs,
            } => {
                if self.shared.is_poisoned() {
                    for out in &outputs {
                        *out.state() =
                            TensorState::Failed("skipped: channel is poisoned".to_string());
                    }
                    return;
                }
                if let Err(e) = self.apply(&op, &inputs, &outputs) {
                    let layouts: Vec<TensorLayout> =
                        inputs.iter().map(TensorHandle::layout).collect();
                    let origin = self.origin(seq, op.name(), &layouts);
                    for out in &outputs {
                        *out.state() = TensorState::Failed(e.to_string());
                    }
                    self.shared.poison(e, origin);
                }
            }
            Command::Drop { tensor } => Self::evict(&tensor),
            Command::GetValue { tensor, reply } => {
                let value = self.resolve(&tensor);
                let _ = reply.send(value);
            }
            Command::GetLayout { tensor, reply } => {
                let layout = match &*tensor.state() {
                    TensorState::Failed(reason) => Err(Error::InvalidTensor {
                        id: tensor.id(),
                        reason: reason.clone(),
                    }),
                    _ => Ok(tensor.layout()),
                };
                let _ = reply.send(layout);
            }
            Command::Sync { reply } => {
                let _ = reply.send(());
            }
            Command::SetOption { options } => self.options = options,
            Command::Close => {}
        }
    }

    fn origin(&self, seq: u64, op: &str, inputs: &[TensorLayout]) -> AsyncOrigin {
        AsyncOrigin {
            command: seq,
            op: op.to_string(),
            input_shapes: self
                .options
                .record_input_shapes
                .then(|| inputs.iter().map(|l| l.shape.clone()).collect()),
        }
    }

    fn evict(tensor: &TensorHandle) {
        let mut state = tensor.state();
        if matches!(*state, TensorState::Ready(_) | TensorState::Pending) {
            *state = TensorState::Evicted;
        }
    }

    /// Execute queued `Drop` commands that no earlier queued command and none
    /// of `busy` depends on. Returns how many were executed.
    fn hoist_drops(&mut self, busy: &[u64]) -> usize {
        self.fill_queue();
        let mut referenced: HashSet<u64> = busy.iter().copied().collect();
        let mut hoisted = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for cmd in self.queue.drain(..) {
            match cmd {
                Command::Drop { tensor } if !referenced.contains(&tensor.id()) => {
                    hoisted.push(tensor)
                }
                other => {
                    other.touches(&mut referenced);
                    kept.push_back(other);
                }
            }
        }
        self.queue = kept;
        for tensor in &hoisted {
            Self::evict(tensor);
        }
        let n = hoisted.len() as u64;
        self.shared.executed.fetch_add(n, Ordering::SeqCst);
        self.shared.hoisted.fetch_add(n, Ordering::SeqCst);
        hoisted.len()
    }

    fn alloc(&mut self, device: crate::CompNode, bytes: usize, busy: &[u64]) -> Result<Blob> {
        BlobManager::inst().alloc_with_defrag(device, bytes, &mut || self.hoist_drops(busy))
    }

    /// Host copy of a tensor's content, regenerating it when it was dropped
    /// and auto drop is enabled.
    fn resolve(&mut self, tensor: &TensorHandle) -> Result<HostTensor> {
        let bytes = {
            let state = tensor.state();
            match &*state {
                TensorState::Ready(blob) => {
                    let layout = tensor.layout();
                    Some((blob.read(layout.num_elements() * layout.dtype.size_of()), layout))
                }
                TensorState::Failed(reason) => {
                    return Err(Error::InvalidTensor {
                        id: tensor.id(),
                        reason: reason.clone(),
                    })
                }
                TensorState::Pending => {
                    return Err(Error::InvalidTensor {
                        id: tensor.id(),
                        reason: "tensor was never produced on this channel".to_string(),
                    })
                }
                TensorState::Evicted => None,
            }
        };
        match bytes {
            Some((data, layout)) => HostTensor::from_bytes(layout.contiguous(), data),
            None => self.regenerate(tensor),
        }
    }

    fn regenerate(&mut self, tensor: &TensorHandle) -> Result<HostTensor> {
        let producer = match (self.options.enable_auto_drop, tensor.producer()) {
            (true, Some(p)) => p,
            _ => {
                return Err(Error::InvalidTensor {
                    id: tensor.id(),
                    reason: "tensor storage was dropped".to_string(),
                })
            }
        };
        debug!("regenerating dropped tensor {}", tensor.id());
        self.shared.regenerated.fetch_add(1, Ordering::SeqCst);
        match producer {
            Producer::Put(value) => {
                let blob = self.alloc(tensor.device(), value.bytes().len(), &[tensor.id()])?;
                blob.write(value.bytes())?;
                *tensor.state() = TensorState::Ready(blob);
            }
            Producer::Op { op, inputs, index } => {
                // Recompute the producing command; sibling outputs go to scratch handles.
                let outputs: Vec<TensorHandle> = (0..=index)
                    .map(|i| {
                        if i == index {
                            tensor.clone()
                        } else {
                            let layout = TensorLayout::unknown(tensor.layout().dtype, tensor.device());
                            TensorHandle::new(tensor.0.channel, layout, None)
                        }
                    })
                    .collect();
                self.apply(&op, &inputs, &outputs)?;
            }
        }
        self.resolve(tensor)
    }

    fn apply(&mut self, op: &OpDef, inputs: &[TensorHandle], outputs: &[TensorHandle]) -> Result<()> {
        if op.is_control() {
            crate::bail!("control command {op} reached the channel");
        }
        let hosts = inputs
            .iter()
            .map(|t| self.resolve(t))
            .collect::<Result<Vec<_>>>()?;
        let in_layouts: Vec<TensorLayout> = hosts.iter().map(|h| h.layout().clone()).collect();

        // Outputs left undetermined at submission get their layout now.
        let (out_layouts, determined) = self.kernel.infer_output_layouts(op, &in_layouts)?;
        if !determined || out_layouts.len() < outputs.len() {
            crate::bail!("{op}: output layouts undetermined with concrete inputs");
        }
        let algo = AlgoChooser::inst().select(self.kernel.as_ref(), op, &in_layouts, &out_layouts)?;

        let busy: Vec<u64> = inputs.iter().chain(outputs).map(TensorHandle::id).collect();
        let mut blobs = Vec::with_capacity(outputs.len());
        for layout in out_layouts.iter().take(outputs.len()) {
            blobs.push(self.alloc(layout.device, layout.span_bytes(), &busy)?);
        }
        let device = in_layouts
            .first()
            .or(out_layouts.first())
            .map(|l| l.device)
            .unwrap_or_default();
        let workspace_blob = match algo.workspace_bytes {
            0 => None,
            bytes => Some(self.alloc(device, bytes, &busy)?),
        };

        let mut host_outputs: Vec<HostTensor> =
            out_layouts.iter().cloned().map(HostTensor::zeros).collect();
        // The kernel works on a staged copy of the workspace region.
        let mut workspace = workspace_blob
            .as_ref()
            .map(|blob| blob.read(algo.workspace_bytes))
            .unwrap_or_default();
        let kernel = self.kernel.clone();
        let run = catch_unwind(AssertUnwindSafe(|| {
            kernel.execute(op, &algo, &hosts, &mut host_outputs, &mut workspace)
        }));
        if let Some(blob) = &workspace_blob {
            blob.write(&workspace)?;
            self.shared
                .workspace_bytes
                .fetch_add(workspace.len() as u64, Ordering::SeqCst);
        }
        drop(workspace_blob);
        match run {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Kernel {
                    kernel: op.name().to_string(),
                    msg: "kernel panicked".to_string(),
                })
            }
        }
        self.shared.kernels.fetch_add(1, Ordering::SeqCst);

        for ((handle, host), blob) in outputs.iter().zip(&host_outputs).zip(blobs) {
            blob.write(host.bytes())?;
            handle.set_layout(host.layout().clone());
            *handle.state() = TensorState::Ready(blob);
        }
        Ok(())
    }
}
