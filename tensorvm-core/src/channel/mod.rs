//! The asynchronous execution channel.
//!
//! A [`Channel`] owns one worker thread fed through an mpsc queue. Producers
//! submit commands from any thread and get tensor handles back immediately;
//! the worker executes commands strictly in submission order, so a handle is
//! a valid input to later commands before its content exists.
//!
//! A failing command poisons the channel. The error is parked in an error
//! box and handed out exactly once, wrapped in [`Error::Async`], to the next
//! caller that synchronizes. A poisoned channel rejects new `apply_op` and
//! `put` submissions until it is closed.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex, MutexGuard,
    },
    thread::JoinHandle,
};

use log::{debug, warn};

use crate::{
    error::AsyncOrigin, Blob, CompNode, CpuKernel, Error, HostTensor, Kernel, OpDef, Result,
    TensorLayout,
};

mod command;
mod options;
mod worker;

pub(crate) use command::Command;
pub use options::{ChannelOptions, ASYNC_LEVEL, ENABLE_AUTO_DROP, RECORD_INPUT_SHAPES};

static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);
static TENSOR_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
pub(crate) enum TensorState {
    Pending,
    Ready(Blob),
    Failed(String),
    Evicted,
}

/// How to recompute a dropped tensor.
#[derive(Debug, Clone)]
pub(crate) enum Producer {
    Put(HostTensor),
    Op {
        op: OpDef,
        inputs: Vec<TensorHandle>,
        index: usize,
    },
}

#[derive(Debug)]
pub(crate) struct TensorInfo {
    id: u64,
    channel: u64,
    device: CompNode,
    layout: Mutex<TensorLayout>,
    state: Mutex<TensorState>,
    producer: Mutex<Option<Producer>>,
}

/// A reference-counted handle to a tensor living on a channel.
///
/// The device storage is released when the last handle is dropped or when a
/// `Drop` command for it is executed.
#[derive(Clone)]
pub struct TensorHandle(Arc<TensorInfo>);

impl TensorHandle {
    fn new(channel: u64, layout: TensorLayout, producer: Option<Producer>) -> Self {
        Self(Arc::new(TensorInfo {
            id: TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            channel,
            device: layout.device,
            layout: Mutex::new(layout),
            state: Mutex::new(TensorState::Pending),
            producer: Mutex::new(producer),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn device(&self) -> CompNode {
        self.0.device
    }

    /// The layout as currently known; may be undetermined while pending.
    pub fn layout(&self) -> TensorLayout {
        lock(&self.0.layout).clone()
    }

    /// True once the worker has produced the tensor's content.
    pub fn is_ready(&self) -> bool {
        matches!(*lock(&self.0.state), TensorState::Ready(_))
    }

    pub(crate) fn set_layout(&self, layout: TensorLayout) {
        *lock(&self.0.layout) = layout;
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, TensorState> {
        lock(&self.0.state)
    }

    pub(crate) fn producer(&self) -> Option<Producer> {
        lock(&self.0.producer).clone()
    }
}

impl Debug for TensorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TensorHandle({}, {})", self.0.id, self.layout().signature())
    }
}

impl PartialEq for TensorHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Counters of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub submitted: u64,
    pub executed: u64,
    pub kernels: u64,
    pub regenerated: u64,
    /// `Drop` commands executed ahead of their turn to relieve memory pressure.
    pub hoisted: u64,
    /// Bytes of device workspace staged for kernels.
    pub workspace_bytes: u64,
}

/// State shared between producers and the worker.
#[derive(Default)]
pub(crate) struct Shared {
    error: Mutex<Option<(Error, AsyncOrigin)>>,
    poisoned: AtomicBool,
    executed: AtomicU64,
    kernels: AtomicU64,
    regenerated: AtomicU64,
    hoisted: AtomicU64,
    workspace_bytes: AtomicU64,
}

impl Shared {
    pub(crate) fn poison(&self, error: Error, origin: AsyncOrigin) {
        warn!("channel poisoned by {origin}: {error}");
        let mut slot = lock(&self.error);
        // Only the first failure is reported; later ones are consequences.
        if slot.is_none() {
            *slot = Some((error, origin));
        }
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn take_error(&self) -> Option<(Error, AsyncOrigin)> {
        lock(&self.error).take()
    }
}

/// An asynchronous command queue with a single execution worker.
pub struct Channel {
    id: u64,
    tx: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
    kernel: Arc<dyn Kernel>,
    options: Mutex<ChannelOptions>,
    next_seq: AtomicU64,
}

impl Channel {
    /// A channel running the reference CPU kernels, options from the environment.
    pub fn new() -> Result<Self> {
        Self::with_kernel(Arc::new(CpuKernel), ChannelOptions::from_env())
    }

    pub fn with_kernel(kernel: Arc<dyn Kernel>, options: ChannelOptions) -> Result<Self> {
        let id = CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::default());
        let worker = worker::Worker::new(rx, shared.clone(), kernel.clone(), options);
        let handle = std::thread::Builder::new()
            .name(format!("tensorvm-channel-{id}"))
            .spawn(move || worker.run())?;
        debug!("channel {id} started");
        Ok(Self {
            id,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            shared,
            kernel,
            options: Mutex::new(options),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.tx).is_none()
    }

    pub fn is_poisoned(&self) -> bool {
        self.shared.is_poisoned()
    }

    /// Submit a command built from its submission index.
    fn submit(&self, make: impl FnOnce(u64) -> Command) -> Result<()> {
        let tx = lock(&self.tx);
        let Some(tx) = tx.as_ref() else {
            return Err(Error::ChannelClosed);
        };
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        tx.send(make(seq)).map_err(|_| Error::ChannelClosed)
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.submit(|_| cmd)
    }

    fn check_handle(&self, tensor: &TensorHandle) -> Result<()> {
        if tensor.0.channel != self.id {
            return Err(Error::InvalidTensor {
                id: tensor.id(),
                reason: format!(
                    "tensor belongs to channel {}, not channel {}",
                    tensor.0.channel, self.id
                ),
            });
        }
        Ok(())
    }

    /// Drain the error box, wrapping the error with where it is observed.
    fn pending_error(&self, observed_at: &'static str) -> Result<()> {
        match self.shared.take_error() {
            Some((source, origin)) => Err(Error::Async {
                source: Box::new(source),
                origin,
                observed_at,
            }),
            None => Ok(()),
        }
    }

    /// Upload host data. Returns immediately.
    pub fn put(&self, value: HostTensor) -> Result<TensorHandle> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let options = self.options();
        if options.async_level == 1 {
            self.pending_error("put")?;
        }
        if self.shared.is_poisoned() {
            warn!("channel {} rejected an upload: poisoned", self.id);
            return Err(Error::ChannelPoisoned);
        }
        let producer = options
            .enable_auto_drop
            .then(|| Producer::Put(value.clone()));
        let dest = TensorHandle::new(self.id, value.layout().clone(), producer);
        self.submit(|seq| Command::Put {
            seq,
            dest: dest.clone(),
            value,
        })?;
        Ok(dest)
    }

    /// Enqueue `op` on `inputs`, returning placeholder outputs.
    ///
    /// Shape inference runs here, so invalid layouts fail synchronously
    /// before anything is allocated.
    pub fn apply_op(&self, op: &OpDef, inputs: &[TensorHandle]) -> Result<Vec<TensorHandle>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let options = self.options();
        if options.async_level == 1 {
            self.pending_error("apply_op")?;
        }
        if self.shared.is_poisoned() {
            warn!("channel {} rejected {op}: poisoned", self.id);
            return Err(Error::ChannelPoisoned);
        }
        for t in inputs {
            self.check_handle(t)?;
        }
        let layouts: Vec<TensorLayout> = inputs.iter().map(TensorHandle::layout).collect();
        let (out_layouts, _) = self.kernel.infer_output_layouts(op, &layouts)?;
        let outputs: Vec<TensorHandle> = out_layouts
            .into_iter()
            .enumerate()
            .map(|(index, layout)| {
                let producer = options.enable_auto_drop.then(|| Producer::Op {
                    op: op.clone(),
                    inputs: inputs.to_vec(),
                    index,
                });
                TensorHandle::new(self.id, layout, producer)
            })
            .collect();
        self.submit(|seq| Command::ApplyOp {
            seq,
            op: op.clone(),
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
        })?;
        if options.async_level == 0 {
            self.wait()?;
            if let Some((err, _)) = self.shared.take_error() {
                return Err(err);
            }
        }
        Ok(outputs)
    }

    /// Release a tensor's storage without waiting.
    pub fn drop_tensor(&self, tensor: &TensorHandle) -> Result<()> {
        self.check_handle(tensor)?;
        self.send(Command::Drop {
            tensor: tensor.clone(),
        })
    }

    fn wait(&self) -> Result<()> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::Sync { reply })?;
        rx.recv().map_err(|_| Error::ChannelClosed)
    }

    /// Block until every previously submitted command completed or failed.
    pub fn sync(&self) -> Result<()> {
        self.wait()?;
        self.pending_error("sync")
    }

    /// Report a pending asynchronous error without blocking.
    pub fn check_available(&self) -> Result<()> {
        self.pending_error("check_available")
    }

    /// Block until `tensor` is computed and copy it to the host.
    pub fn get_value(&self, tensor: &TensorHandle) -> Result<HostTensor> {
        self.check_handle(tensor)?;
        let (reply, rx) = mpsc::channel();
        self.send(Command::GetValue {
            tensor: tensor.clone(),
            reply,
        })?;
        let value = rx.recv().map_err(|_| Error::ChannelClosed)?;
        self.pending_error("get_value")?;
        value
    }

    /// The tensor's layout, blocking only when it is not determined yet.
    pub fn get_layout(&self, tensor: &TensorHandle) -> Result<TensorLayout> {
        let layout = tensor.layout();
        if layout.is_known() {
            return Ok(layout);
        }
        self.check_handle(tensor)?;
        let (reply, rx) = mpsc::channel();
        self.send(Command::GetLayout {
            tensor: tensor.clone(),
            reply,
        })?;
        let layout = rx.recv().map_err(|_| Error::ChannelClosed)?;
        self.pending_error("get_layout")?;
        layout
    }

    pub fn options(&self) -> ChannelOptions {
        *lock(&self.options)
    }

    pub fn set_option(&self, name: &str, value: i64) -> Result<()> {
        let options = {
            let mut options = lock(&self.options);
            options.set(name, value)?;
            *options
        };
        self.send(Command::SetOption { options })
    }

    pub fn get_option(&self, name: &str) -> Result<i64> {
        lock(&self.options).get(name)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            submitted: self.next_seq.load(Ordering::SeqCst),
            executed: self.shared.executed.load(Ordering::SeqCst),
            kernels: self.shared.kernels.load(Ordering::SeqCst),
            regenerated: self.shared.regenerated.load(Ordering::SeqCst),
            hoisted: self.shared.hoisted.load(Ordering::SeqCst),
            workspace_bytes: self.shared.workspace_bytes.load(Ordering::SeqCst),
        }
    }

    /// Drain the queue and stop the worker. Further calls fail with
    /// [`Error::ChannelClosed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(tx) = lock(&self.tx).take() else {
            return Ok(());
        };
        let _ = tx.send(Command::Close);
        drop(tx);
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                return Err(Error::msg(format!("channel {} worker panicked", self.id)));
            }
        }
        debug!("channel {} closed", self.id);
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{e}");
        }
    }
}
