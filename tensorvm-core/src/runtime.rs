use std::sync::Arc;

use log::debug;

use crate::{
    transformation::{
        strip, DTypePromoteTransformation, InterpreterTransformation, ScalarTransformation, Segment,
        Transformation, TransformationManager,
    },
    Channel, Error, HostTensor, OpDef, Result, TensorLayout, Value, ValueKind,
};

/// A transformation stack bound to one execution channel.
///
/// `Runtime::new` registers the interpreter over its channel as the Eval
/// layer plus the scalar and dtype promotion layers, which is enough to run
/// operators eagerly. Tracing, gradient recording and lazy evaluation are
/// added by registering further layers.
pub struct Runtime {
    manager: TransformationManager,
    channel: Arc<Channel>,
    interpreter: Arc<dyn Transformation>,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        Self::with_channel(Channel::new()?)
    }

    pub fn with_channel(channel: Channel) -> Result<Self> {
        let channel = Arc::new(channel);
        let manager = TransformationManager::new();
        let interpreter: Arc<dyn Transformation> =
            Arc::new(InterpreterTransformation::new(channel.clone()));
        manager.register(Segment::Eval, interpreter.clone())?;
        manager.register(Segment::Scalar, Arc::new(ScalarTransformation::new()))?;
        manager.register(Segment::DTypePromote, Arc::new(DTypePromoteTransformation::new()))?;
        debug!("runtime on channel {} ready", channel.id());
        Ok(Self {
            manager,
            channel,
            interpreter,
        })
    }

    pub fn manager(&self) -> &TransformationManager {
        &self.manager
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// The default Eval layer.
    pub fn interpreter(&self) -> Arc<dyn Transformation> {
        self.interpreter.clone()
    }

    pub fn register(&self, segment: Segment, layer: Arc<dyn Transformation>) -> Result<()> {
        self.manager.register(segment, layer)
    }

    pub fn unregister(&self, layer: &Arc<dyn Transformation>) -> Result<()> {
        self.manager.unregister(layer)
    }

    pub fn apply(&self, op: &OpDef, inputs: &[Value]) -> Result<Vec<Value>> {
        self.manager.apply(op, inputs)
    }

    /// Upload host data to the channel.
    pub fn put(&self, tensor: HostTensor) -> Result<Value> {
        Ok(Value::device(self.channel.put(tensor)?))
    }

    /// Copy a value to the host, waiting for the channel when needed.
    pub fn to_host(&self, value: &Value) -> Result<HostTensor> {
        let kind = value.kind().clone();
        match kind {
            ValueKind::Host(t) => Ok(t),
            ValueKind::Device(h) => self.channel.get_value(&h),
            ValueKind::Scalar(s) => Ok(HostTensor::scalar(s.value, s.dtype, s.device)),
            ValueKind::Symbolic(n) => Err(Error::GraphMismatch(format!(
                "value #{} is node {} of graph {} and has no data",
                value.id(),
                n.node,
                n.graph
            ))),
            ValueKind::Grad(_) | ValueKind::TraceMark(_) => match strip(value) {
                Some(inner) => self.to_host(&inner),
                None => Err(Error::trace_violation(format!(
                    "value #{} is a symbolic trace var and has no data",
                    value.id()
                ))),
            },
        }
    }

    /// The value's layout, waiting for the channel when it is not determined.
    pub fn layout(&self, value: &Value) -> Result<TensorLayout> {
        let device = value.as_device();
        match device {
            Some(h) => self.channel.get_layout(&h),
            None => Ok(value.layout()),
        }
    }

    /// Release the storage behind `value`.
    pub fn drop_value(&self, value: &Value) -> Result<()> {
        self.apply(&OpDef::drop_op(), std::slice::from_ref(value))
            .map(|_| ())
    }

    pub fn sync(&self) -> Result<()> {
        self.channel.sync()
    }

    pub fn set_option(&self, name: &str, value: i64) -> Result<()> {
        self.channel.set_option(name, value)
    }

    pub fn get_option(&self, name: &str) -> Result<i64> {
        self.channel.get_option(name)
    }

    pub fn close(&self) -> Result<()> {
        self.channel.close()
    }
}
