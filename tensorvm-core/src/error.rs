use std::{convert::Infallible, fmt::Display};

use crate::device::CompNode;

/// Where an asynchronous failure was raised on the channel worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncOrigin {
    /// Zero-based index of the failing command in submission order.
    pub command: u64,
    /// Name of the operator the command applied, or the command kind.
    pub op: String,
    /// Input layouts of the command, present when `record_input_shapes` is set.
    pub input_shapes: Option<Vec<Vec<usize>>>,
}

impl Display for AsyncOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command #{} `{}`", self.command, self.op)?;
        if let Some(shapes) = &self.input_shapes {
            write!(f, " with input shapes {shapes:?}")?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid or mutually incompatible tensor layouts.
    #[error("shape error: {0}")]
    Shape(String),

    /// Values from different symbolic contexts were mixed in one call.
    #[error("graph mismatch: {0}")]
    GraphMismatch(String),

    /// Allocation failed even after one defragmentation retry.
    #[error("out of memory on {device}: requested {requested} bytes ({live} bytes live, capacity {capacity})")]
    OutOfMemory {
        device: CompNode,
        requested: usize,
        live: usize,
        capacity: usize,
    },

    /// An error raised by an earlier command, observed at a later sync point.
    #[error("async error: {source}\n  raised by {origin}; reported at `{observed_at}`. This is where it is reported, not where it happened; set `async_level` to 0 for precise error locations.")]
    Async {
        source: Box<Self>,
        origin: AsyncOrigin,
        observed_at: &'static str,
    },

    /// A replay violated what the trace recorded.
    #[error("trace contract violation: {0}")]
    TraceContractViolation(String),

    /// Unknown option, bad option value or invalid transformation setup.
    #[error("config error: {0}")]
    Config(String),

    /// Failure reported by a kernel collaborator.
    #[error("kernel `{kernel}` failed: {msg}")]
    Kernel { kernel: String, msg: String },

    /// The channel recorded an asynchronous failure and refuses new work.
    #[error("channel is poisoned by an earlier failure; close it and create a new one")]
    ChannelPoisoned,

    #[error("channel is closed")]
    ChannelClosed,

    /// The tensor's producing command failed or its storage was dropped.
    #[error("invalid tensor {id}: {reason}")]
    InvalidTensor { id: u64, reason: String },

    #[error("Message: {0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("json error: {0}")]
    Json(String),

    /// Arbitrary errors wrapping.
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),

    /// Arbitrary errors wrapping with context.
    #[error("{wrapped:?}\n{context:?}")]
    WrappedContext {
        wrapped: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new error based on a printable error message.
    ///
    /// If the message implements `std::error::Error`, prefer using [`Error::wrap`] instead.
    pub fn msg<M: Display>(msg: M) -> Self {
        Self::Msg(msg.to_string()).bt()
    }

    pub fn wrap(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(err)).bt()
    }

    pub fn shape<M: Display>(msg: M) -> Self {
        Self::Shape(msg.to_string())
    }

    pub fn config<M: Display>(msg: M) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn trace_violation<M: Display>(msg: M) -> Self {
        Self::TraceContractViolation(msg.to_string())
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// The error with any backtrace wrapper removed.
    pub fn unbt(&self) -> &Self {
        match self {
            Self::WithBacktrace { inner, .. } => inner.unbt(),
            other => other,
        }
    }

    /// True when this error was raised by an earlier command and observed later.
    pub fn is_async(&self) -> bool {
        matches!(self.unbt(), Self::Async { .. })
    }

    /// The original cause, looking through async and backtrace wrappers.
    pub fn root(&self) -> &Self {
        match self.unbt() {
            Self::Async { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::IoError(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(value.to_string())
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg).into()).bt())
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg(format!($err).into()).bt())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*).into()).bt())
    };
}

/// Return early with an [`Error::Shape`].
#[macro_export]
macro_rules! shape_bail {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        return Err($crate::Error::Shape(format!($fmt $(, $arg)*)))
    };
}

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for std::result::Result<T, E> where E: std::error::Error {}
    impl<T> Sealed for Option<T> {}
}

/// Attach more context to an error.
///
/// Inspired by [`anyhow::Context`].
pub trait Context<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily
    /// only once an error does occur.
    fn with_context<C, F>(self, f: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        // Not using map_err to save 2 useless frames off the captured backtrace
        // in ext_context.
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context.to_string(),
            }),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context().to_string(),
            }),
        }
    }
}

impl<T> Context<T, Infallible> for Option<T> {
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        // Not using ok_or_else to save 2 useless frames off the captured
        // backtrace.
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context)),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context())),
        }
    }
}
