use log::warn;

use crate::{Error, Result};

pub const ENABLE_AUTO_DROP: &str = "enable_auto_drop";
pub const ASYNC_LEVEL: &str = "async_level";
pub const RECORD_INPUT_SHAPES: &str = "record_input_shapes";

/// Tunables of an execution channel.
///
/// The by-name surface mirrors the integer-valued option map of the channel:
/// booleans are `0`/`1`, `async_level` is one of `0`, `1`, `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Transparently regenerate dropped tensors from their producing command.
    pub enable_auto_drop: bool,
    /// `2`: errors surface at sync points only. `1`: also at the next
    /// `apply`. `0`: every `apply` waits and raises kernel errors directly.
    pub async_level: u8,
    /// Attach input shapes to async error provenance.
    pub record_input_shapes: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            enable_auto_drop: false,
            async_level: 2,
            record_input_shapes: false,
        }
    }
}

fn as_bool(name: &str, value: i64) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::config(format!(
            "option `{name}` expects 0 or 1, got {other}"
        ))),
    }
}

impl ChannelOptions {
    pub const NAMES: [&'static str; 3] = [ENABLE_AUTO_DROP, ASYNC_LEVEL, RECORD_INPUT_SHAPES];

    /// Defaults overridden by `TENSORVM_ENABLE_AUTO_DROP`,
    /// `TENSORVM_ASYNC_LEVEL` and `TENSORVM_RECORD_INPUT_SHAPES`.
    pub fn from_env() -> Self {
        Self::from_vars(|var| std::env::var(var).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::default();
        for name in Self::NAMES {
            let var = format!("TENSORVM_{}", name.to_uppercase());
            let Some(raw) = lookup(&var) else {
                continue;
            };
            let parsed = raw
                .trim()
                .parse::<i64>()
                .map_err(|e| Error::config(format!("{var}={raw}: {e}")))
                .and_then(|v| opts.set(name, v));
            if let Err(e) = parsed {
                warn!("ignoring {var}: {e}");
            }
        }
        opts
    }

    pub fn set(&mut self, name: &str, value: i64) -> Result<()> {
        match name {
            ENABLE_AUTO_DROP => self.enable_auto_drop = as_bool(name, value)?,
            RECORD_INPUT_SHAPES => self.record_input_shapes = as_bool(name, value)?,
            ASYNC_LEVEL => {
                if !(0..=2).contains(&value) {
                    return Err(Error::config(format!(
                        "option `{ASYNC_LEVEL}` expects 0, 1 or 2, got {value}"
                    )));
                }
                self.async_level = value as u8;
            }
            other => {
                return Err(Error::config(format!(
                    "unknown option `{other}`, expected one of {:?}",
                    Self::NAMES
                )))
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<i64> {
        match name {
            ENABLE_AUTO_DROP => Ok(self.enable_auto_drop as i64),
            ASYNC_LEVEL => Ok(self.async_level as i64),
            RECORD_INPUT_SHAPES => Ok(self.record_input_shapes as i64),
            other => Err(Error::config(format!(
                "unknown option `{other}`, expected one of {:?}",
                Self::NAMES
            ))),
        }
    }
}
