use std::{convert::Infallible, io};
use thiserror::Error;

/// Why the module itself reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// `RDY` was not seen before the start timeout.
    NotReady,
    /// `AT+IFC=2,2` was rejected or never acknowledged.
    FlowControl,
    /// `AT&W` was rejected or never acknowledged.
    SaveSettings,
    /// A plain command did not complete with `OK`.
    Command,
}

impl std::fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceFault::NotReady => "modem did not report RDY",
            DeviceFault::FlowControl => "set flow control failed",
            DeviceFault::SaveSettings => "save settings failed",
            DeviceFault::Command => "command failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("device error: {0}")]
    Device(DeviceFault),

    #[error("gpio {pin} write failed: {source}")]
    Gpio {
        pin: u32,
        #[source]
        source: io::Error,
    },

    #[error("command channel i/o failed: {0}")]
    Channel(#[source] io::Error),

    #[error("serial device `{path}` setup failed: {source}")]
    Serial {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("modem worker failed: {0}")]
    Worker(String),

    #[error("modem state poisoned")]
    Poisoned,
}

impl ModemError {
    /// True for failures reported by the module rather than by the host.
    pub fn is_device_error(&self) -> bool {
        matches!(self, ModemError::Device(_))
    }
}

impl From<Infallible> for ModemError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

pub type Result<T> = std::result::Result<T, ModemError>;
