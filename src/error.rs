use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Identifies a leased resource in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Chip,
    Line(u32),
    PwmChannel(u32),
    SoftPwm(u32),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Chip => write!(f, "chip"),
            ResourceId::Line(offset) => write!(f, "GPIO line {}", offset),
            ResourceId::PwmChannel(channel) => write!(f, "PWM channel {}", channel),
            ResourceId::SoftPwm(offset) => write!(f, "software PWM on line {}", offset),
        }
    }
}

/// The kernel or driver refused to hand out a resource.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("failed to open chip {path}: {source}")]
    ChipOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to request line {offset}: {source}")]
    Request {
        offset: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to export PWM channel {channel}: {source}")]
    Export {
        channel: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    /// Out-of-range numeric input. Checked before any hardware access.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{0} is already in use")]
    ResourceInUse(ResourceId),

    #[error(transparent)]
    AcquisitionFailed(#[from] AcquisitionError),

    #[error("PWM channel {channel} did not appear after export. {hint}")]
    ExportTimeout { channel: u32, hint: String },

    #[error("no write access to {path}. {hint}")]
    PermissionDenied { path: PathBuf, hint: String },

    #[error("edge detection is disabled on GPIO line {0}")]
    EdgeDetectionDisabled(u32),

    #[error("{0} has been closed")]
    ClosedHandle(ResourceId),

    /// Background polling needs to be started from within a tokio runtime.
    #[error("no tokio runtime is running")]
    NoRuntime,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
