//! Error taxonomy of an attach exchange.
//!
//! Every local failure is an [`AttachError`]. A non-zero result code reported by the target is
//! *not* an error: it is returned as data by the attach operations.

use std::{fmt, io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Why a connection to a listener socket could not be established.
#[derive(Debug, Error)]
pub enum ConnectFailure {
    /// There is no socket at the listener path.
    #[error("no listener socket")]
    Missing,
    /// The socket exists but did not accept the connection in time.
    #[error("listener did not accept within {0:?}")]
    TimedOut(Duration),
    /// The socket exists but connecting failed.
    #[error(transparent)]
    Io(io::Error),
}

/// Why a response stream could not be interpreted.
#[derive(Debug)]
pub enum MalformedReason {
    /// The listener closed the connection without sending a single byte.
    Empty,
    /// The terminal line of the response is not a decimal result code.
    InvalidResultLine(String),
    /// The listener reset the connection before a result line was read.
    ConnectionReset,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::Empty => f.write_str("connection closed without any response"),
            MalformedReason::InvalidResultLine(line) => {
                write!(f, "terminal line `{line}` is not a result code")
            }
            MalformedReason::ConnectionReset => {
                f.write_str("connection reset before a result code was received")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration value `{value}` for {key}")]
    InvalidConfig { key: &'static str, value: String },

    #[error("process {pid} not found")]
    ProcessNotFound { pid: u32 },

    #[error("permission denied accessing {} for process {pid}", path.display())]
    PermissionDenied {
        pid: u32,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to resolve the filesystem view of process {pid}: {reason}")]
    NamespaceResolutionFailed { pid: u32, reason: String },

    #[cfg(unix)]
    #[error("unable to signal process {pid}, it may have exited")]
    SignalDeliveryFailed {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error(
        "process {pid} did not open its attach listener {} within {waited:?}",
        socket.display()
    )]
    ListenerTimeout {
        pid: u32,
        socket: PathBuf,
        waited: Duration,
    },

    #[error("unable to connect to {}: {reason}", path.display())]
    ConnectFailed {
        path: PathBuf,
        #[source]
        reason: ConnectFailure,
    },

    #[error("malformed response: {reason}")]
    MalformedResponse { reason: MalformedReason },

    #[error("{context}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl AttachError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| AttachError::Io { context, source }
    }

    pub(crate) fn malformed(reason: MalformedReason) -> Self {
        AttachError::MalformedResponse { reason }
    }

    /// Negative code standing for this local failure, for callers which can only relay an
    /// integer.
    ///
    /// Target result codes are whatever the target sends, so binding layers should keep the
    /// two apart whenever they can.
    pub fn sentinel_code(&self) -> i32 {
        match self {
            AttachError::InvalidArgument(_) => -1,
            AttachError::InvalidConfig { .. } => -2,
            AttachError::ProcessNotFound { .. } => -3,
            AttachError::PermissionDenied { .. } => -4,
            AttachError::NamespaceResolutionFailed { .. } => -5,
            #[cfg(unix)]
            AttachError::SignalDeliveryFailed { .. } => -6,
            AttachError::ListenerTimeout { .. } => -7,
            AttachError::ConnectFailed { .. } => -8,
            AttachError::MalformedResponse { .. } => -9,
            AttachError::Io { .. } => -10,
        }
    }
}
