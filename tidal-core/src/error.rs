//! Transport Error Taxonomy
//!
//! Every synchronous rejection returned to a caller, and every fault reported
//! through an endpoint's exception notification, is a [`TransportError`].
//!
//! - Setup faults and protocol-layer misuse come back as `Err` from the call
//!   that caused them, before any state changes.
//! - OS-level faults never reach the caller directly. The endpoint tears
//!   itself down and hands the error to its event sink.

use std::fmt;
use std::io;

use thiserror::Error;

/// The socket operation an OS-level fault originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Bind,
    Listen,
    Accept,
    Connect,
    Send,
    Receive,
    Configure,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Bind => "bind",
            Operation::Listen => "listen",
            Operation::Accept => "accept",
            Operation::Connect => "connect",
            Operation::Send => "send",
            Operation::Receive => "receive",
            Operation::Configure => "configure",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by connections, listeners and the buffer pool.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An OS-level socket failure.
    #[error("tcp {op} failed: {source}")]
    Io {
        op: Operation,
        #[source]
        source: io::Error,
    },

    /// The connect attempt did not complete within the configured timeout.
    #[error("tcp connect timed out after {seconds}s")]
    ConnectTimeout { seconds: u32 },

    /// Endpoints capture a tokio runtime handle when they are created.
    #[error("no tokio runtime is available on the calling thread")]
    NoRuntime,

    /// The operation is not valid for a connection built from an accepted socket.
    #[error("operation `{0}` is not allowed on an inherited connection")]
    Inherited(&'static str),

    /// `initialize` is only meaningful for inherited connections.
    #[error("connection was not created from an accepted socket")]
    NotInherited,

    #[error("connection is not established")]
    NotConnected,

    #[error("connection has been disposed")]
    Disposed,

    /// The protocol layer has not marked the connection as authenticated yet.
    #[error("connection is not authenticated")]
    NotAuthenticated,

    /// A previous send lease has not completed yet.
    #[error("a send is already outstanding on this connection")]
    SendInProgress,

    /// The send lease was issued by a different connection.
    #[error("send lease belongs to another connection")]
    ForeignSendLease,

    #[error("payload of {len} bytes exceeds the {capacity}-byte send window")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("invalid buffer pool configuration: {0}")]
    InvalidPoolConfig(&'static str),
}

impl TransportError {
    pub(crate) fn io(op: Operation, source: io::Error) -> Self {
        TransportError::Io { op, source }
    }

    /// The failed operation, for OS-level faults.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            TransportError::Io { op, .. } => Some(*op),
            TransportError::ConnectTimeout { .. } => Some(Operation::Connect),
            _ => None,
        }
    }

    /// The underlying `io::ErrorKind`, for OS-level faults.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Io { source, .. } => Some(source.kind()),
            TransportError::ConnectTimeout { .. } => Some(io::ErrorKind::TimedOut),
            _ => None,
        }
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
