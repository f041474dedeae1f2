//! Error types for the timeslice transport.

use std::fmt;
use std::io;

/// Fatal error conditions of an input channel sender.
///
/// Transient conditions (producer underrun, peer backpressure) are
/// expressed as predicate returns in the send path and never appear here.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying fabric layer.
    Io(io::Error),
    /// Initial address resolution for a peer failed.
    FabricUnreachable(String),
    /// A peer rejected the connection twice.
    PeerUnreachable(u16),
    /// A work request completed with a non-success status.
    Fabric { connection: u16, wr_id: u64 },
    /// Completion for an unknown work request id.
    UnknownCompletion(u64),
    /// A cursor relation was violated.
    InvariantBreach(&'static str),
    /// A peer was declared dead by the failure oracle.
    PeerFailure(u16),
    /// Cooperative teardown initiated by a peer or the operator.
    Abort,
    /// A wire message could not be decoded.
    InvalidMessage { required: usize, available: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::FabricUnreachable(addr) => {
                write!(f, "address resolution failed for {}", addr)
            }
            Error::PeerUnreachable(cn) => {
                write!(f, "connection {} rejected twice", cn)
            }
            Error::Fabric { connection, wr_id } => {
                write!(
                    f,
                    "work request {:#x} on connection {} completed with error",
                    wr_id, connection
                )
            }
            Error::UnknownCompletion(wr_id) => {
                write!(f, "completion for unknown wr_id {:#x}", wr_id)
            }
            Error::InvariantBreach(what) => write!(f, "invariant breach: {}", what),
            Error::PeerFailure(cn) => write!(f, "peer failure on connection {}", cn),
            Error::Abort => write!(f, "transfer aborted"),
            Error::InvalidMessage { required, available } => {
                write!(
                    f,
                    "message too short: required {} bytes, got {}",
                    required, available
                )
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
