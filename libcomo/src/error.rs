//! Error kinds and handler outcomes shared across the processes.

use std::io;
use std::net;

pub type ComoResult<T> = Result<T, ComoError>;

/// Failure classes surfaced by the core. Every subsystem folds its own
/// failures into one of these; the event loops decide what each one means
/// for the peer or the process.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ComoError {
    /// Operation cannot make progress right now; retry on the next tick.
    Again,
    /// Peer closed its end; the peer is torn down, the process keeps running.
    PeerGone,
    /// Framing error, bad magic, truncated record, invalid value. Ends the
    /// affected operation only.
    Malformed(&'static str),
    /// Allocation failure or table full; handled by the resource scheduler.
    Overload,
    /// File or socket failure, surfaced to the user-visible channel.
    Io(io::ErrorKind),
    /// A module was asked to act in a role its process does not hold.
    RoleMismatch,
    /// Unrecoverable invariant violation; the detecting process aborts.
    Fatal(&'static str),
}

/// Verdict returned by an IPC handler, interpreted by the event loop.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum Outcome {
    /// Message consumed, keep going.
    Ok,
    /// Peer signalled end of stream.
    Eof,
    /// Handler failed; the loop logs and tears the peer down.
    Err,
    /// Handler asks for an orderly close of this peer.
    Close,
    /// Not enough data yet; retry once more arrives.
    Again,
}

impl ComoError {
    /// True for errors that must terminate the process, not just the peer.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ComoError::Fatal(_))
    }
}

impl From<io::Error> for ComoError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => ComoError::Again,
            io::ErrorKind::UnexpectedEof => ComoError::PeerGone,
            kind => ComoError::Io(kind),
        }
    }
}

impl From<net::AddrParseError> for ComoError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        ComoError::Malformed("address parse")
    }
}

pub trait ErrorUtils {
    /// True when the result is a real failure, i.e. anything but success or
    /// a retryable `Again`.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for ComoResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(ComoError::Again) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wouldblock_folds_to_again() {
        let err: ComoError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, ComoError::Again);
        assert!(!Err::<(), _>(err).has_failed());
    }

    #[test]
    fn test_io_is_failure() {
        let err: ComoError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(err, ComoError::Io(io::ErrorKind::PermissionDenied));
        assert!(Err::<(), _>(err).has_failed());
    }

    #[test]
    fn test_fatal() {
        assert!(ComoError::Fatal("pool corruption").is_fatal());
        assert!(!ComoError::Overload.is_fatal());
    }
}
