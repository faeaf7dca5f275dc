//! Error taxonomy for HTTP/2 connections and streams
//!
//! Failures are classified by origin so callers can tell "the network
//! misbehaved" apart from "your handler failed":
//!
//! - [`ConnectError`]: no stream could be created (transport gone, connection
//!   already failed or shutting down).
//! - [`HandshakeError`]: preface/settings negotiation failed.
//! - [`ConnectionError`]: the established connection failed; delivered to every
//!   outstanding stream, so it is `Clone`.
//! - [`StreamError`] / [`ProtocolError`]: a single exchange failed; the
//!   connection stays usable.
//! - `Service`, `NewService` and `Body`: user code failed.

use h2::Reason;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by user-supplied services, factories and bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error surfaced by clients, servers and bodies.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("error occurred during HTTP/2 handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("{0}")]
    Stream(#[from] StreamError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("error occurred while obtaining service: {0}")]
    NewService(#[source] BoxError),

    #[error("error returned by service: {0}")]
    Service(#[source] BoxError),

    #[error("error produced by body: {0}")]
    Body(#[source] BoxError),

    #[error("error occurred while attempting to spawn a task")]
    Execute(#[from] ExecuteError),
}

/// No stream could be allocated.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection is shutting down")]
    Draining,

    #[error("connection is closed")]
    Closed,

    #[error("connection has failed: {0}")]
    Failed(ConnectionError),
}

/// Preface or settings negotiation failed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("transport I/O failed during preface exchange: {0}")]
    Io(#[source] io::Error),

    #[error("peer sent a malformed or incompatible preface: {0}")]
    MalformedPreface(Reason),

    #[error("incompatible settings: {0}")]
    IncompatibleSettings(String),

    #[error("settings negotiation timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer closed the connection before negotiation completed")]
    PeerClosed,
}

/// An established connection failed or closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("transport I/O error ({kind:?}): {message}")]
    Io {
        kind: io::ErrorKind,
        message: String, // String instead of io::Error for Clone
    },

    #[error("connection terminated by GOAWAY ({reason}, remote: {remote})")]
    GoAway { reason: Reason, remote: bool },

    #[error("protocol violation: {0}")]
    Protocol(Reason),

    #[error("keep-alive ping timed out")]
    KeepAliveTimeout,

    #[error("peer closed the connection with {in_flight} stream(s) in flight")]
    PeerClosed { in_flight: usize },

    #[error("connection closed")]
    Closed,
}

/// A single stream was reset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream {stream_id} reset by {} ({reason})", initiator(.remote))]
pub struct StreamError {
    pub stream_id: u32,
    pub reason: Reason,
    pub remote: bool,
}

fn initiator(remote: &bool) -> &'static str {
    if *remote { "peer" } else { "local endpoint" }
}

/// A single exchange violated HTTP/2 semantics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed message on stream {stream_id}: {reason}")]
    Malformed { stream_id: u32, reason: Reason },

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// The executor refused a task.
#[derive(Debug, Clone, Default, Error)]
#[error("executor rejected task")]
pub struct ExecuteError;

/// Marks a factory error as non-recoverable for the whole connection.
///
/// A factory error that downcasts to `Fatal` aborts the connection instead of
/// resetting only the stream being dispatched.
#[derive(Debug, Error)]
#[error("fatal: {0}")]
pub struct Fatal(#[source] pub BoxError);

impl Fatal {
    pub fn new(err: impl Into<BoxError>) -> Self {
        Fatal(err.into())
    }

    /// Check whether a boxed error carries the fatal marker
    pub fn is_fatal(err: &BoxError) -> bool {
        err.downcast_ref::<Fatal>().is_some()
    }
}

/// Coarse origin of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connect,
    Handshake,
    Protocol,
    Service,
}

// ===== impl Error =====

impl Error {
    /// Classify an h2 error raised while a specific stream was active.
    pub(crate) fn from_stream(err: h2::Error, stream_id: u32) -> Self {
        if err.is_reset() {
            let reason = err.reason().unwrap_or(Reason::INTERNAL_ERROR);
            if !err.is_remote() && reason == Reason::PROTOCOL_ERROR {
                // h2 resets streams carrying malformed headers itself
                return Error::Protocol(ProtocolError::Malformed { stream_id, reason });
            }
            return Error::Stream(StreamError {
                stream_id,
                reason,
                remote: err.is_remote(),
            });
        }
        if err.is_go_away() || err.is_io() {
            return Error::Connection(ConnectionError::from(err));
        }
        match err.reason() {
            Some(reason) => Error::Protocol(ProtocolError::Malformed { stream_id, reason }),
            None => Error::Protocol(ProtocolError::InvalidMessage(err.to_string())),
        }
    }

    /// Classify an h2 error raised before a stream was allocated.
    pub(crate) fn from_open(err: h2::Error) -> Self {
        if err.is_io() || err.is_go_away() {
            Error::Connect(ConnectError::Failed(ConnectionError::from(err)))
        } else {
            Error::Protocol(ProtocolError::InvalidMessage(err.to_string()))
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connect(_) | Error::Execute(_) => ErrorKind::Connect,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Connection(e) if e.is_transport() => ErrorKind::Connect,
            Error::Connection(_) | Error::Stream(_) | Error::Protocol(_) => ErrorKind::Protocol,
            Error::NewService(_) | Error::Service(_) | Error::Body(_) => ErrorKind::Service,
        }
    }

    /// Only the affected stream failed; the connection remains usable.
    pub fn is_stream_scoped(&self) -> bool {
        matches!(
            self,
            Error::Stream(_) | Error::Protocol(ProtocolError::Malformed { .. }) | Error::Body(_)
        )
    }

    /// The whole connection failed.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Connect(_) | Error::Handshake(_))
    }

    /// Whether a caller could reasonably retry on a fresh stream or
    /// connection. The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connect(ConnectError::Failed(e)) => {
                e.is_transport() || e.reason() == Some(Reason::NO_ERROR)
            }
            Error::Connect(_) => true,
            Error::Handshake(HandshakeError::Io(_))
            | Error::Handshake(HandshakeError::Timeout(_))
            | Error::Handshake(HandshakeError::PeerClosed) => true,
            Error::Connection(e) => e.is_transport() || e.reason() == Some(Reason::NO_ERROR),
            Error::Stream(e) => e.reason == Reason::REFUSED_STREAM,
            _ => false,
        }
    }

    /// HTTP/2 reason code associated with this error, if any
    pub fn reason(&self) -> Option<Reason> {
        match self {
            Error::Connect(ConnectError::Failed(e)) | Error::Connection(e) => e.reason(),
            Error::Handshake(HandshakeError::MalformedPreface(reason)) => Some(*reason),
            Error::Stream(e) => Some(e.reason),
            Error::Protocol(ProtocolError::Malformed { reason, .. }) => Some(*reason),
            _ => None,
        }
    }
}

// ===== impl ConnectionError =====

impl ConnectionError {
    /// Transient transport-level failure rather than a protocol violation.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ConnectionError::Io { .. }
                | ConnectionError::KeepAliveTimeout
                | ConnectionError::PeerClosed { .. }
                | ConnectionError::Closed
        )
    }

    pub fn reason(&self) -> Option<Reason> {
        match self {
            ConnectionError::GoAway { reason, .. } | ConnectionError::Protocol(reason) => {
                Some(*reason)
            }
            _ => None,
        }
    }
}

impl From<h2::Error> for ConnectionError {
    fn from(err: h2::Error) -> Self {
        if let Some(io) = err.get_io() {
            return ConnectionError::Io {
                kind: io.kind(),
                message: io.to_string(),
            };
        }
        let reason = err.reason().unwrap_or(Reason::INTERNAL_ERROR);
        if err.is_go_away() {
            ConnectionError::GoAway {
                reason,
                remote: err.is_remote(),
            }
        } else {
            ConnectionError::Protocol(reason)
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

// ===== impl HandshakeError =====

impl From<h2::Error> for HandshakeError {
    fn from(err: h2::Error) -> Self {
        if let Some(kind) = err.get_io().map(io::Error::kind) {
            return match kind {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted => HandshakeError::PeerClosed,
                _ => match err.into_io() {
                    Some(io) => HandshakeError::Io(io),
                    None => HandshakeError::PeerClosed,
                },
            };
        }
        HandshakeError::MalformedPreface(err.reason().unwrap_or(Reason::PROTOCOL_ERROR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_is_stream_scoped() {
        let err = Error::Stream(StreamError {
            stream_id: 3,
            reason: Reason::CANCEL,
            remote: true,
        });

        assert!(err.is_stream_scoped());
        assert!(!err.is_connection_scoped());
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.reason(), Some(Reason::CANCEL));
        assert!(err.to_string().contains("stream 3 reset by peer"));
    }

    #[test]
    fn test_connection_error_classification() {
        let io = ConnectionError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_transport());
        assert_eq!(Error::Connection(io.clone()).kind(), ErrorKind::Connect);
        assert!(Error::Connection(io).is_retryable());

        let goaway = ConnectionError::GoAway {
            reason: Reason::PROTOCOL_ERROR,
            remote: true,
        };
        let err = Error::Connection(goaway);
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.is_connection_scoped());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_refused_stream_is_retryable() {
        let err = Error::Stream(StreamError {
            stream_id: 7,
            reason: Reason::REFUSED_STREAM,
            remote: true,
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_refused_after_graceful_goaway_is_retryable() {
        let graceful = ConnectionError::GoAway {
            reason: Reason::NO_ERROR,
            remote: true,
        };
        assert!(Error::Connect(ConnectError::Failed(graceful.clone())).is_retryable());
        assert!(Error::Connection(graceful).is_retryable());

        let violation = ConnectionError::GoAway {
            reason: Reason::PROTOCOL_ERROR,
            remote: true,
        };
        assert!(!Error::Connect(ConnectError::Failed(violation)).is_retryable());
    }

    #[test]
    fn test_service_errors_are_distinct() {
        let err = Error::Service("handler exploded".into());
        assert_eq!(err.kind(), ErrorKind::Service);
        assert!(!err.is_connection_scoped());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_fatal_marker() {
        let fatal: BoxError = Box::new(Fatal::new("bad config"));
        assert!(Fatal::is_fatal(&fatal));

        let plain: BoxError = "transient".into();
        assert!(!Fatal::is_fatal(&plain));
    }

    #[test]
    fn test_handshake_error_from_h2_reason() {
        let err = HandshakeError::from(h2::Error::from(Reason::PROTOCOL_ERROR));
        assert!(matches!(err, HandshakeError::MalformedPreface(Reason::PROTOCOL_ERROR)));
    }
}
