//! Structured error types for the harness and captured request errors.
//!
//! Two very different things are modelled here and they must not be confused:
//!
//! - [`HarnessError`] is a fault of the harness or of the collaborator under
//!   test (a wait that timed out, a subprocess that died, a protocol
//!   violation). These are returned as `Err` and are meant to fail the test.
//! - [`RequestError`] is an application error delivered through the normal
//!   `failed` callback. It is inert data: the harness stores it and hands it
//!   back for inspection, it is never raised.
//!
//! # Example
//!
//! ```ignore
//! use callback_harness::HarnessError;
//!
//! match callback.block_for_done(Duration::from_secs(5)) {
//!     Ok(()) => {}
//!     Err(HarnessError::DeadlineExceeded { duration }) => {
//!         panic!("request never finished within {:?}", duration);
//!     }
//!     Err(e) => panic!("harness failure: {}", e),
//! }
//!
//! // A network failure is not a harness failure
//! let err = callback.error()?.expect("request should have failed");
//! assert_eq!(err.kind, ErrorKind::ConnectionRefused);
//! ```

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Harness Error
// =============================================================================

/// Structured error type for harness operations.
///
/// Each variant is pattern-matchable so tests can tell a timeout apart from a
/// dead subprocess or a double callback.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A blocking wait exceeded its deadline.
    ///
    /// Deliberately distinct from any captured network error.
    #[error("deadline exceeded after {duration:?}")]
    DeadlineExceeded {
        /// How long we waited.
        duration: Duration,
    },

    /// A result accessor was called before the terminal callback arrived.
    #[error("result is not ready: the operation has not reached a terminal state")]
    NotReady,

    /// The collaborator broke the callback protocol (callback after terminal,
    /// duplicate delivery, out-of-sequence handle call).
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// What was violated.
        message: String,
    },

    /// A monitored subprocess reached end-of-stream unexpectedly.
    #[error("subprocess exited unexpectedly (status: {status:?})")]
    SubprocessExited {
        /// Exit status, if the process could be reaped.
        status: Option<ExitStatus>,
    },

    /// The monitor has already been closed.
    #[error("output monitor is closed")]
    Closed,

    /// The executor no longer accepts tasks.
    #[error("executor has been shut down")]
    ExecutorShutDown,

    /// A fault requested by the test itself (throwing listener, etc.).
    #[error("injected fault")]
    InjectedFault,

    /// The subprocess could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// IO failure while reading subprocess output or writing markers.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid harness configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// What was wrong.
        message: String,
    },
}

impl HarnessError {
    /// Build a protocol violation from anything displayable.
    pub fn violation(message: impl Into<String>) -> Self {
        HarnessError::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Returns true if this is a timeout.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, HarnessError::DeadlineExceeded { .. })
    }
}

/// Result alias used across the harness.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

// =============================================================================
// Captured Request Error
// =============================================================================

/// Category of a captured request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Host name could not be resolved.
    HostnameNotResolved,
    /// Device has no network connectivity.
    InternetDisconnected,
    /// The network changed while the request was in flight.
    NetworkChanged,
    /// The request timed out inside the client.
    TimedOut,
    /// The connection was closed before the response completed.
    ConnectionClosed,
    /// The connection attempt timed out.
    ConnectionTimedOut,
    /// The remote refused the connection.
    ConnectionRefused,
    /// The connection was reset.
    ConnectionReset,
    /// Remote address could not be reached.
    AddressUnreachable,
    /// QUIC protocol failure.
    QuicProtocolFailed,
    /// A user callback raised while handling an event.
    CallbackException,
    /// Any other failure.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::HostnameNotResolved => write!(f, "hostname_not_resolved"),
            ErrorKind::InternetDisconnected => write!(f, "internet_disconnected"),
            ErrorKind::NetworkChanged => write!(f, "network_changed"),
            ErrorKind::TimedOut => write!(f, "timed_out"),
            ErrorKind::ConnectionClosed => write!(f, "connection_closed"),
            ErrorKind::ConnectionTimedOut => write!(f, "connection_timed_out"),
            ErrorKind::ConnectionRefused => write!(f, "connection_refused"),
            ErrorKind::ConnectionReset => write!(f, "connection_reset"),
            ErrorKind::AddressUnreachable => write!(f, "address_unreachable"),
            ErrorKind::QuicProtocolFailed => write!(f, "quic_protocol_failed"),
            ErrorKind::CallbackException => write!(f, "callback_exception"),
            ErrorKind::Other => write!(f, "other"),
        }
    }
}

/// An error delivered through the terminal `failed` callback.
///
/// Stored verbatim by the recording callback; never thrown by the harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable message from the client.
    pub message: String,
    /// Engine-specific error code (e.g. a negative net error), 0 if none.
    #[serde(default)]
    pub internal_error_code: i32,
    /// What caused this error, if known.
    #[serde(default)]
    pub cause: Option<Box<RequestError>>,
}

impl RequestError {
    /// Create an error with no cause.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            internal_error_code: 0,
            cause: None,
        }
    }

    /// Attach an engine error code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.internal_error_code = code;
        self
    }

    /// Attach a cause.
    pub fn caused_by(mut self, cause: RequestError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The error a client reports when a user callback raised.
    pub fn callback_exception(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            ErrorKind::CallbackException,
            "Exception received from UrlRequest.Callback",
        )
        .caused_by(Self::new(ErrorKind::Other, message))
    }

    /// Iterate this error and its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &RequestError> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)?;
        if self.internal_error_code != 0 {
            write!(f, " [code {}]", self.internal_error_code)?;
        }
        Ok(())
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}
