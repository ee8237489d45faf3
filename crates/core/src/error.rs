//! Error taxonomy shared by every depot crate
//!
//! Errors are classified by [`ErrorKind`] rather than by type so callers can
//! tell "the operation failed" apart from "the operation was asked to stop".

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used throughout depot
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing file, block, chunk or path
    NotFound,
    PermissionDenied,
    AlreadyExists,
    /// Malformed index, zero-sized budgets, out of range arguments
    InvalidArgument,
    OutOfMemory,
    /// Generic read/write/transport failure
    Io,
    /// Operation unavailable on this backend
    NotSupported,
    /// Operation aborted through a cancellation token
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Io => "io error",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Error type for depot operations
///
/// `Clone` so a single failure can be handed to every joiner of a shared
/// block fetch.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("io error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("operation cancelled")]
    Cancelled,

    /// Internal consistency check failed
    #[error("assertion failed: {expression} at {file}:{line}")]
    Invariant {
        expression: &'static str,
        file: &'static str,
        line: u32,
    },
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::InvalidArgument(_) | Error::Invariant { .. } => ErrorKind::InvalidArgument,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::Io { .. } => ErrorKind::Io,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Generic I/O failure that did not originate from `std::io`
    pub fn io(context: impl Into<String>) -> Self {
        let context = context.into();
        Error::Io {
            source: Arc::new(io::Error::new(io::ErrorKind::Other, context.clone())),
            context,
        }
    }

    /// Map an `std::io::Error` onto the taxonomy, keeping `context` (usually a path)
    ///
    /// An error produced by [`into_io`](Self::into_io) comes back unchanged.
    pub fn from_io(err: io::Error, context: impl Into<String>) -> Self {
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<Error>()) {
            return inner.clone();
        }
        let context = context.into();
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(context),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(context),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(context),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                Error::InvalidArgument(format!("{}: {}", context, err))
            }
            io::ErrorKind::OutOfMemory => Error::OutOfMemory(context),
            io::ErrorKind::Unsupported => Error::NotSupported(context),
            _ => Error::Io {
                context,
                source: Arc::new(err),
            },
        }
    }

    /// Wrap this error for an `std::io` interface such as `Read`
    pub fn into_io(self) -> io::Error {
        let kind = match self.kind() {
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            ErrorKind::OutOfMemory => io::ErrorKind::OutOfMemory,
            ErrorKind::NotSupported => io::ErrorKind::Unsupported,
            // Interrupted would be retried by readers
            ErrorKind::Io | ErrorKind::Cancelled => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// True for failures worth retrying in a tier that owns a transient resource
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err, "io")
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::from(io::Error::from(errno))
    }
}

/// Return `Error::Invariant` when `cond` does not hold
#[macro_export]
macro_rules! ensure_invariant {
    ($cond:expr) => {
        if !($cond) {
            return Err($crate::Error::Invariant {
                expression: stringify!($cond),
                file: file!(),
                line: line!(),
            });
        }
    };
}
