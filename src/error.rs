//! Crate-wide error type.
//!
//! Every fallible operation in `flux_security` returns a symbolic
//! [`ErrorKind`] plus a human-readable message rather than leaking raw
//! `errno`/`io::Error` values past the layer that first observed them.

use std::fmt;

/// Symbolic classification of an [`Error`], independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    TooBig,
    TimedOut,
    NoMemory,
    IoError,
    Exists,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::TooBig => "too big",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::NoMemory => "no memory",
            ErrorKind::IoError => "I/O error",
            ErrorKind::Exists => "exists",
        };
        f.write_str(s)
    }
}

/// A typed error carrying a symbolic [`ErrorKind`] and a message.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::AlreadyExists, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::PermissionDenied, message)
    }

    pub fn too_big(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::TooBig, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::TimedOut, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            _ => ErrorKind::IoError,
        };
        let message = e.to_string();
        Error::with_source(kind, message, e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        let kind = match e {
            nix::Error::EPERM | nix::Error::EACCES => ErrorKind::PermissionDenied,
            nix::Error::ENOENT | nix::Error::ESRCH => ErrorKind::NotFound,
            nix::Error::EEXIST => ErrorKind::AlreadyExists,
            nix::Error::ENOMEM => ErrorKind::NoMemory,
            nix::Error::ETIMEDOUT => ErrorKind::TimedOut,
            _ => ErrorKind::IoError,
        };
        Error::with_source(kind, e.to_string(), std::io::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
