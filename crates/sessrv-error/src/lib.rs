//! Sentinel error surface for the sessrv core.
//!
//! The scheduler, buffer pool, connection, request, and session layers
//! all return [`Result`]. Most of the variants are the well-known
//! sentinel codes a request/session API hands back to the application
//! (never an `errno`): `NO`, `MORE`, `ALREADY`, `ADDRESS`,
//! `NotSupported`, `Syntax`, `Semantics`. System errors are wrapped in
//! `Os` rather than re-encoded.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// No match / no data yet.
    No,
    /// Operation incomplete; retry.
    More,
    /// The requested change is already in effect; a no-op.
    Already,
    /// Address parse failure.
    Address,
    /// Operation not supported by this build/configuration.
    NotSupported,
    /// Malformed input at the syntax level.
    Syntax,
    /// Well-formed input that is semantically invalid.
    Semantics,
    /// A buffer could not be granted under the current pool tier.
    /// Callers turn this into `buffer_wait`, not a surfaced error.
    OutOfMemoryByPolicy,
    /// Propagated operating-system error.
    Os(io::Error),
    /// Programmer error: fatal invariant violation (double-free,
    /// negative refcount, illegal phase transition). Carries a
    /// static description rather than a formatted string so
    /// construction never allocates on the path that is about to
    /// terminate the worker.
    Internal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::No => write!(f, "no match"),
            Self::More => write!(f, "incomplete, retry"),
            Self::Already => write!(f, "already in effect"),
            Self::Address => write!(f, "address parse failure"),
            Self::NotSupported => write!(f, "not supported"),
            Self::Syntax => write!(f, "syntax error"),
            Self::Semantics => write!(f, "semantic error"),
            Self::OutOfMemoryByPolicy => write!(f, "no buffer available under current pool tier"),
            Self::Os(e) => write!(f, "os error: {e}"),
            Self::Internal(msg) => write!(f, "internal invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Os(e)
    }
}

impl Error {
    /// True for `WouldBlock`/`Interrupted`-class errors that are not
    /// actually errors to the core — EAGAIN/EINPROGRESS in spec terms.
    pub fn is_retryable_os(&self) -> bool {
        matches!(
            self,
            Self::Os(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
