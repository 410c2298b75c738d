//! Transport interface consumed by the session loop (§6, §4.4).
//!
//! A transport is bound to exactly one session and never touched
//! directly by the core beyond these three methods — the session
//! never reaches for a file descriptor itself, the way
//! `ksvc_core::io_backend::IoBackend` keeps syscall plumbing behind
//! `submit`/`flush`/`poll_completions` rather than handing raw fds to
//! callers.

use std::time::Instant;

use crate::Session;

/// **Contract:** `run` must not block past `deadline`; `listen` must
/// subscribe to exactly the events implied by `session.want()` and
/// the connection's capability flags — over-subscribing wastes
/// wakeups, under-subscribing stalls the session.
pub trait Transport {
    /// Drain the network side: read what's available, write what's
    /// pending, surface errors onto the connection's error mask.
    /// Returns whether anything changed.
    fn run(&mut self, session: &Session, deadline: Instant) -> bool;

    /// Subscribe to readable/writable/timeout events matching
    /// `session.want()` and the connection capability flags.
    fn listen(&mut self, session: &Session);

    /// Register (or clear, with `None`) a per-session timeout.
    fn set_timeout(&mut self, _timeout: Option<Instant>) {}
}
