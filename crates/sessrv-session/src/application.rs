//! Application interface consumed by the session loop (§6).

use std::time::Instant;

use sessrv_error::Result;
use sessrv_request::{PrioritySlot, Request};

use crate::Session;

/// What a phase callback reports back to the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The phase is finished.
    Done,
    /// The phase needs another slice (suspend, don't mark done).
    More,
}

/// Why `request_input` was invoked (§4.4 steps 4f/4g).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputReason {
    /// Normal call: `session.connection()` has unparsed bytes ready.
    Normal,
    /// Null-buffer notification after a READ error drained the parse
    /// queue; the callback should just finish the phase.
    ReadError,
}

/// Why `request_output` was invoked (§4.4 steps 4e/4h).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputReason {
    /// Normal call: output-buffer capacity is available.
    Normal,
    /// Null-buffer notification after a WRITE error.
    WriteError,
}

/// The object applications implement on top of the core (§6
/// "Application interface"). A dynamic-dispatch trait, the way
/// `ksvc_core::io_backend::IoBackend` and `BufferProvider` are
/// implemented by swappable backends — here the "backend" is
/// whatever protocol sits on top of the scheduler (an echo service,
/// an HTTP responder, …).
pub trait Application {
    /// Called once, right after the transport accepted or connected
    /// the session.
    fn session_initialize(&mut self, session: &Session);

    /// Called once, as the session is about to be destroyed.
    fn session_shutdown(&mut self, session: &Session) {
        let _ = session;
    }

    /// Called once per request, right after it's created.
    fn request_initialize(&mut self, session: &Session, req: &Request) {
        let (_, _) = (session, req);
    }

    /// Called once a request's refcount has dropped to zero.
    fn request_finish(&mut self, session: &Session, req: &Request) {
        let (_, _) = (session, req);
    }

    /// Drive the INPUT phase. Parses via
    /// `session.connection_mut().input_lookahead()`/`input_commit()`.
    fn request_input(
        &mut self,
        session: &Session,
        req: &Request,
        reason: InputReason,
        deadline: Instant,
    ) -> Result<Progress>;

    /// Drive the OUTPUT phase via
    /// `session.connection_mut().output_lookahead()`/`output_commit()`.
    fn request_output(
        &mut self,
        session: &Session,
        req: &Request,
        reason: OutputReason,
        deadline: Instant,
        priority: &mut PrioritySlot,
    ) -> Result<Progress>;

    /// Drive the RUN phase. `priority` is the scheduler's single
    /// priority slot (§4.3): a callback may `acquire`/`release` it, or
    /// check `chain_contains` before creating a dependent request with
    /// `Request::new_outgoing` + `depend_on`.
    fn request_run(
        &mut self,
        session: &Session,
        req: &Request,
        deadline: Instant,
        priority: &mut PrioritySlot,
    ) -> Result<Progress>;

    /// Optional per-second sleep tick (§4.5), used for request-level
    /// timeouts.
    fn request_sleep(&mut self, session: &Session, req: &Request, now_micros: u64) {
        let (_, _, _) = (session, req, now_micros);
    }

    /// Called once, when a session with no connected transport wants
    /// an interactive prompt drawn (TTY transports only).
    fn session_interactive_prompt(&mut self, session: &Session) {
        let _ = session;
    }
}
