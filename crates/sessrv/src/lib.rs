//! # sessrv — event-driven session scheduler with pooled buffers
//!
//! Single-threaded, cooperative request/session core: a fixed-memory
//! [`BufferPool`] with a three-tier allocation policy feeds
//! [`BufferedConnection`]s, each driving a [`Session`] that
//! time-slices a pipeline of [`Request`]s across INPUT/RUN/OUTPUT
//! phases. One [`Scheduler`] owns the pool, the session list, and the
//! priority/buffer-wait protocols shared across them.
//!
//! This crate is a thin re-export of the core crates plus one
//! convenience type, [`Worker`], bundling `Scheduler::new` with a
//! drive loop — the way `gvthread::Runtime` wraps
//! `gvthread_runtime::Scheduler` with `start`/`block_on` for callers
//! who don't want to write their own event loop.

pub use sessrv_buffer::{AllocTier, Buffer, BufferPool, BufferQueue, FillTier, HookProgress, PoolStats, PreHook, MIN_BUFFER_SIZE};
pub use sessrv_config::SchedulerConfig;
pub use sessrv_conn::{BufferedConnection, Capabilities, ErrorMask, RawIo};
pub use sessrv_error::{Error, Result};
pub use sessrv_log::{init as init_logging, log_level, set_log_level, LogLevel};
pub use sessrv_request::{BufferWaitQueue, Phase, PhaseSet, PrioritySlot, Request, RequestId};
pub use sessrv_scheduler::Scheduler;
pub use sessrv_session::{Application, InputReason, OutputReason, Progress, Role, Session, SessionId, Transport, WantSet};
pub use sessrv_supervise::{write_epitaph, Pidfile};

pub use sessrv_log::{slog_debug, slog_error, slog_info, slog_trace, slog_warn};

use std::time::Duration;

/// A scheduler bundled with a drive loop, for callers who want
/// `Worker::new(cfg).run_forever(app)` instead of writing their own
/// `Scheduler::run_once` pump.
pub struct Worker {
    scheduler: Scheduler,
}

impl Worker {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Worker {
            scheduler: Scheduler::new(cfg),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn create_session(&self, role: Role, transport: Box<dyn Transport>) -> Session {
        self.scheduler.create_session(role, transport)
    }

    /// Pump `run_once` until the session list is empty, sleeping
    /// `idle_sleep` between passes whenever nothing is `changed`.
    /// Intended for simple demo/test transports that don't drive their
    /// own event loop; production transports call `Scheduler::run_once`
    /// directly from their own `poll`.
    pub fn run_forever(&self, app: &mut dyn Application, idle_sleep: Duration) {
        loop {
            self.scheduler.run_once(app);
            if self.scheduler.session_count() == 0 {
                return;
            }
            std::thread::sleep(idle_sleep);
        }
    }
}

/// Convenience re-exports for `use sessrv::prelude::*;`.
pub mod prelude {
    pub use crate::{
        Application, Buffer, BufferPool, BufferedConnection, Error, InputReason, OutputReason,
        Progress, Request, Result, Role, Scheduler, Session, SchedulerConfig, Transport, Worker,
    };
}
