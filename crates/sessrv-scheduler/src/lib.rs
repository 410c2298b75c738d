//! Global scheduler state and the post-dispatch pass (§3
//! "Scheduler-global state", §4.5).
//!
//! Grounded on `ksvc_executor::dispatcher_loop`'s
//! drain-completions → route → flush → re-register → idle-sleep
//! shape; here there's one session list instead of a completion
//! ring, and "route" is "run the session processing loop". Per the
//! "Global singletons" design note, the whole of this state lives
//! behind one explicit [`Scheduler`] handle rather than process
//! globals.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sessrv_buffer::BufferPool;
use sessrv_config::SchedulerConfig;
use sessrv_log::slog_info;
use sessrv_request::{BufferWaitQueue, PrioritySlot};
use sessrv_session::{Application, Role, Session, Transport};

struct SchedulerInner {
    sessions: Vec<Session>,
    pool: BufferPool,
    priority: PrioritySlot,
    wait_queue: BufferWaitQueue,
    cfg: SchedulerConfig,
    last_sleep_tick: Instant,
}

/// Per-worker-process scheduler state: the session list, the
/// buffer-wait FIFO, the priority slot, and the pool they all share.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        let pool = BufferPool::new(
            cfg.buffer_size,
            cfg.buffer_pool_min_level,
            cfg.buffer_pool_max_level,
        );

        let inner = Rc::new(RefCell::new(SchedulerInner {
            sessions: Vec::new(),
            pool: pool.clone(),
            priority: PrioritySlot::new(),
            wait_queue: BufferWaitQueue::new(),
            cfg,
            last_sleep_tick: Instant::now(),
        }));

        // The pool has no notion of sessions or requests; its wakeup
        // hook only knows "some buffers just came back". We drain
        // the whole buffer-wait queue and mark every session changed
        // rather than track a request -> session reverse map, which
        // the core's scheduling loop would otherwise need nowhere
        // else (documented in DESIGN.md as a deliberate simplification).
        let weak = Rc::downgrade(&inner);
        pool.set_wakeup_hook(Rc::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            let mut inner = inner.borrow_mut();
            if inner.wait_queue.is_empty() {
                return;
            }
            inner.wait_queue.wakeup_all();
            for session in inner.sessions.iter() {
                session.schedule();
            }
        }));

        Scheduler { inner }
    }

    pub fn pool(&self) -> BufferPool {
        self.inner.borrow().pool.clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.borrow().sessions.len()
    }

    /// `create(transport_binding, role, ...)`: allocate the
    /// connection, assign a monotonic ID, enqueue in the global
    /// session list, and mark it `changed` so the first post-dispatch
    /// pass picks it up (§4.4 `create`). Callers invoke
    /// `app.session_initialize` themselves once they hold the handle,
    /// since application state often needs to be attached first.
    pub fn create_session(&self, role: Role, transport: Box<dyn Transport>) -> Session {
        let pool = self.pool();
        let cfg = self.inner.borrow().cfg.clone();
        let session = Session::new(role, pool, transport, &cfg);
        self.inner.borrow_mut().sessions.push(session.clone());
        session
    }

    /// One event-loop post-dispatch pass (§4.5): run the session
    /// processing loop for every `changed` session, then re-register
    /// every session's transport interest, then self-notify any
    /// session that still has `processing = true`.
    pub fn run_once(&self, app: &mut dyn Application) {
        let sessions = self.inner.borrow().sessions.clone();

        for session in &sessions {
            if !session.changed() {
                continue;
            }
            let held_before = self.inner.borrow().priority.holder().is_some();
            {
                let mut inner = self.inner.borrow_mut();
                session.process(app, &mut inner.priority, &mut inner.wait_queue, &inner.cfg);
            }
            let held_after = self.inner.borrow().priority.holder().is_some();
            // A `priority_release` inside the callback we just ran
            // can unblock requests the dependency-chain rescue
            // (§4.3) had been holding back; wake the buffer-wait
            // queue and re-schedule every session the same way the
            // pool's own wakeup hook does (no request -> session
            // reverse map, see DESIGN.md).
            if held_before && !held_after {
                let mut inner = self.inner.borrow_mut();
                inner.wait_queue.wakeup_all();
                for s in &sessions {
                    s.schedule();
                }
            }
        }

        for session in &sessions {
            session.listen();
        }

        for session in &sessions {
            if session.processing() {
                session.schedule();
            }
        }

        self.maybe_sleep_tick(app, &sessions);
        self.reap_finished_sessions(app);
    }

    /// Runs `run_once` in a loop until every session has both an
    /// empty pipeline and is aborted, sleeping `cfg.sleep_tick_interval`
    /// between passes when nothing is `changed`. Intended for simple
    /// single-session demo transports; real transports drive
    /// `run_once` from their own event-loop `poll`.
    pub fn run_until_idle(&self, app: &mut dyn Application, max_passes: usize) {
        for _ in 0..max_passes {
            self.run_once(app);
            if self.session_count() == 0 {
                return;
            }
        }
    }

    fn maybe_sleep_tick(&self, app: &mut dyn Application, sessions: &[Session]) {
        let due = {
            let inner = self.inner.borrow();
            Instant::now().duration_since(inner.last_sleep_tick) >= inner.cfg.sleep_tick_interval
        };
        if !due {
            return;
        }
        self.inner.borrow_mut().last_sleep_tick = Instant::now();

        let now = now_micros();
        for session in sessions {
            for req in session.pipeline_requests() {
                app.request_sleep(session, &req, now);
            }
        }
    }

    fn reap_finished_sessions(&self, app: &mut dyn Application) {
        let dead: Vec<Session> = {
            let inner = self.inner.borrow();
            inner
                .sessions
                .iter()
                .filter(|s| s.is_aborted() && s.pipeline_len() == 0)
                .cloned()
                .collect()
        };
        for session in &dead {
            app.session_shutdown(session);
            slog_info!("session {:?} reaped", session.id());
        }
        if !dead.is_empty() {
            self.inner
                .borrow_mut()
                .sessions
                .retain(|s| !dead.iter().any(|d| d.id() == s.id()));
        }
    }

    /// The sleep-tick period the scheduler was configured with
    /// (§4.5 "approximately once per second").
    pub fn sleep_tick_interval(&self) -> Duration {
        self.inner.borrow().cfg.sleep_tick_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessrv_session::{InputReason, OutputReason, Progress};
    use std::time::Instant as StdInstant;

    struct NullTransport;
    impl Transport for NullTransport {
        fn run(&mut self, _session: &Session, _deadline: StdInstant) -> bool {
            false
        }
        fn listen(&mut self, _session: &Session) {}
    }

    struct NullApp;
    impl Application for NullApp {
        fn session_initialize(&mut self, _session: &Session) {}
        fn request_input(
            &mut self,
            _session: &Session,
            _req: &sessrv_request::Request,
            _reason: InputReason,
            _deadline: StdInstant,
        ) -> sessrv_error::Result<Progress> {
            Ok(Progress::Done)
        }
        fn request_output(
            &mut self,
            _session: &Session,
            _req: &sessrv_request::Request,
            _reason: OutputReason,
            _deadline: StdInstant,
            _priority: &mut sessrv_request::PrioritySlot,
        ) -> sessrv_error::Result<Progress> {
            Ok(Progress::Done)
        }
        fn request_run(
            &mut self,
            _session: &Session,
            _req: &sessrv_request::Request,
            _deadline: StdInstant,
            _priority: &mut sessrv_request::PrioritySlot,
        ) -> sessrv_error::Result<Progress> {
            Ok(Progress::Done)
        }
    }

    #[test]
    fn create_session_enrolls_in_scheduler() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        assert_eq!(scheduler.session_count(), 0);
        let session = scheduler.create_session(Role::Server, Box::new(NullTransport));
        assert_eq!(scheduler.session_count(), 1);
        assert!(session.changed());
    }

    #[test]
    fn run_once_reaps_aborted_empty_sessions() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        let mut app = NullApp;
        let session = scheduler.create_session(Role::Server, Box::new(NullTransport));
        scheduler.run_once(&mut app); // clears `changed`, nothing to reap yet
        session.abort();
        scheduler.run_once(&mut app);
        assert_eq!(scheduler.session_count(), 0);
    }
}
