//! Session: request pipeline, I/O cursors, the `want` bitset, the
//! transport binding, and the session processing loop (§3, §4.4).
//!
//! Grounded on `ksvc_gvthread::worker_reactor`'s request-queue-in /
//! completions-out / wake shape, generalized from one dedicated
//! reactor thread to one cooperative pass per session per dispatch
//! round — there is no separate reactor thread here, because §5
//! rules out intra-worker parallelism.

mod application;
mod transport;
mod want;

pub use application::{Application, InputReason, OutputReason, Progress};
pub use transport::Transport;
pub use want::WantSet;

use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sessrv_conn::BufferedConnection;
use sessrv_config::SchedulerConfig;
use sessrv_log::{slog_info, slog_trace};
use sessrv_request::{BufferWaitQueue, Phase, PrioritySlot, Request};

/// Whether a session accepts new inbound requests (server) or only
/// initiates outbound ones (client) (§3 Session "role flag").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    fn next() -> SessionId {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct SessionState {
    id: SessionId,
    role: Role,
    conn: BufferedConnection,
    pipeline: VecDeque<Request>,
    want: WantSet,
    changed: bool,
    processing: bool,
    have_priority: bool,
    /// Set by `suspend()`/cleared by `resume()`: whether the session
    /// is blocked on an external event rather than its own pipeline
    /// (§5 suspension point (b)). Folded into `want` on every
    /// `recompute_want()` so it survives the recompute.
    awaiting_external: bool,
    transport: Option<Box<dyn Transport>>,
    short_time_slice: Duration,
    long_time_slice: Duration,
    /// Whether the head RUN-ready request is on its very first slice
    /// (grants the long time slice instead of the short one).
    head_first_slice: bool,
}

/// A session: one connection, one request pipeline, one transport
/// binding. Cloning shares the same state — the scheduler holds one
/// handle per session in its session list; a transport's callback
/// holds a weak-equivalent handle by simply not retaining a clone
/// past the call that needs it (§3 "the transport holds a weak
/// back-reference").
#[derive(Clone)]
pub struct Session(Rc<RefCell<SessionState>>);

impl Session {
    pub fn new(role: Role, pool: sessrv_buffer::BufferPool, transport: Box<dyn Transport>, cfg: &SchedulerConfig) -> Self {
        let id = SessionId::next();
        slog_info!("session {:?} created (role {:?})", id, role);
        Session(Rc::new(RefCell::new(SessionState {
            id,
            role,
            conn: BufferedConnection::new(pool),
            pipeline: VecDeque::new(),
            want: WantSet::NONE,
            changed: true,
            processing: false,
            have_priority: false,
            awaiting_external: false,
            transport: Some(transport),
            short_time_slice: cfg.short_time_slice,
            long_time_slice: cfg.long_time_slice,
            head_first_slice: true,
        })))
    }

    pub fn id(&self) -> SessionId {
        self.0.borrow().id
    }

    pub fn role(&self) -> Role {
        self.0.borrow().role
    }

    pub fn is_server(&self) -> bool {
        matches!(self.0.borrow().role, Role::Server)
    }

    pub fn want(&self) -> WantSet {
        self.0.borrow().want
    }

    pub fn changed(&self) -> bool {
        self.0.borrow().changed
    }

    pub fn schedule(&self) {
        self.0.borrow_mut().changed = true;
    }

    pub fn processing(&self) -> bool {
        self.0.borrow().processing
    }

    pub fn connection(&self) -> Ref<'_, BufferedConnection> {
        Ref::map(self.0.borrow(), |s| &s.conn)
    }

    pub fn connection_mut(&self) -> RefMut<'_, BufferedConnection> {
        RefMut::map(self.0.borrow_mut(), |s| &mut s.conn)
    }

    pub fn have_priority(&self) -> bool {
        self.0.borrow().have_priority
    }

    fn set_have_priority(&self, value: bool) {
        let mut s = self.0.borrow_mut();
        s.have_priority = value;
        // `BufferedConnection::output_lookahead` reads its own copy of
        // this flag to pick an allocation priority; keep the two in
        // sync rather than exposing the connection's field to the
        // priority slot directly.
        s.conn.have_priority = value;
    }

    /// `abort()`: sets the transport-error bit and schedules; the
    /// next transport `run` notices and tears down (§4.4, §5
    /// cancellation semantics).
    pub fn abort(&self) {
        self.0.borrow_mut().conn.errors.set(sessrv_conn::ErrorMask::TRANSPORT);
        self.schedule();
    }

    /// `link_request`: FIFO append to the pipeline.
    pub fn link_request(&self, req: Request) {
        self.0.borrow_mut().pipeline.push_back(req);
    }

    /// `unlink_request`: remove by identity.
    pub fn unlink_request(&self, req: &Request) {
        self.0.borrow_mut().pipeline.retain(|r| !r.same_as(req));
    }

    pub fn pipeline_len(&self) -> usize {
        self.0.borrow().pipeline.len()
    }

    pub fn pipeline_requests(&self) -> Vec<Request> {
        self.0.borrow().pipeline.iter().cloned().collect()
    }

    /// Whether the transport-error bit is set (§5 cancellation
    /// semantics): the scheduler reaps such a session once its
    /// pipeline has drained.
    pub fn is_aborted(&self) -> bool {
        self.0.borrow().conn.errors.has(sessrv_conn::ErrorMask::TRANSPORT)
    }

    /// `suspend(req)` / `resume(req)`: toggle the RUN ready bit of
    /// the first not-done request, and mark the session as waiting on
    /// an external event so `want` carries `EXTERNAL` until `resume`
    /// (§5 suspension point (b)).
    pub fn suspend(&self) {
        if let Some(req) = self.first_not_done(Phase::Run) {
            req.clear_ready(Phase::Run);
        }
        self.0.borrow_mut().awaiting_external = true;
        self.recompute_want();
    }

    pub fn resume(&self) {
        if let Some(req) = self.first_not_done(Phase::Run) {
            if !req.is_done(Phase::Run) {
                req.set_ready(Phase::Run);
            }
        }
        self.0.borrow_mut().awaiting_external = false;
        self.recompute_want();
        self.schedule();
    }

    /// Whether the session is currently blocked on an external event
    /// (§5 suspension point (b), §8 invariant 4).
    pub fn is_awaiting_external(&self) -> bool {
        self.0.borrow().awaiting_external
    }

    fn first_not_done(&self, phase: Phase) -> Option<Request> {
        self.0.borrow().pipeline.iter().find(|r| !r.is_done(phase)).cloned()
    }

    /// `input_cursor`: first request not done for INPUT (§8 invariant
    /// 6). Computed on demand rather than cached and incrementally
    /// maintained — the pipeline is bounded by `MAX_INPUT_QUEUE`
    /// (10), so a linear scan costs nothing an intrusive cursor
    /// field would meaningfully save.
    pub fn input_cursor(&self) -> Option<Request> {
        self.first_not_done(Phase::Input)
    }

    pub fn output_cursor(&self) -> Option<Request> {
        self.first_not_done(Phase::Output)
    }

    fn current_time_slice(&self) -> Duration {
        let s = self.0.borrow();
        if s.head_first_slice {
            s.long_time_slice
        } else {
            s.short_time_slice
        }
    }

    fn with_transport<R>(&self, f: impl FnOnce(&mut dyn Transport, &Session) -> R) -> Option<R> {
        let mut taken = self.0.borrow_mut().transport.take();
        let result = taken.as_mut().map(|t| f(t.as_mut(), self));
        self.0.borrow_mut().transport = taken;
        result
    }

    pub fn listen(&self) {
        self.with_transport(|t, session| t.listen(session));
    }

    fn reap_completed(&self, app: &mut dyn Application) -> bool {
        let mut did_reap = false;
        loop {
            let head = self.0.borrow().pipeline.front().cloned();
            match head {
                Some(req) if req.is_complete() => {
                    self.0.borrow_mut().pipeline.pop_front();
                    if req.refcount() <= 1 {
                        app.request_finish(self, &req);
                    }
                    did_reap = true;
                }
                _ => break,
            }
        }
        did_reap
    }

    fn first_run_ready(&self) -> Option<Request> {
        self.0
            .borrow()
            .pipeline
            .iter()
            .find(|r| r.is_ready(Phase::Run))
            .cloned()
    }

    fn run_request(&self, app: &mut dyn Application, req: &Request, deadline: Instant, priority: &mut PrioritySlot) -> bool {
        sessrv_log::set_request_id(req.id().0);
        let result = app.request_run(self, req, deadline, priority);
        sessrv_log::clear_request_id();
        match result {
            Ok(Progress::Done) => {
                req.mark_done(Phase::Run);
                slog_trace!("request {:?} done: RUN", req.id());
                if !req.is_done(Phase::Output) {
                    req.set_ready(Phase::Output);
                }
                true
            }
            Ok(Progress::More) => {
                req.clear_ready(Phase::Run);
                false
            }
            Err(_) => {
                req.mark_all_done();
                true
            }
        }
    }

    fn drive_transport(&self, deadline: Instant) -> bool {
        self.with_transport(|t, session| t.run(session, deadline))
            .unwrap_or(false)
    }

    fn maybe_synthesize_incoming(&self, cfg: &SchedulerConfig) -> bool {
        let s = self.0.borrow();
        let is_server = matches!(s.role, Role::Server);
        let has_pending_input = s.conn.caps.data_waiting_to_be_read || s.conn.caps.input_waiting_to_be_parsed;
        let has_input_request = s.pipeline.iter().any(|r| !r.is_done(Phase::Input));
        let under_queue_limit = s.pipeline.len() < cfg.max_input_queue;
        let under_buffer_limit = s.conn.input_buffer_count() <= cfg.max_input_buffers_used;
        drop(s);

        if is_server && has_pending_input && !has_input_request && under_queue_limit && under_buffer_limit {
            self.link_request(Request::new_incoming());
            true
        } else {
            false
        }
    }

    fn recompute_want(&self) {
        let want = {
            let s = self.0.borrow();
            let mut w = WantSet::NONE;
            for req in s.pipeline.iter() {
                w.insert(WantSet::from_phase_set(req.schedulable()));
            }
            if s.awaiting_external {
                w.insert(WantSet::EXTERNAL);
            }
            w
        };
        self.0.borrow_mut().want = want;
    }

    /// Step 4c/4d: ensure buffer capacity for an INPUT- or
    /// OUTPUT-ready request, urgent (priority 0) when the wire has
    /// work and nothing else is wanted, fair (priority 1) otherwise.
    /// On policy denial, buffer-wait the request and record BUFFER
    /// in `want`.
    fn ensure_capacity_or_wait(
        &self,
        req: &Request,
        is_input: bool,
        wait_queue: &mut BufferWaitQueue,
    ) {
        let urgent = {
            let s = self.0.borrow();
            if is_input {
                s.conn.caps.data_waiting_to_be_read
                    && !s.conn.caps.input_buffer_capacity_available
                    && s.want == WantSet::INPUT
            } else {
                s.conn.caps.write_capacity_available
                    && !s.conn.caps.output_buffer_capacity_available
                    && s.want == WantSet::OUTPUT
            }
        };
        let priority = if urgent { 0 } else { 1 };

        let result = {
            let mut s = self.0.borrow_mut();
            if is_input {
                s.conn.ensure_input_capacity(priority)
            } else {
                s.conn.ensure_output_capacity(priority)
            }
        };

        if result.is_err() {
            wait_queue.wait(req);
            self.0.borrow_mut().want.insert(WantSet::BUFFER);
        }
    }

    fn output_ready_request(&self) -> Option<Request> {
        self.0
            .borrow()
            .pipeline
            .iter()
            .find(|r| r.is_ready(Phase::Output))
            .cloned()
    }

    fn input_ready_request(&self) -> Option<Request> {
        self.0
            .borrow()
            .pipeline
            .iter()
            .find(|r| r.is_ready(Phase::Input))
            .cloned()
    }

    fn drive_output(
        &self,
        app: &mut dyn Application,
        req: &Request,
        reason: OutputReason,
        deadline: Instant,
        priority: &mut PrioritySlot,
    ) -> bool {
        sessrv_log::set_request_id(req.id().0);
        let result = app.request_output(self, req, reason, deadline, priority);
        sessrv_log::clear_request_id();
        match result {
            Ok(Progress::Done) => {
                req.mark_done(Phase::Output);
                slog_trace!("request {:?} done: OUTPUT", req.id());
                true
            }
            Ok(Progress::More) => false,
            Err(_) => {
                self.abort();
                req.mark_all_done();
                true
            }
        }
    }

    fn drive_input(&self, app: &mut dyn Application, req: &Request, reason: InputReason, deadline: Instant) -> bool {
        sessrv_log::set_request_id(req.id().0);
        let result = app.request_input(self, req, reason, deadline);
        sessrv_log::clear_request_id();
        match result {
            Ok(Progress::Done) => {
                req.mark_done(Phase::Input);
                req.set_ready(Phase::Run);
                slog_trace!("request {:?} done: INPUT", req.id());
                true
            }
            Ok(Progress::More) => false,
            Err(_) => {
                self.abort();
                req.mark_all_done();
                true
            }
        }
    }

    fn post_pass(
        &self,
        app: &mut dyn Application,
        priority: &mut PrioritySlot,
        wait_queue: &mut BufferWaitQueue,
        cfg: &SchedulerConfig,
        deadline: Instant,
    ) -> bool {
        let mut progressed = false;

        // 4a
        progressed |= self.maybe_synthesize_incoming(cfg);

        // 4b
        self.recompute_want();

        // 4c
        if let Some(req) = self.input_ready_request() {
            let has_capacity = self.0.borrow().conn.caps.input_buffer_capacity_available;
            if !has_capacity {
                self.ensure_capacity_or_wait(&req, true, wait_queue);
            }
        }

        // 4d
        if let Some(req) = self.output_ready_request() {
            let has_capacity = self.0.borrow().conn.caps.output_buffer_capacity_available;
            if !has_capacity {
                self.ensure_capacity_or_wait(&req, false, wait_queue);
            }
        }

        // 4e
        let output_capacity = self.0.borrow().conn.caps.output_buffer_capacity_available;
        if output_capacity {
            if let Some(req) = self.output_ready_request() {
                progressed |= self.drive_output(app, &req, OutputReason::Normal, deadline, priority);
            }
        }

        // 4f
        let input_waiting = self.0.borrow().conn.caps.input_waiting_to_be_parsed;
        if input_waiting {
            if let Some(req) = self.input_ready_request() {
                progressed |= self.drive_input(app, &req, InputReason::Normal, deadline);
            }
        }

        // 4g: READ error, parse queue drained -> null-buffer notify
        let read_errored = self.0.borrow().conn.errors.has(sessrv_conn::ErrorMask::READ);
        let parse_queue_drained = self.0.borrow().conn.input_lookahead().is_none();
        if read_errored && parse_queue_drained {
            let pending: Vec<Request> = self
                .0
                .borrow()
                .pipeline
                .iter()
                .filter(|r| !r.is_done(Phase::Input))
                .cloned()
                .collect();
            for req in pending {
                progressed |= self.drive_input(app, &req, InputReason::ReadError, deadline);
            }
        }

        // 4h: mirror for WRITE error / OUTPUT
        let write_errored = self.0.borrow().conn.errors.has(sessrv_conn::ErrorMask::WRITE);
        if write_errored {
            let pending: Vec<Request> = self
                .0
                .borrow()
                .pipeline
                .iter()
                .filter(|r| !r.is_done(Phase::Output))
                .cloned()
                .collect();
            for req in pending {
                progressed |= self.drive_output(app, &req, OutputReason::WriteError, deadline, priority);
            }
        }

        progressed
    }

    /// The session processing loop (§4.4), run once per post-dispatch
    /// pass for every `changed` session.
    pub fn process(
        &self,
        app: &mut dyn Application,
        priority: &mut PrioritySlot,
        wait_queue: &mut BufferWaitQueue,
        cfg: &SchedulerConfig,
    ) {
        let deadline = Instant::now() + self.current_time_slice();
        self.0.borrow_mut().changed = false;

        sessrv_log::set_session_id(self.id().0);

        loop {
            let mut progressed = false;

            progressed |= self.reap_completed(app);

            let healthy = self.connection().is_healthy();
            if healthy {
                if let Some(req) = self.first_run_ready() {
                    self.0.borrow_mut().head_first_slice = false;
                    progressed |= self.run_request(app, &req, deadline, priority);
                }
            }

            progressed |= self.drive_transport(deadline);
            progressed |= self.post_pass(app, priority, wait_queue, cfg, deadline);

            self.set_have_priority(priority.holder().map(|h| self.pipeline_contains(&h)).unwrap_or(false));

            let deadline_hit = Instant::now() >= deadline;
            if !progressed || deadline_hit {
                self.0.borrow_mut().processing = progressed && deadline_hit;
                break;
            }
        }

        sessrv_log::clear_session_id();
    }

    fn pipeline_contains(&self, req: &Request) -> bool {
        self.0.borrow().pipeline.iter().any(|r| r.same_as(req))
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        slog_info!("session {:?} destroyed", self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.borrow();
        f.debug_struct("Session")
            .field("id", &s.id)
            .field("role", &s.role)
            .field("pipeline_len", &s.pipeline.len())
            .field("want", &s.want)
            .field("changed", &s.changed)
            .field("processing", &s.processing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io;

    use sessrv_buffer::BufferPool;
    use sessrv_conn::RawIo;

    /// Always `WouldBlock`s on read, appends every write to a shared
    /// sink so a test can inspect what the session actually flushed —
    /// `demos/echo` has no such hook, since the session owns its
    /// transport outright.
    struct RecordingIo {
        sink: Rc<RefCell<Vec<u8>>>,
    }

    impl RawIo for RecordingIo {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sink.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    struct RecordingTransport {
        io: RecordingIo,
    }

    impl Transport for RecordingTransport {
        fn run(&mut self, session: &Session, _deadline: Instant) -> bool {
            let mut conn = session.connection_mut();
            let r = conn.read(&mut self.io);
            let w = conn.write(&mut self.io);
            r || w
        }

        fn listen(&mut self, _session: &Session) {}
    }

    fn harness(pool: BufferPool) -> (Session, Rc<RefCell<Vec<u8>>>, SchedulerConfig) {
        let cfg = SchedulerConfig::new();
        let sink = Rc::new(RefCell::new(Vec::new()));
        let transport = RecordingTransport {
            io: RecordingIo { sink: sink.clone() },
        };
        let session = Session::new(Role::Server, pool, Box::new(transport), &cfg);
        (session, sink, cfg)
    }

    /// Never invoked in the backpressure/abort tests below — capacity
    /// denial and the health check both short-circuit before any
    /// phase callback runs — but the trait still needs a body.
    struct DummyApp;
    impl Application for DummyApp {
        fn session_initialize(&mut self, _session: &Session) {}
        fn request_input(
            &mut self,
            _session: &Session,
            _req: &Request,
            _reason: InputReason,
            _deadline: Instant,
        ) -> sessrv_error::Result<Progress> {
            unreachable!("capacity denial should keep this from running")
        }
        fn request_output(
            &mut self,
            _session: &Session,
            _req: &Request,
            _reason: OutputReason,
            _deadline: Instant,
            _priority: &mut PrioritySlot,
        ) -> sessrv_error::Result<Progress> {
            unreachable!("capacity denial should keep this from running")
        }
        fn request_run(
            &mut self,
            _session: &Session,
            _req: &Request,
            _deadline: Instant,
            _priority: &mut PrioritySlot,
        ) -> sessrv_error::Result<Progress> {
            unreachable!("abort should keep this from running")
        }
    }

    // §8 scenario 2 (Backpressure): a Scarce-tier pool denies fair
    // (priority 1) allocations to both an INPUT- and an OUTPUT-ready
    // request; both land in the wait queue and `want` carries BUFFER
    // until the pool frees enough to cross back into Fair.
    #[test]
    fn backpressure_buffer_waits_and_wakes_on_free() {
        let pool = BufferPool::new(128, 0, 128 * 10); // 10 buffers @ 128B = max_level
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.alloc(0).unwrap());
        }
        assert_eq!(pool.alloc_tier(), sessrv_buffer::AllocTier::Scarce);

        let (session, _sink, cfg) = harness(pool);
        let req_in = Request::new_incoming();
        let req_out = Request::new_outgoing();
        session.link_request(req_in.clone());
        session.link_request(req_out.clone());

        let mut app = DummyApp;
        let mut priority = PrioritySlot::new();
        let mut wait_queue = BufferWaitQueue::new();
        session.process(&mut app, &mut priority, &mut wait_queue, &cfg);

        assert_eq!(wait_queue.len(), 2);
        assert!(session.want().contains(WantSet::BUFFER));
        assert!(!req_in.is_ready(Phase::Input));
        assert!(!req_out.is_ready(Phase::Output));

        // Free two buffers: 256 / 1280 = 20% -> Fair, which admits
        // priority 1.
        held.truncate(8);
        assert_eq!(pool.alloc_tier(), sessrv_buffer::AllocTier::Fair);

        let woken = wait_queue.wakeup_all();
        assert_eq!(woken.len(), 2);
        assert!(req_in.is_ready(Phase::Input));
        assert!(req_out.is_ready(Phase::Output));
        assert!(wait_queue.is_empty());
    }

    // §8 scenario 3 (Abort mid-request): an aborted session's health
    // check short-circuits the RUN phase entirely, leaving the
    // request's ready bit untouched rather than forcing it through.
    #[test]
    fn abort_skips_run_phase_without_touching_the_request() {
        let pool = BufferPool::new(128, 0, 128 * 8);
        let (session, _sink, cfg) = harness(pool);
        let req = Request::new();
        req.set_ready(Phase::Run);
        session.link_request(req.clone());
        session.abort();

        let mut app = DummyApp;
        let mut priority = PrioritySlot::new();
        let mut wait_queue = BufferWaitQueue::new();
        session.process(&mut app, &mut priority, &mut wait_queue, &cfg);

        assert!(session.is_aborted());
        assert_eq!(session.pipeline_len(), 1);
        assert!(req.is_ready(Phase::Run));
    }

    // The other abort path: an application error out of the INPUT
    // callback self-aborts the session *and* forces the request to
    // completion so the pipeline still drains.
    #[test]
    fn input_error_aborts_the_session_and_completes_the_request() {
        struct FailingApp;
        impl Application for FailingApp {
            fn session_initialize(&mut self, _session: &Session) {}
            fn request_input(
                &mut self,
                _session: &Session,
                _req: &Request,
                _reason: InputReason,
                _deadline: Instant,
            ) -> sessrv_error::Result<Progress> {
                Err(sessrv_error::Error::Semantics)
            }
            fn request_output(
                &mut self,
                _session: &Session,
                _req: &Request,
                _reason: OutputReason,
                _deadline: Instant,
                _priority: &mut PrioritySlot,
            ) -> sessrv_error::Result<Progress> {
                Ok(Progress::Done)
            }
            fn request_run(
                &mut self,
                _session: &Session,
                _req: &Request,
                _deadline: Instant,
                _priority: &mut PrioritySlot,
            ) -> sessrv_error::Result<Progress> {
                Ok(Progress::Done)
            }
        }

        let pool = BufferPool::new(128, 0, 128 * 8);
        let (session, _sink, cfg) = harness(pool);
        let req = Request::new_incoming();
        session.link_request(req.clone());
        // Bypass the real transport: pretend a parse window is
        // already waiting, the way a prior `read()` would have left
        // it, so 4f drives this request without needing live I/O.
        session.connection_mut().caps.input_waiting_to_be_parsed = true;

        let mut app = FailingApp;
        let mut priority = PrioritySlot::new();
        let mut wait_queue = BufferWaitQueue::new();
        session.process(&mut app, &mut priority, &mut wait_queue, &cfg);

        assert!(session.is_aborted());
        assert_eq!(session.pipeline_len(), 0);
    }

    // §8 scenario 6 (Asynchronous greeting): a server-originated
    // request with `ready = OUTPUT`, `done = INPUT ∪ RUN` writes
    // without ever receiving input.
    #[test]
    fn asynchronous_greeting_writes_without_any_input() {
        struct GreetingApp {
            greeted: Cell<bool>,
        }
        impl Application for GreetingApp {
            fn session_initialize(&mut self, _session: &Session) {}
            fn request_input(
                &mut self,
                _session: &Session,
                _req: &Request,
                _reason: InputReason,
                _deadline: Instant,
            ) -> sessrv_error::Result<Progress> {
                Ok(Progress::Done)
            }
            fn request_output(
                &mut self,
                session: &Session,
                _req: &Request,
                reason: OutputReason,
                _deadline: Instant,
                _priority: &mut PrioritySlot,
            ) -> sessrv_error::Result<Progress> {
                if reason == OutputReason::WriteError || self.greeted.get() {
                    return Ok(Progress::Done);
                }
                let mut conn = session.connection_mut();
                let msg = b"hello\n";
                let buf = conn.output_lookahead(msg.len())?;
                buf.with_tail_mut(|tail| tail[..msg.len()].copy_from_slice(msg));
                let end = buf.produced() + msg.len();
                conn.output_commit(&buf, end);
                self.greeted.set(true);
                Ok(Progress::Done)
            }
            fn request_run(
                &mut self,
                _session: &Session,
                _req: &Request,
                _deadline: Instant,
                _priority: &mut PrioritySlot,
            ) -> sessrv_error::Result<Progress> {
                Ok(Progress::Done)
            }
        }

        let pool = BufferPool::new(128, 0, 128 * 8);
        let (session, sink, cfg) = harness(pool);
        session.link_request(Request::new_asynchronous());

        let mut app = GreetingApp { greeted: Cell::new(false) };
        let mut priority = PrioritySlot::new();
        let mut wait_queue = BufferWaitQueue::new();
        session.process(&mut app, &mut priority, &mut wait_queue, &cfg);

        assert_eq!(sink.borrow().as_slice(), b"hello\n");
        assert_eq!(session.pipeline_len(), 0);
    }

    struct AcquireOnceApp {
        acquired: Cell<bool>,
    }
    impl Application for AcquireOnceApp {
        fn session_initialize(&mut self, _session: &Session) {}
        fn request_input(
            &mut self,
            _session: &Session,
            _req: &Request,
            _reason: InputReason,
            _deadline: Instant,
        ) -> sessrv_error::Result<Progress> {
            Ok(Progress::Done)
        }
        fn request_output(
            &mut self,
            _session: &Session,
            _req: &Request,
            _reason: OutputReason,
            _deadline: Instant,
            _priority: &mut PrioritySlot,
        ) -> sessrv_error::Result<Progress> {
            Ok(Progress::Done)
        }
        fn request_run(
            &mut self,
            _session: &Session,
            req: &Request,
            _deadline: Instant,
            priority: &mut PrioritySlot,
        ) -> sessrv_error::Result<Progress> {
            if !self.acquired.get() {
                priority.acquire(req);
                self.acquired.set(true);
            }
            Ok(Progress::More)
        }
    }

    // §8 scenario 4 (Priority rescue), part one: acquiring priority
    // from inside `request_run` actually reaches the session's
    // `have_priority` flag (and, through it, the connection's
    // allocation-tier bias) — previously unreachable from any
    // `Application` at all.
    #[test]
    fn acquiring_priority_marks_the_session_have_priority() {
        let pool = BufferPool::new(128, 0, 128 * 8);
        let (session, _sink, cfg) = harness(pool);
        let req = Request::new();
        req.set_ready(Phase::Run);
        session.link_request(req);

        let mut app = AcquireOnceApp { acquired: Cell::new(false) };
        let mut priority = PrioritySlot::new();
        let mut wait_queue = BufferWaitQueue::new();
        session.process(&mut app, &mut priority, &mut wait_queue, &cfg);

        assert!(session.have_priority());
        assert!(session.connection().have_priority);
        assert!(priority.holder().is_some());
    }

    // §8 scenario 5 (Dependency chain): a dependent request in a
    // second session can rescue priority away from the first session's
    // request, and `have_priority` moves with the holder.
    #[test]
    fn dependent_request_rescues_priority_into_its_own_session() {
        let pool = BufferPool::new(128, 0, 128 * 8);
        let (session_a, _sink_a, cfg) = harness(pool.clone());
        let req_a = Request::new();
        req_a.set_ready(Phase::Run);
        session_a.link_request(req_a.clone());

        let (session_b, _sink_b, _cfg_b) = harness(pool);
        let req_b = Request::new();
        req_b.set_ready(Phase::Run);
        req_b.depend_on(&req_a);
        session_b.link_request(req_b.clone());

        let mut app_a = AcquireOnceApp { acquired: Cell::new(false) };
        let mut app_b = AcquireOnceApp { acquired: Cell::new(false) };
        let mut priority = PrioritySlot::new();
        let mut wait_queue = BufferWaitQueue::new();

        session_a.process(&mut app_a, &mut priority, &mut wait_queue, &cfg);
        assert!(priority.holder().unwrap().same_as(&req_a));
        assert!(session_a.have_priority());

        session_b.process(&mut app_b, &mut priority, &mut wait_queue, &cfg);
        assert!(priority.holder().unwrap().same_as(&req_b));
        assert!(session_b.have_priority());

        // session_a's flag is stale until it runs another pass.
        session_a.process(&mut app_a, &mut priority, &mut wait_queue, &cfg);
        assert!(!session_a.have_priority());
    }

    // §5 suspension point (b): blocking on an external event sets
    // `want.EXTERNAL`, distinguishing it from ordinary RUN suspension.
    #[test]
    fn suspend_sets_external_want_and_resume_clears_it() {
        let pool = BufferPool::new(128, 0, 128 * 8);
        let (session, _sink, _cfg) = harness(pool);
        let req = Request::new();
        req.set_ready(Phase::Run);
        session.link_request(req.clone());

        session.suspend();
        assert!(!req.is_ready(Phase::Run));
        assert!(session.is_awaiting_external());
        assert!(session.want().contains(WantSet::EXTERNAL));

        session.resume();
        assert!(req.is_ready(Phase::Run));
        assert!(!session.is_awaiting_external());
        assert!(!session.want().contains(WantSet::EXTERNAL));
    }
}
