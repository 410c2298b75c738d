//! Request state machine: three independent two-bit phase flags, the
//! system-wide priority protocol, and the buffer-wait protocol (§4.3).
//!
//! Modeled after the ready/done-style state modeling in
//! `gvthread-core::state::GVThreadState` and `Priority`, generalized
//! from one state enum into three orthogonal phases per the "Flags
//! vs. state enums" design note: INPUT, RUN, and OUTPUT progress
//! independently, so a single enum can't represent e.g. an
//! OUTPUT-ready request whose INPUT isn't done yet.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use sessrv_log::slog_debug;

/// One of the three orthogonal lifecycle phases a request progresses
/// through (§3 Request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Input = 0,
    Run = 1,
    Output = 2,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Input, Phase::Run, Phase::Output];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// A bitset over {INPUT, RUN, OUTPUT}. Used for both `ready` and
/// `done`, and for the `buffer_waiting` snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseSet(u8);

impl PhaseSet {
    pub const NONE: PhaseSet = PhaseSet(0);

    pub fn all() -> PhaseSet {
        PhaseSet(Phase::Input.bit() | Phase::Run.bit() | Phase::Output.bit())
    }

    pub fn single(phase: Phase) -> PhaseSet {
        PhaseSet(phase.bit())
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    pub fn insert(&mut self, phase: Phase) {
        self.0 |= phase.bit();
    }

    pub fn remove(&mut self, phase: Phase) {
        self.0 &= !phase.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// `self \ other`, i.e. bits in `self` not in `other`.
    pub fn difference(&self, other: PhaseSet) -> PhaseSet {
        PhaseSet(self.0 & !other.0)
    }

    pub fn union(&self, other: PhaseSet) -> PhaseSet {
        PhaseSet(self.0 | other.0)
    }
}

/// Stable 64-bit request identity, assigned by the scheduler's
/// ascending counter (§3 "Scheduler-global state").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    /// Single-threaded-per-worker, so a plain atomic counter is
    /// overkill, but it keeps the type `Sync`-free-of-surprises and
    /// matches the counter style `gvthread-core::id` uses for its
    /// generation-tagged slot IDs.
    pub fn next() -> RequestId {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct RequestState {
    id: RequestId,
    ready: PhaseSet,
    done: PhaseSet,
    buffer_waiting: Option<PhaseSet>,
    depends_on: Option<Request>,
}

/// A single request in a session's pipeline (§3 Request, §4.3).
///
/// Cloning shares the same underlying state (an `Rc`), the way
/// [`sessrv_buffer::Buffer`] clones share a pooled region — a
/// session's pipeline holds one strong reference, and anything else
/// that needs to reach a request (a dependency link, a buffer-wait
/// queue entry) holds another.
#[derive(Clone)]
pub struct Request(Rc<RefCell<RequestState>>);

impl Request {
    /// A request that starts unready and undone in every phase.
    pub fn new() -> Self {
        Request(Rc::new(RefCell::new(RequestState {
            id: RequestId::next(),
            ready: PhaseSet::NONE,
            done: PhaseSet::NONE,
            buffer_waiting: None,
            depends_on: None,
        })))
    }

    /// Incoming server request: `ready = INPUT`.
    pub fn new_incoming() -> Self {
        let req = Self::new();
        req.set_ready(Phase::Input);
        req
    }

    /// Outgoing client request: `ready = OUTPUT`.
    pub fn new_outgoing() -> Self {
        let req = Self::new();
        req.set_ready(Phase::Output);
        req
    }

    /// Asynchronous (server-originated) request: `ready = OUTPUT`,
    /// `done = INPUT ∪ RUN`.
    pub fn new_asynchronous() -> Self {
        let req = Self::new();
        {
            let mut s = req.0.borrow_mut();
            s.done.insert(Phase::Input);
            s.done.insert(Phase::Run);
        }
        req.set_ready(Phase::Output);
        req
    }

    pub fn id(&self) -> RequestId {
        self.0.borrow().id
    }

    pub fn ready(&self) -> PhaseSet {
        self.0.borrow().ready
    }

    pub fn done(&self) -> PhaseSet {
        self.0.borrow().done
    }

    pub fn is_ready(&self, phase: Phase) -> bool {
        self.0.borrow().ready.contains(phase)
    }

    pub fn is_done(&self, phase: Phase) -> bool {
        self.0.borrow().done.contains(phase)
    }

    /// `(0,0) -> (1,0)`: the phase becomes schedulable. Fatal if the
    /// phase is already done (`(*,1) -> (1,*)` is illegal).
    pub fn set_ready(&self, phase: Phase) {
        let mut s = self.0.borrow_mut();
        assert!(
            !s.done.contains(phase),
            "request {:?}: cannot set ready on a done phase {:?}",
            s.id,
            phase
        );
        s.ready.insert(phase);
    }

    /// `(1,0) -> (0,0)`: suspension, `ready` cleared by the scheduler
    /// without marking the phase done.
    pub fn clear_ready(&self, phase: Phase) {
        self.0.borrow_mut().ready.remove(phase);
    }

    /// `(1,0) -> (0,1)` or `(0,0) -> (0,1)`: the phase completes (or
    /// is skipped, for a synthesised request). Idempotent — a phase
    /// already marked done is left alone, matching the "already done,
    /// skipped" null-buffer-callback behaviour of the abort path
    /// (§8 scenario 3).
    pub fn mark_done(&self, phase: Phase) {
        let mut s = self.0.borrow_mut();
        if s.done.contains(phase) {
            return;
        }
        s.ready.remove(phase);
        s.done.insert(phase);
    }

    /// Mark every phase that isn't already done as done. Used when a
    /// callback errors out (§4.4 step 2) or a session aborts (§7).
    pub fn mark_all_done(&self) {
        for phase in Phase::ALL {
            self.mark_done(phase);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.0.borrow().done == PhaseSet::all()
    }

    /// `want \ done` restricted to this request's own bits, i.e. the
    /// phases this request currently contributes to `session.want`.
    pub fn schedulable(&self) -> PhaseSet {
        let s = self.0.borrow();
        s.ready.difference(s.done)
    }

    /// `depend(self, dependency)`: this request now depends on
    /// `dependency` (§4.3, §8 scenario 5 — "Request A creates
    /// outbound Request B and calls depend(A, B)": here `B.depend(A)`).
    pub fn depend_on(&self, dependency: &Request) {
        self.0.borrow_mut().depends_on = Some(dependency.clone());
    }

    pub fn dependency(&self) -> Option<Request> {
        self.0.borrow().depends_on.clone()
    }

    /// Whether `holder` appears on this request's dependency chain,
    /// i.e. is reachable by repeatedly following `depends_on`. Bounds
    /// the walk defensively; dependency chains are expected to be
    /// short-lived and acyclic.
    pub fn chain_contains(&self, holder: &Request) -> bool {
        let mut current = self.dependency();
        for _ in 0..64 {
            match current {
                Some(r) if r.same_as(holder) => return true,
                Some(r) => current = r.dependency(),
                None => return false,
            }
        }
        false
    }

    pub fn same_as(&self, other: &Request) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Refcount snapshot (§8 invariant 7 et al.): the pipeline plus
    /// any dependency link and buffer-wait queue entry pointing here.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    fn take_buffer_waiting(&self) -> Option<PhaseSet> {
        self.0.borrow_mut().buffer_waiting.take()
    }

    fn set_buffer_waiting(&self, snapshot: PhaseSet) {
        self.0.borrow_mut().buffer_waiting = Some(snapshot);
    }

    pub fn is_buffer_waiting(&self) -> bool {
        self.0.borrow().buffer_waiting.is_some()
    }
}

impl Default for Request {
    fn default() -> Self {
        Request::new()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.borrow();
        f.debug_struct("Request")
            .field("id", &s.id)
            .field("ready", &s.ready)
            .field("done", &s.done)
            .field("buffer_waiting", &s.buffer_waiting)
            .finish()
    }
}

/// The single system-wide priority slot (§4.3 "Priority protocol").
/// Owned by the scheduler, not hidden behind a global — per the
/// "Global singletons" design note, every operation takes the slot
/// explicitly.
#[derive(Default)]
pub struct PrioritySlot {
    holder: Option<Request>,
}

impl PrioritySlot {
    pub fn new() -> Self {
        PrioritySlot::default()
    }

    pub fn holder(&self) -> Option<Request> {
        self.holder.clone()
    }

    /// Succeeds iff nobody holds priority, or the current holder is
    /// on `req`'s dependency chain (so a dependent request can
    /// "inherit" priority from the one it's waiting on).
    pub fn acquire(&mut self, req: &Request) -> bool {
        let granted = match &self.holder {
            None => true,
            Some(holder) if holder.same_as(req) => true,
            Some(holder) => req.chain_contains(holder),
        };
        if granted {
            self.holder = Some(req.clone());
        }
        granted
    }

    /// Clears the holder if it matches `req`. Returns whether it was
    /// actually cleared, so the caller knows whether to run
    /// `buffer_wakeup_all`.
    pub fn release(&mut self, req: &Request) -> bool {
        let matches = self.holder.as_ref().map(|h| h.same_as(req)).unwrap_or(false);
        if matches {
            self.holder = None;
        }
        matches
    }
}

/// The global FIFO of requests waiting for a buffer (§4.3
/// "Buffer-wait protocol").
#[derive(Default)]
pub struct BufferWaitQueue {
    queue: VecDeque<Request>,
}

impl BufferWaitQueue {
    pub fn new() -> Self {
        BufferWaitQueue::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// `buffer_wait(req)`: snapshot `ready`, clear it, enqueue at the
    /// FIFO tail.
    pub fn wait(&mut self, req: &Request) {
        let snapshot = req.ready();
        req.set_buffer_waiting_snapshot(snapshot);
        self.queue.push_back(req.clone());
    }

    /// `buffer_wakeup_all`: drain the queue in FIFO order, restoring
    /// each request's `ready` and clearing its snapshot. Invoked from
    /// the pool's `free` wakeup hook and from `priority_release`.
    pub fn wakeup_all(&mut self) -> Vec<Request> {
        let mut woken = Vec::with_capacity(self.queue.len());
        while let Some(req) = self.queue.pop_front() {
            req.restore_from_buffer_waiting();
            slog_debug!("request {:?} woken from buffer wait", req.id());
            woken.push(req);
        }
        woken
    }
}

impl Request {
    fn set_buffer_waiting_snapshot(&self, snapshot: PhaseSet) {
        {
            let mut s = self.0.borrow_mut();
            s.ready = PhaseSet::NONE;
        }
        self.set_buffer_waiting(snapshot);
    }

    fn restore_from_buffer_waiting(&self) {
        let snapshot = self.take_buffer_waiting().unwrap_or(PhaseSet::NONE);
        self.0.borrow_mut().ready = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_lifecycle() {
        let req = Request::new_incoming();
        assert!(req.is_ready(Phase::Input));
        req.mark_done(Phase::Input);
        req.set_ready(Phase::Run);
        assert!(req.is_done(Phase::Input));
        assert!(req.is_ready(Phase::Run));

        req.mark_done(Phase::Run);
        req.set_ready(Phase::Output);
        req.mark_done(Phase::Output);
        assert!(req.is_complete());
    }

    #[test]
    fn mark_done_is_idempotent_on_already_done_phase() {
        let req = Request::new_incoming();
        req.mark_done(Phase::Input);
        req.mark_done(Phase::Input); // no panic, no-op
        assert!(req.is_done(Phase::Input));
    }

    #[test]
    #[should_panic(expected = "cannot set ready on a done phase")]
    fn setting_ready_on_done_phase_is_fatal() {
        let req = Request::new_incoming();
        req.mark_done(Phase::Input);
        req.set_ready(Phase::Input);
    }

    #[test]
    fn asynchronous_greeting_starts_two_thirds_done() {
        let req = Request::new_asynchronous();
        assert!(req.is_done(Phase::Input));
        assert!(req.is_done(Phase::Run));
        assert!(req.is_ready(Phase::Output));
        assert!(!req.is_complete());
    }

    #[test]
    fn priority_chain_rescue() {
        let mut slot = PrioritySlot::new();
        let a = Request::new_incoming();
        let b = Request::new_incoming();
        assert!(slot.acquire(&a));
        assert!(!slot.acquire(&b)); // denied: unrelated

        b.depend_on(&a);
        assert!(slot.acquire(&b)); // now on b's chain via a

        assert!(slot.release(&b));
        assert!(slot.holder().is_none());
    }

    #[test]
    fn buffer_wait_round_trip() {
        let mut queue = BufferWaitQueue::new();
        let req = Request::new_incoming();
        req.set_ready(Phase::Run);
        assert!(req.is_ready(Phase::Input));
        assert!(req.is_ready(Phase::Run));

        queue.wait(&req);
        assert!(!req.is_ready(Phase::Input));
        assert!(req.is_buffer_waiting());

        let woken = queue.wakeup_all();
        assert_eq!(woken.len(), 1);
        assert!(req.is_ready(Phase::Input));
        assert!(req.is_ready(Phase::Run));
        assert!(!req.is_buffer_waiting());
    }

    #[test]
    fn phase_set_difference_and_union() {
        let mut ready = PhaseSet::NONE;
        ready.insert(Phase::Input);
        ready.insert(Phase::Output);
        let mut done = PhaseSet::NONE;
        done.insert(Phase::Input);
        let schedulable = ready.difference(done);
        assert!(!schedulable.contains(Phase::Input));
        assert!(schedulable.contains(Phase::Output));
        assert_eq!(schedulable.union(done), PhaseSet::all().difference(PhaseSet::single(Phase::Run)));
    }
}
