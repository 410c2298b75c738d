//! A pooled, refcounted byte buffer (§3 Buffer).

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use sessrv_error::Result;

use crate::pool::PoolInner;

/// Progress a pre-flush hook reports back to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookProgress {
    /// The hook finished; the buffer may now be written.
    Done,
    /// The hook is asynchronous and still pending.
    More,
}

/// A single flush closure attached to an output buffer (§4.2
/// `attach_pre_hook`). The `bool` argument is `true` when the hook
/// may block (the first, synchronous invocation via `write_ready`)
/// and `false` on later, non-blocking polls from `write`.
pub type PreHook = Rc<RefCell<dyn FnMut(bool) -> Result<HookProgress>>>;

struct BufferState {
    data: Box<[u8]>,
    /// Bytes produced (written) so far. Invariant `i <= n <= m`.
    n: usize,
    /// Bytes consumed (parsed/sent) so far.
    i: usize,
    pre_hook: Option<PreHook>,
    pool: Weak<RefCell<PoolInner>>,
}

impl Drop for BufferState {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let data = std::mem::replace(&mut self.data, Box::new([]));
            PoolInner::reclaim(&pool, data);
        }
    }
}

/// A fixed-capacity byte region owned by exactly one [`BufferPool`].
///
/// Cloning a `Buffer` is cheap (an `Rc` clone) and is exactly how the
/// spec's "shared, refcounted buffer" ownership model is expressed:
/// a `BufferedConnection` and every `Request` that parsed from this
/// buffer each hold a clone, and the buffer returns to its pool the
/// moment the last clone drops (invariant 8, §3 "Ownership summary").
///
/// [`BufferPool`]: crate::BufferPool
#[derive(Clone)]
pub struct Buffer(Rc<RefCell<BufferState>>);

impl Buffer {
    pub(crate) fn new(data: Box<[u8]>, pool: Weak<RefCell<PoolInner>>) -> Self {
        Buffer(Rc::new(RefCell::new(BufferState {
            data,
            n: 0,
            i: 0,
            pre_hook: None,
            pool,
        })))
    }

    /// `m`: total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.0.borrow().data.len()
    }

    /// `n`: bytes produced so far.
    pub fn produced(&self) -> usize {
        self.0.borrow().n
    }

    /// `i`: bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.0.borrow().i
    }

    /// `n - i`: bytes available to parse.
    pub fn unparsed_len(&self) -> usize {
        let b = self.0.borrow();
        b.n - b.i
    }

    /// `m - n`: room left to produce into.
    pub fn slack(&self) -> usize {
        let b = self.0.borrow();
        b.data.len() - b.n
    }

    pub fn is_full(&self) -> bool {
        self.slack() == 0
    }

    pub fn is_fully_consumed(&self) -> bool {
        self.unparsed_len() == 0
    }

    /// Borrow the unparsed window `[i..n)`.
    pub fn with_unparsed<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let b = self.0.borrow();
        f(&b.data[b.i..b.n])
    }

    /// Borrow the writable tail `[n..m)`, e.g. to hand to a
    /// transport's `read()`.
    pub fn with_tail_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut b = self.0.borrow_mut();
        let n = b.n;
        let m = b.data.len();
        f(&mut b.data[n..m])
    }

    /// Advance `n` by `by` bytes after producing into the tail.
    pub fn advance_produced(&self, by: usize) {
        let mut b = self.0.borrow_mut();
        let new_n = b.n + by;
        debug_assert!(new_n <= b.data.len(), "produced beyond capacity");
        b.n = new_n;
    }

    /// Set `i` to `to` after a parser consumes a prefix. `to` must be
    /// in `[i, n]`.
    pub fn set_consumed(&self, to: usize) {
        let mut b = self.0.borrow_mut();
        debug_assert!(to >= b.i && to <= b.n, "commit out of [i, n] range");
        b.i = to;
    }

    /// Reference-count snapshot: the connection plus every request
    /// that pinned this buffer. Used by testable property 8.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Attach a pre-flush hook if none is set yet; otherwise return
    /// the one already attached (§4.2 idempotence: "attach_pre_hook(c);
    /// attach_pre_hook(c) must return the same closure").
    pub fn attach_pre_hook(&self, hook: PreHook) -> PreHook {
        let mut b = self.0.borrow_mut();
        if b.pre_hook.is_none() {
            b.pre_hook = Some(hook.clone());
            hook
        } else {
            b.pre_hook.clone().unwrap()
        }
    }

    pub fn pre_hook(&self) -> Option<PreHook> {
        self.0.borrow().pre_hook.clone()
    }

    pub fn clear_pre_hook(&self) {
        self.0.borrow_mut().pre_hook = None;
    }

    /// Identity check: do these two handles refer to the same
    /// underlying buffer?
    pub fn is_same(&self, other: &Buffer) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.borrow();
        f.debug_struct("Buffer")
            .field("m", &b.data.len())
            .field("n", &b.n)
            .field("i", &b.i)
            .field("refcount", &Rc::strong_count(&self.0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::BufferPool;

    #[test]
    fn produce_consume_respects_offsets() {
        let pool = BufferPool::new(256, 0, 4096);
        let buf = pool.alloc(0).unwrap();
        assert_eq!(buf.capacity(), 256);
        assert_eq!(buf.produced(), 0);
        assert_eq!(buf.consumed(), 0);

        buf.with_tail_mut(|tail| tail[..5].copy_from_slice(b"hello"));
        buf.advance_produced(5);
        assert_eq!(buf.produced(), 5);
        assert_eq!(buf.unparsed_len(), 5);

        buf.with_unparsed(|data| assert_eq!(data, b"hello"));
        buf.set_consumed(5);
        assert!(buf.is_fully_consumed());
    }

    #[test]
    fn clone_shares_refcount() {
        let pool = BufferPool::new(256, 0, 4096);
        let buf = pool.alloc(0).unwrap();
        assert_eq!(buf.refcount(), 1);
        let clone = buf.clone();
        assert_eq!(buf.refcount(), 2);
        assert!(buf.is_same(&clone));
        drop(clone);
        assert_eq!(buf.refcount(), 1);
    }

    #[test]
    fn pre_hook_attach_is_idempotent() {
        let pool = BufferPool::new(256, 0, 4096);
        let buf = pool.alloc(0).unwrap();
        let hook_a: super::PreHook =
            std::rc::Rc::new(std::cell::RefCell::new(|_blocking: bool| {
                Ok(super::HookProgress::Done)
            }));
        let hook_b: super::PreHook =
            std::rc::Rc::new(std::cell::RefCell::new(|_blocking: bool| {
                Ok(super::HookProgress::Done)
            }));
        let attached_a = buf.attach_pre_hook(hook_a.clone());
        let attached_b = buf.attach_pre_hook(hook_b);
        assert!(std::rc::Rc::ptr_eq(&attached_a, &attached_b));
        assert!(std::rc::Rc::ptr_eq(&attached_a, &hook_a));
    }
}
