//! Fixed-size byte-buffer freelist with fill-level tiers (§4.1).

use std::cell::RefCell;
use std::rc::Rc;

use sessrv_error::{Error, Result};
use sessrv_log::slog_debug;

use crate::buffer::Buffer;
use crate::tier::{AllocTier, FillTier};

/// Minimum buffer capacity in bytes (§3 `MIN`).
pub const MIN_BUFFER_SIZE: usize = 128;

fn round_up_to_multiple(value: usize, multiple: usize) -> usize {
    if multiple == 0 || value % multiple == 0 {
        value
    } else {
        value + (multiple - value % multiple)
    }
}

pub(crate) struct PoolInner {
    size: usize,
    min_level: usize,
    max_level: usize,
    free: Vec<Box<[u8]>>,
    available: usize,
    tier: FillTier,
    total_allocated_bytes: usize,
    wakeup_hook: Option<Rc<dyn Fn()>>,
}

impl PoolInner {
    fn recompute_tier(&mut self, self_rc: &Rc<RefCell<PoolInner>>) {
        let new_tier = FillTier::from_levels(self.available, self.min_level, self.max_level);
        if new_tier != self.tier {
            slog_debug!(
                "buffer pool tier {} -> {} (available={}, min={}, max={})",
                self.tier.as_str(),
                new_tier.as_str(),
                self.available,
                self.min_level,
                self.max_level
            );
            self.tier = new_tier;
        }
        let _ = self_rc; // kept for symmetry / future per-pool hook dispatch
    }

    /// Called from `BufferState::drop` when the last reference to a
    /// buffer goes away. Returns the raw storage to the free list
    /// unless doing so would push `available` past `max_level`, in
    /// which case it is dropped (returned to the system allocator),
    /// keeping steady-state memory bounded (§4.1 `free`).
    pub(crate) fn reclaim(self_rc: &Rc<RefCell<PoolInner>>, data: Box<[u8]>) {
        let size = data.len();
        let mut woke = false;
        {
            let mut inner = self_rc.borrow_mut();
            let would_be = inner.available + size;
            if inner.max_level > 0 && would_be > inner.max_level {
                // Returned to the system allocator: just drop `data`.
                drop(data);
            } else {
                inner.free.push(data);
                inner.available = would_be;
            }
            inner.recompute_tier(self_rc);
            woke = inner.wakeup_hook.is_some();
        }
        if woke {
            let hook = self_rc.borrow().wakeup_hook.clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }
}

/// Fixed-memory buffer pool (§3 BufferPool, §4.1).
///
/// Initially allocates buffers until `available >= max_level`. Grants
/// buffers to callers subject to the three-tier policy in
/// [`AllocTier`]; `alloc` recomputes the fill tier ([`FillTier`]) on
/// every call and logs each tier transition exactly once, the way
/// `ksvc-module::fixed_pool` logs pool lifecycle events.
pub struct BufferPool {
    inner: Rc<RefCell<PoolInner>>,
    size: usize,
}

/// Point-in-time pool diagnostics (no metrics/Prometheus layer here —
/// out of scope — but every teacher trait exposes a plain stats
/// snapshot the way `SyscallRouter::tier_counts` does).
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub available: usize,
    pub tier: FillTier,
    pub idle_buffers: usize,
    pub buffer_size: usize,
    pub total_allocated_bytes: usize,
}

impl BufferPool {
    /// `size` is rounded up to at least [`MIN_BUFFER_SIZE`] and to a
    /// multiple of it; `min_level`/`max_level` are rounded up to
    /// integer multiples of the rounded `size`, with `max >= min`.
    /// `max_level = min_level = 0` yields an effectively unbounded
    /// wrapper around the system allocator (boundary behaviour, §8).
    pub fn new(size: usize, min_level: usize, max_level: usize) -> Self {
        let size = round_up_to_multiple(size.max(MIN_BUFFER_SIZE), MIN_BUFFER_SIZE);
        let min_level = round_up_to_multiple(min_level, size);
        let max_level = round_up_to_multiple(max_level.max(min_level), size);

        let inner = Rc::new(RefCell::new(PoolInner {
            size,
            min_level,
            max_level,
            free: Vec::new(),
            available: 0,
            tier: FillTier::Ok,
            total_allocated_bytes: 0,
            wakeup_hook: None,
        }));

        {
            let mut guard = inner.borrow_mut();
            while guard.available < guard.max_level {
                guard.free.push(vec![0u8; size].into_boxed_slice());
                guard.available += size;
                guard.total_allocated_bytes += size;
            }
            guard.tier = FillTier::from_levels(guard.available, guard.min_level, guard.max_level);
        }

        BufferPool { inner, size }
    }

    /// Register the closure the pool invokes after every successful
    /// `free`, when at least one buffer was returned. The scheduler
    /// wires this to `buffer_wakeup_all` (§4.3) without the pool
    /// needing to know anything about requests or sessions.
    pub fn set_wakeup_hook(&self, hook: Rc<dyn Fn()>) {
        self.inner.borrow_mut().wakeup_hook = Some(hook);
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn available_percent(&self) -> f64 {
        let inner = self.inner.borrow();
        if inner.max_level == 0 {
            100.0
        } else {
            (inner.available as f64 / inner.max_level as f64) * 100.0
        }
    }

    pub fn tier(&self) -> FillTier {
        self.inner.borrow().tier
    }

    pub fn alloc_tier(&self) -> AllocTier {
        AllocTier::from_percent(self.available_percent())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.borrow();
        PoolStats {
            available: inner.available,
            tier: inner.tier,
            idle_buffers: inner.free.len(),
            buffer_size: self.size,
            total_allocated_bytes: inner.total_allocated_bytes,
        }
    }

    /// Grant a buffer to a caller at `priority` (0 = urgent, 1 =
    /// fair, 2 = opportunistic), subject to the current [`AllocTier`].
    /// Returns [`Error::OutOfMemoryByPolicy`] when the tier denies
    /// this priority — callers turn that into `buffer_wait`, not a
    /// surfaced error (§7).
    pub fn alloc(&self, priority: u8) -> Result<Buffer> {
        if !self.alloc_tier().admits(priority) {
            return Err(Error::OutOfMemoryByPolicy);
        }

        let data = {
            let mut inner = self.inner.borrow_mut();
            if let Some(data) = inner.free.pop() {
                inner.available -= data.len();
                data
            } else {
                inner.total_allocated_bytes += self.size;
                vec![0u8; self.size].into_boxed_slice()
            }
        };

        self.inner.borrow_mut().recompute_tier(&self.inner);
        Ok(Buffer::new(data, Rc::downgrade(&self.inner)))
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        BufferPool {
            inner: self.inner.clone(),
            size: self.size,
        }
    }
}
