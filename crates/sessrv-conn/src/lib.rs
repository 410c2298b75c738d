//! Buffered connection: queued I/O buffers, capability flags, and the
//! sticky error mask (§4.2).
//!
//! A [`BufferedConnection`] owns no file descriptor itself — it is
//! driven by whatever implements [`RawIo`], the way `ksvc-core`'s
//! `IoBackend` separates the buffer/queue bookkeeping from the
//! backend doing the actual syscalls. Here there is exactly one
//! backend (blocking or non-blocking POSIX-style read/write), so the
//! trait is a thin seam rather than a pluggable-backend hierarchy.

use std::io;

use sessrv_buffer::{Buffer, BufferPool, BufferQueue, HookProgress};
use sessrv_error::{Error, Result};
use sessrv_log::slog_warn;

/// What the transport side of a connection actually does. Mirrors
/// the read/write half of a nonblocking socket: `WouldBlock` means
/// "try again later", any other `Err` is a real I/O error.
pub trait RawIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// The sticky {READ, WRITE, TRANSPORT} error mask. Bits only ever get
/// set, never cleared, until the connection itself is torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorMask(u8);

impl ErrorMask {
    pub const READ: ErrorMask = ErrorMask(1 << 0);
    pub const WRITE: ErrorMask = ErrorMask(1 << 1);
    pub const TRANSPORT: ErrorMask = ErrorMask(1 << 2);

    pub fn set(&mut self, bit: ErrorMask) {
        self.0 |= bit.0;
    }

    pub fn has(&self, bit: ErrorMask) -> bool {
        self.0 & bit.0 != 0
    }

    pub fn is_clear(&self) -> bool {
        self.0 == 0
    }
}

/// The five-plus-one independent boolean capabilities from §3.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub data_waiting_to_be_read: bool,
    pub input_buffer_capacity_available: bool,
    pub input_waiting_to_be_parsed: bool,
    pub write_capacity_available: bool,
    pub output_buffer_capacity_available: bool,
    pub output_waiting_to_be_written: bool,
}

/// Owns the input and output [`BufferQueue`]s, the capability flags,
/// the sticky error mask, and the `have_priority` flag (§3).
pub struct BufferedConnection {
    pool: BufferPool,
    input: BufferQueue,
    output: BufferQueue,
    pub caps: Capabilities,
    pub errors: ErrorMask,
    pub errno: Option<i32>,
    pub have_priority: bool,
}

impl BufferedConnection {
    pub fn new(pool: BufferPool) -> Self {
        BufferedConnection {
            pool,
            input: BufferQueue::new(),
            output: BufferQueue::new(),
            caps: Capabilities {
                write_capacity_available: true,
                ..Default::default()
            },
            errors: ErrorMask::default(),
            errno: None,
            have_priority: false,
        }
    }

    fn raise(&mut self, bit: ErrorMask, errno: Option<i32>) {
        self.errors.set(bit);
        if self.errno.is_none() {
            self.errno = errno;
        }
    }

    /// `write_ready`: run the head output buffer's pre-flush hook, if
    /// any, blockingly (`blocking = true`). Returns `Ok(true)` when
    /// the hook is done (or absent), `Ok(false)` when it needs more
    /// time, `Err` if the hook itself failed (raises the WRITE bit).
    pub fn write_ready(&mut self) -> Result<bool> {
        let Some(head) = self.output.front() else {
            return Ok(true);
        };
        let Some(hook) = head.pre_hook() else {
            return Ok(true);
        };
        match hook.borrow_mut()(true) {
            Ok(HookProgress::Done) => {
                head.clear_pre_hook();
                Ok(true)
            }
            Ok(HookProgress::More) => Ok(false),
            Err(e) => {
                self.raise(ErrorMask::WRITE, None);
                Err(e)
            }
        }
    }

    /// `write(fd, ed)`: drains the output queue into `io`. Returns
    /// whether any byte was written.
    pub fn write(&mut self, io: &mut dyn RawIo) -> bool {
        let mut progressed = false;
        let mut first_iteration = true;

        loop {
            let Some(head) = self.output.front().cloned() else {
                break;
            };

            if let Some(hook) = head.pre_hook() {
                let blocking = first_iteration;
                match hook.borrow_mut()(blocking) {
                    Ok(HookProgress::Done) => head.clear_pre_hook(),
                    Ok(HookProgress::More) => break,
                    Err(_) => {
                        self.raise(ErrorMask::WRITE, None);
                        break;
                    }
                }
            }

            let to_write = head.unparsed_len();
            if to_write == 0 {
                if !self.recycle_output_head(&head) {
                    // Head stayed put (nothing to evict it for yet) and
                    // has no more bytes to offer this call; looping
                    // again would just re-run the same check forever.
                    break;
                }
                first_iteration = false;
                continue;
            }

            let write_result = head.with_unparsed(|slice| io.write(slice));
            match write_result {
                Ok(0) => break,
                Ok(n) => {
                    head.set_consumed(head.consumed() + n);
                    progressed = true;
                    if head.is_fully_consumed() {
                        self.recycle_output_head(&head);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.caps.write_capacity_available = false;
                    break;
                }
                Err(e) => {
                    slog_warn!("connection write error: {e}");
                    self.raise(ErrorMask::WRITE, e.raw_os_error());
                    break;
                }
            }
            first_iteration = false;
        }

        self.caps.output_waiting_to_be_written = self
            .output
            .front()
            .map(|b| !b.is_fully_consumed())
            .unwrap_or(false);
        progressed
    }

    /// Returns whether the head buffer was actually evicted.
    fn recycle_output_head(&mut self, head: &Buffer) -> bool {
        let has_successor = self.output.q_n() > 1;
        // Reads "below Fair" as "Fair or Scarce", not "Scarce only" —
        // recycling kicks in a tier earlier than the literal ordering
        // would require (see DESIGN.md Open Questions).
        let tier_below_fair = !matches!(self.pool.alloc_tier(), sessrv_buffer::AllocTier::Generous);
        let little_slack = head.slack() < head.capacity() / 8;
        if has_successor || tier_below_fair || little_slack {
            self.output.pop_front();
            true
        } else {
            false
        }
    }

    /// `read(fd, ed)`: fills the tail input buffer in a loop until a
    /// short read or a full buffer. Returns whether any byte was read.
    pub fn read(&mut self, io: &mut dyn RawIo) -> bool {
        let mut progressed = false;

        loop {
            if self.input.front().map(|b| b.is_full()).unwrap_or(true) {
                match self.pool.alloc(1) {
                    Ok(fresh) => self.input.push_back(fresh),
                    Err(_) => {
                        self.caps.input_buffer_capacity_available = false;
                        break;
                    }
                }
            }
            self.caps.input_buffer_capacity_available = true;

            let tail = self.input.front().cloned().expect("just ensured a tail buffer");
            let read_result = tail.with_tail_mut(|slice| io.read(slice));
            match read_result {
                Ok(0) => {
                    self.raise(ErrorMask::READ, None);
                    self.caps.data_waiting_to_be_read = false;
                    break;
                }
                Ok(n) => {
                    tail.advance_produced(n);
                    progressed = true;
                    self.caps.input_waiting_to_be_parsed = true;
                    if tail.is_full() {
                        self.caps.input_buffer_capacity_available = false;
                        continue;
                    }
                    self.caps.data_waiting_to_be_read = false;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.caps.data_waiting_to_be_read = false;
                    break;
                }
                Err(e) => {
                    slog_warn!("connection read error: {e}");
                    self.raise(ErrorMask::READ, e.raw_os_error());
                    break;
                }
            }
        }

        progressed
    }

    /// `input_lookahead`: the current parse window of the head input
    /// buffer, or `None` if there is no unparsed data.
    pub fn input_lookahead(&self) -> Option<Buffer> {
        self.input.front().filter(|b| !b.is_fully_consumed()).cloned()
    }

    /// `input_commit(end)`: the parser consumed up to `end` of the
    /// head buffer. Dequeues the head buffer if it is now fully
    /// consumed and either a successor exists or remaining slack is
    /// too small to bother reading into again.
    pub fn input_commit(&mut self, buf: &Buffer, end: usize) {
        buf.set_consumed(end);
        if !buf.is_fully_consumed() {
            return;
        }
        let has_successor = self.input.q_n() > 1;
        let little_slack = buf.slack() < buf.capacity() / 8;
        if has_successor || little_slack {
            self.input.pop_front();
        }
        self.caps.input_waiting_to_be_parsed = self
            .input
            .front()
            .map(|b| !b.is_fully_consumed())
            .unwrap_or(false);
    }

    /// `output_lookahead(min_size)`: a writable tail region of at
    /// least `min_size` bytes, allocating a fresh tail buffer from
    /// the pool if needed. `min_size` must be `<= MIN_BUFFER_SIZE`.
    pub fn output_lookahead(&mut self, min_size: usize) -> Result<Buffer> {
        let need_new = self
            .output
            .front()
            .map(|b| b.slack() < min_size)
            .unwrap_or(true);
        if need_new {
            let priority = if self.have_priority { 0 } else { 1 };
            let fresh = self.pool.alloc(priority)?;
            self.output.push_back(fresh);
        }
        self.caps.output_buffer_capacity_available = true;
        Ok(self.output.front().cloned().expect("just ensured a tail buffer"))
    }

    /// `output_commit(end)`: bytes `[n..end)` of the current output
    /// tail buffer are now formatted.
    pub fn output_commit(&mut self, buf: &Buffer, end: usize) {
        let advance = end - buf.produced();
        buf.advance_produced(advance);
        self.caps.output_waiting_to_be_written = true;
    }

    /// `input_clear_unparsed`: discard all queued input, used after a
    /// read error has been raised and surfaced to the application.
    pub fn input_clear_unparsed(&mut self) {
        while self.input.pop_front().is_some() {}
        self.caps.input_waiting_to_be_parsed = false;
    }

    /// `attach_pre_hook`: associate a flush closure with the current
    /// output tail buffer, idempotently.
    pub fn attach_pre_hook(&mut self, hook: sessrv_buffer::PreHook) -> Result<sessrv_buffer::PreHook> {
        let buf = self.output.front().ok_or(Error::Internal("attach_pre_hook with no output buffer"))?;
        Ok(buf.attach_pre_hook(hook))
    }

    pub fn is_healthy(&self) -> bool {
        self.errors.is_clear()
    }

    pub fn input_buffer_count(&self) -> usize {
        self.input.q_n()
    }

    pub fn output_buffer_count(&self) -> usize {
        self.output.q_n()
    }

    /// Proactively top up input-buffer capacity at `priority`, ahead
    /// of the next `read()`, so a session's post-pass can decide
    /// whether to `buffer_wait` a request before the transport is
    /// even polled again (§4.4 step 4c).
    pub fn ensure_input_capacity(&mut self, priority: u8) -> Result<()> {
        if self.input.front().map(|b| !b.is_full()).unwrap_or(false) {
            self.caps.input_buffer_capacity_available = true;
            return Ok(());
        }
        let fresh = self.pool.alloc(priority)?;
        self.caps.input_buffer_capacity_available = true;
        self.input.push_back(fresh);
        Ok(())
    }

    /// Proactively top up output-buffer capacity (§4.4 step 4d).
    pub fn ensure_output_capacity(&mut self, priority: u8) -> Result<()> {
        if self
            .output
            .front()
            .map(|b| b.slack() > 0)
            .unwrap_or(false)
        {
            self.caps.output_buffer_capacity_available = true;
            return Ok(());
        }
        let fresh = self.pool.alloc(priority)?;
        self.caps.output_buffer_capacity_available = true;
        self.output.push_back(fresh);
        Ok(())
    }
}
