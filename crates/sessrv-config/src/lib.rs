//! Scheduler and buffer pool configuration.
//!
//! One explicit [`SchedulerConfig`] travels with the
//! [`sessrv_scheduler::Scheduler`](../sessrv_scheduler/struct.Scheduler.html)
//! handle rather than being read from hidden process globals, per the
//! "Global singletons" design note: config is passed in, not reached
//! for.

pub mod env;

use env::{env_get, env_get_bool};
use std::time::Duration;

/// Minimum buffer capacity in bytes (§3 `MIN`). Every pool buffer is
/// rounded up to at least this size.
pub const MIN_BUFFER_SIZE: usize = 128;

/// Pipeline length ceiling before the session stops synthesising
/// incoming requests (§4.4 step 4a).
pub const DEFAULT_MAX_INPUT_QUEUE: usize = 10;

/// Input-buffer-in-use ceiling, same gate as `max_input_queue`.
pub const DEFAULT_MAX_INPUT_BUFFERS_USED: usize = 2;

/// Tuning knobs for the scheduler and the buffer pool it hands out
/// buffers from. Build with [`SchedulerConfig::new`] and the builder
/// methods, or take [`SchedulerConfig::default`] which reads
/// `SESSRV_*` environment overrides.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Deadline granted to a session on entry when the request being
    /// serviced is not on its very first slice (§4.4 "short on first
    /// entry, long on a request's very first slice" — the more
    /// generous slice is the *first* entry, this is the steady-state
    /// one).
    pub short_time_slice: Duration,
    /// Deadline granted on a request's very first processing slice.
    pub long_time_slice: Duration,
    /// Pipeline length ceiling before input-request synthesis stops.
    pub max_input_queue: usize,
    /// Input-buffers-in-use ceiling, same gate.
    pub max_input_buffers_used: usize,
    /// Approximate period of the sleep-tick callback (§4.5).
    pub sleep_tick_interval: Duration,
    /// Per-buffer byte size handed to `sessrv_buffer::BufferPool`,
    /// rounded up to a multiple of [`MIN_BUFFER_SIZE`].
    pub buffer_size: usize,
    /// Pool low-water mark in bytes.
    pub buffer_pool_min_level: usize,
    /// Pool high-water mark in bytes.
    pub buffer_pool_max_level: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            short_time_slice: Duration::from_millis(env_get("SESSRV_SHORT_SLICE_MS", 10)),
            long_time_slice: Duration::from_millis(env_get("SESSRV_LONG_SLICE_MS", 100)),
            max_input_queue: env_get("SESSRV_MAX_INPUT_QUEUE", DEFAULT_MAX_INPUT_QUEUE),
            max_input_buffers_used: env_get(
                "SESSRV_MAX_INPUT_BUFFERS_USED",
                DEFAULT_MAX_INPUT_BUFFERS_USED,
            ),
            sleep_tick_interval: Duration::from_millis(env_get("SESSRV_SLEEP_TICK_MS", 1000)),
            buffer_size: env_get("SESSRV_BUFFER_SIZE", 4096usize).max(MIN_BUFFER_SIZE),
            buffer_pool_min_level: env_get("SESSRV_POOL_MIN_LEVEL", 4 * 4096usize),
            buffer_pool_max_level: env_get("SESSRV_POOL_MAX_LEVEL", 64 * 4096usize),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn short_time_slice(mut self, d: Duration) -> Self {
        self.short_time_slice = d;
        self
    }

    pub fn long_time_slice(mut self, d: Duration) -> Self {
        self.long_time_slice = d;
        self
    }

    pub fn max_input_queue(mut self, n: usize) -> Self {
        self.max_input_queue = n;
        self
    }

    pub fn max_input_buffers_used(mut self, n: usize) -> Self {
        self.max_input_buffers_used = n;
        self
    }

    pub fn sleep_tick_interval(mut self, d: Duration) -> Self {
        self.sleep_tick_interval = d;
        self
    }

    pub fn buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n.max(MIN_BUFFER_SIZE);
        self
    }

    pub fn buffer_pool_levels(mut self, min_level: usize, max_level: usize) -> Self {
        self.buffer_pool_min_level = min_level;
        self.buffer_pool_max_level = max_level.max(min_level);
        self
    }

    /// Whether `SESSRV_DEBUG_LOGGING` requests verbose scheduler
    /// logging in addition to whatever `SESSRV_LOG_LEVEL` sets.
    pub fn debug_logging_requested() -> bool {
        env_get_bool("SESSRV_DEBUG_LOGGING", false)
    }
}
