//! Kernel-style print macros for the sessrv scheduler.
//!
//! One OS thread per worker process runs the whole scheduler (§5 is
//! single-threaded cooperative), so "current context" is just the
//! session and request the scheduler happens to be servicing right
//! now — tracked in thread-locals and stamped onto every line.
//!
//! # Environment Variables
//!
//! - `SESSRV_LOG_LEVEL=<level>` — off/error/warn/info/debug/trace or 0-5
//! - `SESSRV_FLUSH_LOG=1` — flush stderr after every line
//! - `SESSRV_LOG_TIME=1` — prefix each line with elapsed nanoseconds
//!
//! # Output Format
//!
//! `[LEVEL] [s<session>:r<request>] message`, e.g.
//! `[DEBUG] [s12:r104] request done: OUTPUT`
//! `[INFO]  [s--:r--] pool tier -> LOW`

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static START_TIME: OnceLock<Instant> = OnceLock::new();

fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Initialize logging from environment variables. Called lazily on
/// first use; exposed for deterministic setup in tests and `main`.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    START_TIME.get_or_init(Instant::now);
    FLUSH_ENABLED.store(env_get_bool("SESSRV_FLUSH_LOG", false), Ordering::Relaxed);
    TIME_ENABLED.store(env_get_bool("SESSRV_LOG_TIME", false), Ordering::Relaxed);
    if let Ok(val) = std::env::var("SESSRV_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
fn time_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    TIME_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

#[inline]
fn elapsed_ns() -> u64 {
    let start = START_TIME.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

thread_local! {
    static SESSION_ID: Cell<Option<u64>> = const { Cell::new(None) };
    static REQUEST_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Set the session being serviced on this thread. Call at the top of
/// the session processing loop (§4.4).
pub fn set_session_id(id: u64) {
    SESSION_ID.with(|s| s.set(Some(id)));
}

pub fn clear_session_id() {
    SESSION_ID.with(|s| s.set(None));
}

/// Set the request currently holding the scheduler's attention.
pub fn set_request_id(id: u64) {
    REQUEST_ID.with(|r| r.set(Some(id)));
}

pub fn clear_request_id() {
    REQUEST_ID.with(|r| r.set(None));
}

pub fn get_session_id() -> Option<u64> {
    SESSION_ID.with(|s| s.get())
}

pub fn get_request_id() -> Option<u64> {
    REQUEST_ID.with(|r| r.get())
}

fn format_context() -> String {
    let session = match get_session_id() {
        Some(id) => format!("s{id}"),
        None => "s--".to_string(),
    };
    let request = match get_request_id() {
        Some(id) => format!("r{id}"),
        None => "r--".to_string(),
    };
    format!("[{session}:{request}]")
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    if time_enabled() {
        let _ = write!(handle, "[{}] ", elapsed_ns());
    }
    let _ = write!(handle, "{} ", format_context());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[macro_export]
macro_rules! slog_error {
    ($($arg:tt)*) => {
        $crate::_log_impl($crate::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_warn {
    ($($arg:tt)*) => {
        $crate::_log_impl($crate::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_info {
    ($($arg:tt)*) => {
        $crate::_log_impl($crate::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_debug {
    ($($arg:tt)*) => {
        $crate::_log_impl($crate::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_trace {
    ($($arg:tt)*) => {
        $crate::_log_impl($crate::LogLevel::Trace, format_args!($($arg)*))
    };
}
