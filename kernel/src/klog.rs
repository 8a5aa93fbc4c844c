//! Structured kernel log service
//!
//! A fixed-size, heap-free circular buffer of structured log entries. Each
//! entry carries a tick timestamp, severity level, subsystem tag, and a
//! fixed-length message. Once full the buffer wraps and silently overwrites
//! the oldest entries. The serial console remains the primary log sink; this
//! buffer exists so that tasks (a future monitor, the test harness) can read
//! recent kernel events back without re-parsing serial output.

use spin::Mutex;

/// Maximum number of log entries the circular buffer can hold.
const LOG_BUFFER_CAPACITY: usize = 256;

/// Maximum length (in bytes) of a log message stored in a [`LogEntry`].
const LOG_MESSAGE_MAX_LEN: usize = 96;

/// Maximum length (in bytes) of the subsystem tag in a [`LogEntry`].
const LOG_SUBSYSTEM_MAX_LEN: usize = 12;

/// Severity levels for kernel log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Unrecoverable or critical errors.
    Error = 0,
    /// Conditions that may indicate a problem.
    Warn = 1,
    /// Normal operational messages.
    Info = 2,
    /// Verbose diagnostic output.
    Debug = 3,
}

/// A single structured log entry. Fields are stored inline with fixed-size
/// arrays so entries never touch the heap.
#[derive(Clone, Copy)]
pub struct LogEntry {
    /// Timer tick at which the entry was recorded.
    pub tick: u64,
    pub level: LogLevel,
    subsystem: [u8; LOG_SUBSYSTEM_MAX_LEN],
    subsystem_len: u8,
    message: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            tick: 0,
            level: LogLevel::Info,
            subsystem: [0; LOG_SUBSYSTEM_MAX_LEN],
            subsystem_len: 0,
            message: [0; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    /// Subsystem tag as a string slice.
    pub fn subsystem(&self) -> &str {
        core::str::from_utf8(&self.subsystem[..self.subsystem_len as usize]).unwrap_or("?")
    }

    /// Message as a string slice.
    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.message[..self.message_len as usize]).unwrap_or("?")
    }
}

struct KlogBuffer {
    entries: [LogEntry; LOG_BUFFER_CAPACITY],
    /// Index of the next slot to overwrite.
    next: usize,
    /// Total entries ever written (not capped at capacity).
    written: u64,
}

impl KlogBuffer {
    const fn new() -> Self {
        Self {
            entries: [LogEntry::empty(); LOG_BUFFER_CAPACITY],
            next: 0,
            written: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.next] = entry;
        self.next = (self.next + 1) % LOG_BUFFER_CAPACITY;
        self.written += 1;
    }
}

static KLOG: Mutex<KlogBuffer> = Mutex::new(KlogBuffer::new());

fn copy_truncated(dst: &mut [u8], src: &str) -> u8 {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    n as u8
}

/// Record a structured log entry.
pub fn klog(level: LogLevel, subsystem: &str, message: &str) {
    let mut entry = LogEntry::empty();
    entry.tick = crate::arch::x86_64::timer::ticks();
    entry.level = level;
    entry.subsystem_len = copy_truncated(&mut entry.subsystem, subsystem);
    entry.message_len = copy_truncated(&mut entry.message, message);

    KLOG.lock().push(entry);
}

/// Number of entries ever recorded.
pub fn log_count() -> u64 {
    KLOG.lock().written
}

/// Visit the buffered entries, oldest first.
pub fn for_each_entry(mut f: impl FnMut(&LogEntry)) {
    let buf = KLOG.lock();
    let stored = (buf.written as usize).min(LOG_BUFFER_CAPACITY);
    let start = (buf.next + LOG_BUFFER_CAPACITY - stored) % LOG_BUFFER_CAPACITY;
    for i in 0..stored {
        f(&buf.entries[(start + i) % LOG_BUFFER_CAPACITY]);
    }
}
