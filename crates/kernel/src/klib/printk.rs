// Kernel logging (printk) with ring buffer

use super::ringbuf::RingBuffer;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Global log level (default: INFO)
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

pub const LOG_LINE_MAX: usize = 192;

/// One formatted log line retained in the ring buffer.
#[derive(Clone, Copy)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: [u8; LOG_LINE_MAX],
    pub len: usize,
}

impl LogEntry {
    pub fn text(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<invalid utf8>")
    }
}

static LOG_BUFFER: Mutex<RingBuffer<LogEntry, 256>> = Mutex::new(RingBuffer::new());

/// Formatter writing into a fixed line buffer, truncating on overflow.
struct LineWriter {
    buf: [u8; LOG_LINE_MAX],
    len: usize,
}

impl Write for LineWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LOG_LINE_MAX - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Record one log line: into the ring buffer, then out to the console sink.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }

    let mut writer = LineWriter {
        buf: [0; LOG_LINE_MAX],
        len: 0,
    };
    let _ = writer.write_fmt(args);

    let entry = LogEntry {
        timestamp_ms: crate::time::system_time(),
        level,
        message: writer.buf,
        len: writer.len,
    };

    LOG_BUFFER.lock().push(entry);
    console_write(level, entry.text());
}

/// Drain retained log entries (diagnostics, tests).
pub fn drain() -> alloc::vec::Vec<LogEntry> {
    LOG_BUFFER.lock().drain_all()
}

#[cfg(target_arch = "x86")]
fn console_write(level: LogLevel, text: &str) {
    crate::arch::serial::write_str("[");
    crate::arch::serial::write_str(level.as_str());
    crate::arch::serial::write_str("] ");
    crate::arch::serial::write_str(text);
    crate::arch::serial::write_str("\n");
}

#[cfg(not(target_arch = "x86"))]
fn console_write(_level: LogLevel, _text: &str) {}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::klib::printk::log($crate::klib::printk::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::klib::printk::log($crate::klib::printk::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::klib::printk::log($crate::klib::printk::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::klib::printk::log($crate::klib::printk::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_filter() {
        let _guard = crate::test_utils::serialize();
        set_level(LogLevel::Warn);
        assert!(is_enabled(LogLevel::Error));
        assert!(is_enabled(LogLevel::Warn));
        assert!(!is_enabled(LogLevel::Info));
        set_level(LogLevel::Info);
    }

    #[test]
    fn entries_are_retained() {
        let _guard = crate::test_utils::serialize();
        set_level(LogLevel::Info);
        crate::info!("mount {} at {}", "ext2", "/");
        let drained = drain();
        assert!(drained.iter().any(|e| e.text().contains("mount ext2 at /")));
    }
}
