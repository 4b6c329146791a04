//! System time
//!
//! Millisecond counter advanced by the timer interrupt. All sleep and
//! timeout arithmetic in the kernel is in milliseconds against this
//! counter.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer tick period in milliseconds (PIT programmed to 100 Hz).
pub const TICK_MS: u64 = 10;

/// Timeout sentinel meaning "never give up", in milliseconds.
pub const INFINITY: u64 = u64::MAX;

static SYSTEM_TIME_MS: AtomicU64 = AtomicU64::new(0);

/// Current system time in milliseconds since boot.
pub fn system_time() -> u64 {
    SYSTEM_TIME_MS.load(Ordering::Relaxed)
}

/// Advance the clock by one timer period. Called from the timer IRQ tail.
pub fn tick() {
    SYSTEM_TIME_MS.fetch_add(TICK_MS, Ordering::Relaxed);
}

/// Deadline for a finite timeout, saturating for `INFINITY`.
pub fn deadline_after(timeout_ms: u64) -> u64 {
    if timeout_ms == INFINITY {
        INFINITY
    } else {
        system_time().saturating_add(timeout_ms)
    }
}

/// Force the clock for deterministic tests.
#[cfg(test)]
pub fn set_system_time(ms: u64) {
    SYSTEM_TIME_MS.store(ms, Ordering::Relaxed);
}
