// Shared helpers for host-side tests.

/// Serializes tests that touch global kernel state (frame allocator,
/// scheduler tables, mount table). The harness runs tests on several
/// threads; the kernel proper is single-CPU.
pub fn serialize() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
