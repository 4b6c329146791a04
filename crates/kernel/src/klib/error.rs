// Kernel error handling

/// Error kinds surfaced by kernel subsystems.
///
/// Functions return these and callers propagate them verbatim unless they
/// have a compensating action. Only the fault dispatcher converts errors
/// into `die()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Null pointer, out-of-range value, bad signature, unsupported flags.
    InvalidArgument,
    /// Path does not resolve, entry absent.
    NotFound,
    /// Buddy, heap or region exhausted.
    OutOfMemory,
    /// Disk read/write failed, block mapping refused.
    Io,
    /// Write on a read-only mount, kill on the kernel process, and kin.
    PermissionDenied,
    /// Operation in the wrong state (e.g. read on an enumeration handle).
    InvalidState,
    /// Explicitly unimplemented branch (ELF loader, inflate paths).
    NotImplemented,
    /// A finite wait elapsed before the condition held.
    TimedOut,
    /// Resource busy (e.g. unmount with open files).
    Busy,
    /// Object already exists where exclusivity was requested.
    AlreadyExists,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl KernelError {
    /// Static description for log output.
    pub fn description(self) -> &'static str {
        match self {
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NotFound => "not found",
            KernelError::OutOfMemory => "out of memory",
            KernelError::Io => "input/output error",
            KernelError::PermissionDenied => "permission denied",
            KernelError::InvalidState => "invalid state",
            KernelError::NotImplemented => "not implemented",
            KernelError::TimedOut => "timed out",
            KernelError::Busy => "busy",
            KernelError::AlreadyExists => "already exists",
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.description())
    }
}
