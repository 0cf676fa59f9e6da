use thiserror::Error;

/// Error categories the arena/registry/device layer recognises.
///
/// `RangeInvariantViolation` and `RegistryNotFound` describe allocator
/// corruption rather than a recoverable request failure; call sites that
/// detect them should go through [`abort_corrupted`] instead of returning
/// this variant up an API boundary meant for ordinary callers.
#[derive(Error, Debug)]
pub enum SicmError {
    #[error("allocation would exceed arena max_size")]
    CapacityExceeded,

    #[error("OS mapping primitive failed: {0}")]
    OsMappingFailed(#[source] std::io::Error),

    #[error("page migration failed for range [{start:#x}, {end:#x}): {source}")]
    BindingFailed {
        start: usize,
        end: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("range set invariant violated: {0}")]
    RangeInvariantViolation(String),

    #[error("pointer {0:#x} has no enclosing range in the extent registry")]
    RegistryNotFound(usize),

    #[error("failed to resolve hardware event '{0}'")]
    EventDecodeFailed(String),

    #[error("invalid device index {0}")]
    InvalidDevice(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SicmError>;

/// Abort the process after logging a diagnostic naming the offending range.
///
/// Used for `RangeInvariantViolation` and non-null `RegistryNotFound`: both
/// imply the allocator's own bookkeeping is inconsistent, a condition
/// there's no meaningful `Result` recovery for.
pub fn abort_corrupted(err: &SicmError) -> ! {
    tracing::error!(error = %err, "allocator invariant violated, aborting");
    std::process::abort()
}
