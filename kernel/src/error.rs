//! Kernel error types.
//!
//! Errors carry enough context to be logged once at the failure site and
//! then propagated with `?`. Device-absence and negotiation failures are
//! ordinary errors: the kernel logs them and continues without the device.
//! Only invariant loss (no memory map, idle task exiting, a context switch
//! returning) escalates to `panic!`.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
        available: usize,
    },
    InvalidAddress {
        addr: u64,
    },
    UnmappedMemory {
        addr: u64,
    },
    /// A 4 KiB mapping request landed inside an existing huge-page mapping.
    HugePageConflict {
        virt: u64,
    },

    /// Device errors
    DeviceAbsent {
        device: &'static str,
    },
    NegotiationFailed {
        device: &'static str,
    },
    HardwareError {
        device: &'static str,
        code: u32,
    },
    /// Bounded poll gave up.
    Timeout {
        operation: &'static str,
        spins: u32,
    },

    /// Scheduler-related errors
    SchedulerError(SchedError),

    /// Network-related errors
    NetError(NetError),

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
        id: u64,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    NotInitialized {
        subsystem: &'static str,
    },
    /// Operation would block
    WouldBlock,
}

/// Scheduler-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No free slot in the process table
    TableFull,
    TaskNotFound { pid: u32 },
    /// Task is not in a state that permits the transition
    BadTransition,
}

/// Network-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Frame or packet shorter than its mandatory header
    FrameTooShort,
    /// Ethertype or IP protocol the stack does not speak
    UnsupportedProtocol,
    ChecksumMismatch,
    /// Gateway MAC could not be resolved in time
    GatewayUnresolved,
    /// Destination is neither our address nor broadcast
    NotOurAddress,
    /// No network device has been registered
    NoDevice,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "Out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "Unmapped memory at {:#x}", addr),
            Self::HugePageConflict { virt } => {
                write!(f, "Mapping at {:#x} conflicts with a huge page", virt)
            }
            Self::DeviceAbsent { device } => write!(f, "Device not present: {}", device),
            Self::NegotiationFailed { device } => {
                write!(f, "Feature negotiation failed for {}", device)
            }
            Self::HardwareError { device, code } => {
                write!(f, "Hardware error on {}: code {:#x}", device, code)
            }
            Self::Timeout { operation, spins } => {
                write!(f, "Timeout during {} after {} spins", operation, spins)
            }
            Self::SchedulerError(e) => write!(f, "Scheduler error: {:?}", e),
            Self::NetError(e) => write!(f, "Network error: {:?}", e),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} with id {} already exists", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
            Self::WouldBlock => write!(f, "Operation would block"),
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedulerError(err)
    }
}

impl From<NetError> for KernelError {
    fn from(err: NetError) -> Self {
        Self::NetError(err)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = KernelError::OutOfMemory {
            requested: 4096,
            available: 0,
        };
        let mut buf = alloc::string::String::new();
        core::fmt::write(&mut buf, format_args!("{}", err)).unwrap();
        assert!(buf.contains("4096"));
    }

    #[test]
    fn test_subsystem_error_conversion() {
        fn inner() -> KernelResult<()> {
            Err(SchedError::TableFull)?
        }
        assert_eq!(
            inner(),
            Err(KernelError::SchedulerError(SchedError::TableFull))
        );
    }
}
