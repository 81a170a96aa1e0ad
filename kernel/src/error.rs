//! Error types for the VibeOS kernel
//!
//! One top-level [`KernelError`] covers the cross-cutting failure kinds;
//! the filesystem, network and ELF loader carry their own enums that
//! convert into it. Errors are returned, never raised -- there is no
//! unwinding in the kernel.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Heap exhausted or region too small
    OutOfMemory {
        requested: usize,
    },
    /// A device reported an unrecoverable failure
    HardwareError {
        device: &'static str,
        code: u32,
    },
    /// The platform does not provide this device or capability
    Unsupported {
        what: &'static str,
    },
    /// Subsystem used before its init() ran
    NotInitialized {
        subsystem: &'static str,
    },
    /// A caller-supplied value was rejected
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// An operation did not complete within its deadline
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },
    /// The operation cannot make progress yet; retry after polling
    WouldBlock,
    /// A fixed-capacity kernel table is full
    ResourceExhausted {
        resource: &'static str,
    },

    /// Filesystem-related errors
    FsError(FsError),
    /// Network-related errors
    NetError(NetError),
    /// ELF loader errors
    ElfError(ElfError),
    /// Process substrate errors
    ProcessError(ProcessError),
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// Path already exists
    AlreadyExists,
    /// Target is not a directory
    NotADirectory,
    /// Target is a directory (when a file was expected)
    IsADirectory,
    /// No free cluster or directory slot left on the volume
    OutOfSpace,
    /// I/O error from the block layer
    IoError,
    /// Volume is not FAT32 (or the BPB is malformed)
    InvalidVolume,
    /// Path component too long or malformed
    InvalidPath,
    /// Filesystem used before mount()
    NotMounted,
}

/// Network-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Frame or packet failed header validation
    MalformedPacket,
    /// Payload exceeds the device MTU
    PacketTooLarge,
    /// Next-hop MAC unknown; an ARP request was issued, retry later
    ArpUnresolved,
    /// ARP resolution or echo reply did not arrive in time
    Timeout,
    /// The NIC driver rejected the transmit
    DeviceError,
}

/// ELF loader errors, one per failed validation check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Image shorter than the ELF header
    TooShort,
    /// Missing 0x7F 'E' 'L' 'F'
    BadMagic,
    /// Not ELFCLASS64
    Not64Bit,
    /// Not little-endian
    NotLittleEndian,
    /// Machine is not AArch64
    WrongMachine,
    /// Type is not ET_EXEC
    NotExecutable,
    /// Program header table or a segment lies outside the image
    SegmentOutOfBounds,
}

/// Process substrate errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// exec target missing from the filesystem
    NotFound,
    /// exec target is a directory
    IsADirectory,
    /// exec target has zero length
    EmptyImage,
    /// Could not allocate the image buffer or the process stack
    OutOfMemory,
    /// The image failed ELF validation or loading
    LoadFailed(ElfError),
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: requested {} bytes", requested)
            }
            Self::HardwareError { device, code } => {
                write!(f, "hardware error on {}: code 0x{:x}", device, code)
            }
            Self::Unsupported { what } => write!(f, "not supported on this platform: {}", what),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::Timeout {
                operation,
                duration_ms,
            } => write!(f, "timeout during {}: {} ms", operation, duration_ms),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::FsError(e) => write!(f, "filesystem error: {:?}", e),
            Self::NetError(e) => write!(f, "network error: {:?}", e),
            Self::ElfError(e) => write!(f, "ELF error: {:?}", e),
            Self::ProcessError(e) => write!(f, "process error: {:?}", e),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}

impl From<NetError> for KernelError {
    fn from(err: NetError) -> Self {
        Self::NetError(err)
    }
}

impl From<ElfError> for KernelError {
    fn from(err: ElfError) -> Self {
        Self::ElfError(err)
    }
}

impl From<ProcessError> for KernelError {
    fn from(err: ProcessError) -> Self {
        Self::ProcessError(err)
    }
}

impl ElfError {
    /// Stable numeric code surfaced to programs through the kapi
    /// (mirrors the historical negative return values).
    pub fn code(self) -> i32 {
        match self {
            Self::TooShort => -1,
            Self::BadMagic => -2,
            Self::Not64Bit => -3,
            Self::NotLittleEndian => -4,
            Self::WrongMachine => -5,
            Self::NotExecutable => -6,
            Self::SegmentOutOfBounds => -7,
        }
    }
}
