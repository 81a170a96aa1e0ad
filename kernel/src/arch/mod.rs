//! Architecture support
//!
//! The kernel targets AArch64 only; the module is gated so host builds
//! (unit tests) skip the MMIO and system-register code entirely.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

/// Park the CPU forever (the fatal-error path).
pub fn halt() -> ! {
    loop {
        crate::hal::wfi();
    }
}
