//! PL031 real-time clock (QEMU virt machine)
//!
//! One read-only data register holding seconds since the Unix epoch.
//! The Pi has no RTC; callers get `Unsupported` and fall back to
//! uptime.

use crate::error::KernelResult;

#[cfg(all(target_arch = "aarch64", target_os = "none", feature = "qemu"))]
pub fn read_epoch() -> KernelResult<u64> {
    const RTC_BASE: usize = 0x0901_0000;
    const RTCDR: usize = 0x000;

    // SAFETY: the PL031 data register on the virt machine; read-only.
    let seconds = unsafe { core::ptr::read_volatile((RTC_BASE + RTCDR) as *const u32) };
    Ok(seconds as u64)
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none", feature = "qemu")))]
pub fn read_epoch() -> KernelResult<u64> {
    Err(crate::error::KernelError::Unsupported { what: "RTC" })
}
