//! ARM generic timer
//!
//! Provides the 100 Hz kernel tick (EL1 physical timer, PPI 30) and the
//! free-running microsecond counter derived from `CNTPCT_EL0`, which
//! works from the first instruction of the kernel -- timeouts in early
//! boot rely on it.

#[cfg(feature = "qemu")]
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "qemu")]
use crate::error::KernelResult;

#[cfg(feature = "qemu")]
static INTERVAL_TICKS: AtomicU64 = AtomicU64::new(0);

/// Counter frequency in Hz.
fn frequency() -> u64 {
    let freq: u64;
    // SAFETY: reading CNTFRQ_EL0 has no side effects.
    unsafe { core::arch::asm!("mrs {}, CNTFRQ_EL0", out(reg) freq) };
    freq
}

fn counter() -> u64 {
    let count: u64;
    // SAFETY: reading CNTPCT_EL0 has no side effects.
    unsafe { core::arch::asm!("mrs {}, CNTPCT_EL0", out(reg) count) };
    count
}

/// Free-running microsecond counter.
pub fn time_us() -> u64 {
    let freq = frequency();
    if freq == 0 {
        return 0;
    }
    counter().wrapping_mul(1_000_000) / freq
}

/// Program the periodic tick and hook its PPI.
#[cfg(feature = "qemu")]
pub fn init(interval_ms: u32) -> KernelResult<()> {
    let tval = frequency() * interval_ms as u64 / 1000;
    INTERVAL_TICKS.store(tval, Ordering::Relaxed);

    // SAFETY: arming the EL1 physical timer; TVAL then CTL (enable,
    // unmasked).
    unsafe {
        core::arch::asm!("msr CNTP_TVAL_EL0, {}", in(reg) tval);
        core::arch::asm!("msr CNTP_CTL_EL0, {}", in(reg) 1u64);
    }

    super::gic::register_handler(super::gic::TIMER_PPI, tick_handler)?;
    super::gic::enable_irq(super::gic::TIMER_PPI)?;

    println!("[TIMER] Generic timer at {} ms intervals", interval_ms);
    Ok(())
}

/// Timer PPI handler: reload the downcounter, advance the kernel tick.
#[cfg(feature = "qemu")]
fn tick_handler() {
    let tval = INTERVAL_TICKS.load(Ordering::Relaxed);
    // SAFETY: reloading the downcounter from IRQ context is the
    // architectural way to get a periodic timer.
    unsafe { core::arch::asm!("msr CNTP_TVAL_EL0, {}", in(reg) tval) };
    crate::hal::timer_tick();
}
