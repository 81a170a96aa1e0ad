//! AArch64 bring-up: PL011 UART, GICv2, generic timer, exception
//! vectors.

pub mod serial;

#[cfg(target_os = "none")]
pub mod boot;
#[cfg(all(target_os = "none", feature = "qemu"))]
pub mod gic;
#[cfg(target_os = "none")]
pub mod timer;

/// Install the exception vectors. Called once, early, with interrupts
/// still masked.
#[cfg(target_os = "none")]
pub fn init() {
    boot::install_vectors();
}

/// Route an IRQ exception to the board's interrupt controller.
#[cfg(all(target_os = "none", feature = "qemu"))]
pub fn irq_dispatch() {
    gic::dispatch();
}

#[cfg(all(target_os = "none", not(feature = "qemu")))]
pub fn irq_dispatch() {
    // No device IRQs are routed on this board.
    serial_println!("[IRQ] Unexpected interrupt");
}
