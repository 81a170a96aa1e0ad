//! Boot orchestration
//!
//! The platform loader enters `kernel_main` at EL1 with interrupts
//! masked, SP set and BSS zeroed. Bring-up order matters: heap before
//! anything that allocates, serial before anything that prints,
//! framebuffer before the console, block before the filesystem, and the
//! kapi table only once everything it fronts is alive.

#![allow(dead_code)] // entered from the bare-metal binary only

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use crate::{arch, fs, hal, kapi, logger, mm, net, process};

use crate::{console, graphics, wm};

/// Display mode both boards run at.
const SCREEN_WIDTH: u32 = 800;
const SCREEN_HEIGHT: u32 = 600;

/// Kernel entry: bring the machine up, then hand off to the desktop.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn kernel_main() -> ! {
    hal::serial::init();
    serial_println!("VIBE");

    arch::aarch64::init();
    mm::init();
    logger::init();

    match hal::fb_init(SCREEN_WIDTH, SCREEN_HEIGHT) {
        Ok(fb) => console::init(fb),
        Err(e) => serial_println!("[BOOT] No framebuffer ({}), console on serial", e),
    }

    banner();
    println!("[BOOT] Kernel loaded on {}", hal::platform_name());

    if let Err(e) = hal::irq_init() {
        println!("[BOOT] IRQ init failed: {}", e);
    }
    if let Err(e) = hal::timer_init(10) {
        println!("[BOOT] Timer init failed: {}", e);
    }

    // Device discovery. The queue-level drivers register the devices
    // they bring up with the HAL; with none present the system still
    // boots to a serial console.
    #[cfg(feature = "qemu")]
    {
        let _slots = crate::drivers::virtio::probe();
    }

    if let Some(nic) = hal::take_net_device() {
        net::init(nic, hal::sleep_ms);
    } else {
        println!("[NET] No NIC; networking disabled");
    }

    match hal::take_block_device() {
        Some(disk) => {
            if let Err(e) = fs::init(disk) {
                println!("[FS] Mount failed: {}", e);
            }
        }
        None => println!("[FS] No block device; filesystem disabled"),
    }

    kapi::init();
    process::init();

    hal::irq_enable();
    println!("[BOOT] Interrupts enabled");

    // Hand off to userspace: desktop first, shell as fallback.
    match process::exec("/bin/desktop") {
        Ok(status) => println!("[BOOT] desktop exited with {}", status),
        Err(_) => match process::exec("/bin/vibesh") {
            Ok(status) => println!("[BOOT] vibesh exited with {}", status),
            Err(e) => println!("[BOOT] No startup program: {}", e),
        },
    }

    // Nothing left to run: keep servicing the polled subsystems.
    loop {
        process::yield_now();
        hal::wfi();
    }
}

fn banner() {
    let _ = console::with_console(|con| {
        con.set_color(graphics::colors::GREEN, graphics::colors::BLACK);
        con.put_str("\n  VibeOS ");
        con.set_color(graphics::colors::WHITE, graphics::colors::BLACK);
        con.put_str(env!("CARGO_PKG_VERSION"));
        con.put_str(" - aarch64\n  =====================\n\n");
    });
    println!("The vibes are immaculate.");
}

/// Everything the compositor needs is linked into the kernel; the
/// desktop program drives this through the kapi windowing family once
/// it installs its backend. Exposed here so the boot path can verify
/// the contract wiring in one place.
pub fn window_system_smoke_check() -> bool {
    let mut compositor = wm::Compositor::new(SCREEN_WIDTH, SCREEN_HEIGHT);
    let id = match compositor.create(16, 16, 240, 160, "boot-check") {
        Some(id) => id,
        None => return false,
    };
    compositor.compose();
    compositor.destroy(id);
    true
}

/// Fatal boot error: report and park (reset required).
pub fn fatal(subsystem: &str) -> ! {
    serial_println!("[BOOT] Fatal: {} failed, halting", subsystem);
    crate::arch::halt();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_smoke_check_passes() {
        assert!(window_system_smoke_check());
    }
}
