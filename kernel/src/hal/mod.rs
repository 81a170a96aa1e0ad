//! Hardware abstraction layer
//!
//! The narrow, per-platform facade the rest of the kernel talks to:
//! serial, framebuffer, block storage, input, timers, interrupts and
//! the LED. Platform modules (QEMU virt, Pi Zero 2W -- selected by
//! cargo feature, mirroring the old compile-time board switch) fill in
//! the device-facing halves; everything here is portable state that
//! also runs on the host for tests.
//!
//! Every init returns a `KernelResult`; a platform that lacks a device
//! reports `Unsupported` and callers degrade (the console falls back to
//! serial, input falls back to polling).

pub mod serial;

#[cfg(all(target_arch = "aarch64", target_os = "none", feature = "qemu"))]
pub mod qemu;
#[cfg(all(target_arch = "aarch64", target_os = "none", feature = "qemu"))]
use qemu as platform;

#[cfg(all(target_arch = "aarch64", target_os = "none", feature = "pi", not(feature = "qemu")))]
pub mod pizero2w;
#[cfg(all(target_arch = "aarch64", target_os = "none", feature = "pi", not(feature = "qemu")))]
use pizero2w as platform;

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::KernelResult;
use crate::fs::BlockDevice;
use crate::graphics::Framebuffer;
use crate::net::NetDevice;

/// Special key codes beyond ASCII, as delivered by `keyboard_getc`.
pub mod keys {
    pub const KEY_UP: u16 = 0x100;
    pub const KEY_DOWN: u16 = 0x101;
    pub const KEY_LEFT: u16 = 0x102;
    pub const KEY_RIGHT: u16 = 0x103;
    pub const KEY_HOME: u16 = 0x104;
    pub const KEY_END: u16 = 0x105;
    pub const KEY_DELETE: u16 = 0x106;

    /// Ctrl+letter maps into the C0 range.
    pub fn ctrl(letter: u8) -> u16 {
        (letter.to_ascii_uppercase() - b'A' + 1) as u16
    }
}

/// Mouse snapshot: screen position plus a button bitmap
/// (left=1, right=2, middle=4).
#[derive(Debug, Clone, Copy, Default)]
pub struct MouseState {
    pub x: i32,
    pub y: i32,
    pub buttons: u8,
}

/// Input device contract the platform drivers (virtio-input, USB HID)
/// implement; `input_poll` drains them into the shared queue/state.
pub trait InputSource: Send {
    /// Next pending key code, if any.
    fn poll_key(&mut self) -> Option<u16>;
    /// Latest mouse state, if it changed.
    fn poll_mouse(&mut self) -> Option<MouseState>;
}

const KEY_QUEUE_CAP: usize = 64;

static KEY_QUEUE: Mutex<VecDeque<u16>> = Mutex::new(VecDeque::new());
static MOUSE: Mutex<MouseState> = Mutex::new(MouseState {
    x: 0,
    y: 0,
    buttons: 0,
});
static FRAMEBUFFER: Mutex<Option<Framebuffer>> = Mutex::new(None);
static TICKS: AtomicU64 = AtomicU64::new(0);

static INPUT_SOURCE: Mutex<Option<Box<dyn InputSource>>> = Mutex::new(None);
static BLOCK_DEVICE: Mutex<Option<Box<dyn BlockDevice>>> = Mutex::new(None);
static NET_DEVICE: Mutex<Option<Box<dyn NetDevice>>> = Mutex::new(None);

// ---------------------------------------------------------------------
// Keyboard / mouse
// ---------------------------------------------------------------------

/// Queue a key code (IRQ handlers and platform polls call this).
pub fn keyboard_push(code: u16) {
    let mut queue = KEY_QUEUE.lock();
    if queue.len() < KEY_QUEUE_CAP {
        queue.push_back(code);
    }
}

/// Non-blocking key fetch.
pub fn keyboard_getc() -> Option<u16> {
    KEY_QUEUE.lock().pop_front()
}

pub fn keyboard_has_key() -> bool {
    !KEY_QUEUE.lock().is_empty()
}

/// Latest mouse snapshot.
pub fn mouse_state() -> MouseState {
    *MOUSE.lock()
}

/// Update the mouse snapshot (drivers call this).
pub fn mouse_set_state(state: MouseState) {
    *MOUSE.lock() = state;
}

/// Install the platform input driver.
pub fn register_input_source(source: Box<dyn InputSource>) {
    *INPUT_SOURCE.lock() = Some(source);
}

/// Drain the input driver into the key queue and mouse snapshot.
/// Called from `yield` and the main loops; platforms without an input
/// IRQ rely on this polling path.
pub fn input_poll() {
    let mut guard = INPUT_SOURCE.lock();
    if let Some(source) = guard.as_mut() {
        while let Some(code) = source.poll_key() {
            keyboard_push(code);
        }
        if let Some(state) = source.poll_mouse() {
            *MOUSE.lock() = state;
        }
    }
}

/// Serializes tests that touch the shared input singletons.
#[cfg(test)]
pub(crate) static INPUT_TEST_LOCK: Mutex<()> = Mutex::new(());

// ---------------------------------------------------------------------
// Framebuffer
// ---------------------------------------------------------------------

/// Record the platform framebuffer after a successful `fb_init`.
pub fn set_framebuffer(fb: Framebuffer) {
    *FRAMEBUFFER.lock() = Some(fb);
}

/// The framebuffer descriptor, if the platform has one. `Framebuffer`
/// is a cheap copyable view; the pixel memory itself is the singleton.
pub fn framebuffer() -> Option<Framebuffer> {
    *FRAMEBUFFER.lock()
}

/// Bring up the display at the requested mode and attach the console.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn fb_init(width: u32, height: u32) -> KernelResult<Framebuffer> {
    let fb = platform::fb_init(width, height)?;
    set_framebuffer(fb);
    Ok(fb)
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn fb_init(_width: u32, _height: u32) -> KernelResult<Framebuffer> {
    Err(crate::error::KernelError::Unsupported { what: "framebuffer" })
}

// ---------------------------------------------------------------------
// Block / net device registration (driver glue contract)
// ---------------------------------------------------------------------

/// Driver glue hands the probed disk to the HAL.
pub fn register_block_device(dev: Box<dyn BlockDevice>) {
    *BLOCK_DEVICE.lock() = Some(dev);
}

/// The filesystem takes ownership of the disk at mount time.
pub fn take_block_device() -> Option<Box<dyn BlockDevice>> {
    BLOCK_DEVICE.lock().take()
}

/// Driver glue hands the probed NIC to the HAL.
pub fn register_net_device(dev: Box<dyn NetDevice>) {
    *NET_DEVICE.lock() = Some(dev);
}

/// The network stack takes ownership of the NIC.
pub fn take_net_device() -> Option<Box<dyn NetDevice>> {
    NET_DEVICE.lock().take()
}

// ---------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------

/// Advance the 100 Hz tick counter. Called from the timer IRQ; kept
/// minimal because IRQ context must not take subsystem locks.
pub fn timer_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since boot (nominally 100 Hz). On the Pi no tick IRQ is
/// routed, so the count derives from the free-running counter.
pub fn ticks() -> u64 {
    #[cfg(all(
        target_arch = "aarch64",
        target_os = "none",
        feature = "pi",
        not(feature = "qemu")
    ))]
    {
        return time_us() / 10_000;
    }
    #[allow(unreachable_code)]
    TICKS.load(Ordering::Relaxed)
}

/// Free-running microsecond counter, available before the tick timer.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn time_us() -> u64 {
    crate::arch::aarch64::timer::time_us()
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn time_us() -> u64 {
    use spin::Once;
    static EPOCH: Once<std::time::Instant> = Once::new();
    let epoch = EPOCH.call_once(std::time::Instant::now);
    epoch.elapsed().as_micros() as u64
}

/// Sleep at least `ms` milliseconds as measured by the microsecond
/// counter.
pub fn sleep_ms(ms: u32) {
    let deadline = time_us() + ms as u64 * 1000;
    while time_us() < deadline {
        wfi();
    }
}

/// Start the periodic timer (nominal 100 Hz at `interval_ms` = 10).
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn timer_init(interval_ms: u32) -> KernelResult<()> {
    platform::timer_init(interval_ms)
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn timer_init(_interval_ms: u32) -> KernelResult<()> {
    Ok(())
}

// ---------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn irq_init() -> KernelResult<()> {
    platform::irq_init()
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn irq_enable() {
    // SAFETY: unmasking IRQs at EL1 is the normal end-of-boot step.
    unsafe { core::arch::asm!("msr daifclr, #2", options(nostack, preserves_flags)) };
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn irq_disable() {
    // SAFETY: masking IRQs is always safe.
    unsafe { core::arch::asm!("msr daifset, #2", options(nostack, preserves_flags)) };
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn irq_register(irq: u32, handler: fn()) -> KernelResult<()> {
    platform::irq_register(irq, handler)
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn irq_init() -> KernelResult<()> {
    Ok(())
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn irq_enable() {}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn irq_disable() {}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn irq_register(_irq: u32, _handler: fn()) -> KernelResult<()> {
    Ok(())
}

// ---------------------------------------------------------------------
// Misc platform facade
// ---------------------------------------------------------------------

/// Park the CPU until the next interrupt (spin hint on hosts).
pub fn wfi() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    cortex_a::asm::wfi();
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    core::hint::spin_loop();
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn platform_name() -> &'static str {
    platform::NAME
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn platform_name() -> &'static str {
    "host"
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn ram_size() -> u64 {
    platform::RAM_SIZE
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn ram_size() -> u64 {
    0
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn led_on() {
    platform::led_on();
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn led_off() {
    platform::led_off();
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn led_toggle() {
    platform::led_toggle();
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn led_on() {}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn led_off() {}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn led_toggle() {}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedInput {
        keys: alloc::vec::Vec<u16>,
        mouse: Option<MouseState>,
    }

    impl InputSource for ScriptedInput {
        fn poll_key(&mut self) -> Option<u16> {
            self.keys.pop()
        }

        fn poll_mouse(&mut self) -> Option<MouseState> {
            self.mouse.take()
        }
    }

    #[test]
    fn input_poll_drains_source_into_queue() {
        let _guard = INPUT_TEST_LOCK.lock();
        register_input_source(alloc::boxed::Box::new(ScriptedInput {
            keys: alloc::vec![b'b' as u16, b'a' as u16],
            mouse: Some(MouseState {
                x: 12,
                y: 34,
                buttons: 1,
            }),
        }));
        input_poll();

        assert_eq!(keyboard_getc(), Some(b'a' as u16));
        assert_eq!(keyboard_getc(), Some(b'b' as u16));
        assert_eq!(keyboard_getc(), None);

        let mouse = mouse_state();
        assert_eq!((mouse.x, mouse.y, mouse.buttons), (12, 34, 1));
        *INPUT_SOURCE.lock() = None;
    }

    #[test]
    fn ctrl_keys_map_into_c0() {
        assert_eq!(keys::ctrl(b'a'), 1);
        assert_eq!(keys::ctrl(b'Z'), 26);
    }

    #[test]
    fn sleep_respects_the_microsecond_counter() {
        let before = time_us();
        sleep_ms(2);
        assert!(time_us() - before >= 2000);
    }
}
