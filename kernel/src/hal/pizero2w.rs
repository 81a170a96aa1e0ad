//! Raspberry Pi Zero 2W platform
//!
//! Serial is UART0 (a PL011 at `0x3F20_1000`); the framebuffer comes
//! from the VideoCore firmware via the property mailbox; storage is the
//! EMMC controller and input a USB HID keyboard -- both collaborator
//! drivers that register with the HAL. The board has no usable
//! per-device IRQ routing in this kernel, so input and network run on
//! the polling path and the tick counter derives from the free-running
//! generic timer.

use core::ptr;

use crate::error::{KernelError, KernelResult};
use crate::graphics::Framebuffer;

pub const NAME: &str = "Raspberry Pi Zero 2W";
pub const RAM_SIZE: u64 = 512 * 1024 * 1024;

const PERIPHERAL_BASE: usize = 0x3F00_0000;

// Property mailbox (channel 8)
const MBOX_BASE: usize = PERIPHERAL_BASE + 0xB880;
const MBOX_READ: usize = MBOX_BASE + 0x00;
const MBOX_STATUS: usize = MBOX_BASE + 0x18;
const MBOX_WRITE: usize = MBOX_BASE + 0x20;
const MBOX_FULL: u32 = 0x8000_0000;
const MBOX_EMPTY: u32 = 0x4000_0000;
const MBOX_CHANNEL_PROPERTY: u32 = 8;

// GPIO block; the activity LED sits on GPIO 29 (active low).
const GPIO_BASE: usize = PERIPHERAL_BASE + 0x20_0000;
const GPFSEL2: usize = GPIO_BASE + 0x08;
const GPSET0: usize = GPIO_BASE + 0x1C;
const GPCLR0: usize = GPIO_BASE + 0x28;
const ACT_LED_PIN: u32 = 29;

use core::sync::atomic::{AtomicBool, Ordering};

static LED_STATE: AtomicBool = AtomicBool::new(false);

fn mmio_read(addr: usize) -> u32 {
    // SAFETY: addresses in this module are BCM2837 peripheral
    // registers; volatile MMIO read.
    unsafe { ptr::read_volatile(addr as *const u32) }
}

fn mmio_write(addr: usize, value: u32) {
    // SAFETY: as above, write side.
    unsafe { ptr::write_volatile(addr as *mut u32, value) }
}

/// Execute one property-mailbox transaction. The buffer must be
/// 16-byte aligned; the firmware writes the response in place.
fn mailbox_call(buffer: &mut [u32]) -> KernelResult<()> {
    let addr = buffer.as_ptr() as u32;
    debug_assert_eq!(addr & 0xF, 0);

    while mmio_read(MBOX_STATUS) & MBOX_FULL != 0 {
        core::hint::spin_loop();
    }
    mmio_write(MBOX_WRITE, (addr & !0xF) | MBOX_CHANNEL_PROPERTY);

    loop {
        while mmio_read(MBOX_STATUS) & MBOX_EMPTY != 0 {
            core::hint::spin_loop();
        }
        let response = mmio_read(MBOX_READ);
        if response & 0xF == MBOX_CHANNEL_PROPERTY && (response & !0xF) == (addr & !0xF) {
            break;
        }
    }

    // buffer[1] is the firmware status word.
    if buffer[1] != 0x8000_0000 {
        return Err(KernelError::HardwareError {
            device: "mailbox",
            code: buffer[1],
        });
    }
    Ok(())
}

#[repr(C, align(16))]
struct FbRequest([u32; 36]);

/// Append one property tag at word offset `at`, returning the next
/// free offset.
fn push_tag(buf: &mut [u32; 36], at: usize, id: u32, words: &[u32]) -> usize {
    buf[at] = id;
    buf[at + 1] = (words.len() * 4) as u32;
    buf[at + 2] = 0;
    buf[at + 3..at + 3 + words.len()].copy_from_slice(words);
    at + 3 + words.len()
}

/// Ask the VideoCore for a linear XRGB8888 framebuffer.
pub fn fb_init(width: u32, height: u32) -> KernelResult<Framebuffer> {
    let mut req = FbRequest([0; 36]);
    let b = &mut req.0;

    let mut i = 2;
    i = push_tag(b, i, 0x0004_8003, &[width, height]); // physical size
    i = push_tag(b, i, 0x0004_8004, &[width, height]); // virtual size
    i = push_tag(b, i, 0x0004_8005, &[32]); // depth
    i = push_tag(b, i, 0x0004_8006, &[0]); // pixel order: XRGB little-endian
    let alloc_index = i;
    i = push_tag(b, i, 0x0004_0001, &[4096, 0]); // allocate buffer
    let pitch_index = i;
    i = push_tag(b, i, 0x0004_0008, &[0]); // get pitch
    b[i] = 0; // end tag
    b[0] = ((i + 1) * 4) as u32;
    b[1] = 0; // request

    mailbox_call(&mut req.0)?;

    let base = req.0[alloc_index + 3] & 0x3FFF_FFFF; // bus -> ARM address
    let pitch = req.0[pitch_index + 3];
    if base == 0 || pitch == 0 {
        return Err(KernelError::HardwareError {
            device: "framebuffer",
            code: 0,
        });
    }

    // SAFETY: the firmware just allocated this region for the display.
    let fb = unsafe { Framebuffer::from_raw(base as usize as *mut u32, width, height, pitch) };
    println!("[FB] Mailbox framebuffer: {}x{} pitch {} @ {:#x}", width, height, pitch, base);
    Ok(fb)
}

/// The kernel routes no per-device IRQs on this board; everything runs
/// on the polling path.
pub fn irq_init() -> KernelResult<()> {
    println!("[IRQ] Pi Zero 2W: polling mode (no device IRQs routed)");
    Ok(())
}

pub fn irq_register(_irq: u32, _handler: fn()) -> KernelResult<()> {
    Err(KernelError::Unsupported { what: "device IRQs" })
}

/// No periodic tick; `hal::ticks` derives from the generic timer.
pub fn timer_init(_interval_ms: u32) -> KernelResult<()> {
    Ok(())
}

fn led_set(on: bool) {
    // Configure GPIO 29 as output (FSEL2 bits 27..29 = 001).
    let fsel = mmio_read(GPFSEL2);
    mmio_write(GPFSEL2, (fsel & !(0b111 << 27)) | (0b001 << 27));

    // Active low: clear the pin to light the LED.
    let reg = if on { GPCLR0 } else { GPSET0 };
    mmio_write(reg, 1 << ACT_LED_PIN);
    LED_STATE.store(on, Ordering::Relaxed);
}

pub fn led_on() {
    led_set(true);
}

pub fn led_off() {
    led_set(false);
}

pub fn led_toggle() {
    led_set(!LED_STATE.load(Ordering::Relaxed));
}
