//! QEMU virt machine platform
//!
//! Serial is the PL011 at `0x0900_0000`; the display is a `ramfb`
//! device programmed through the fw_cfg MMIO interface (no DMA-capable
//! GPU needed); block, network, input and sound are virtio-mmio
//! devices probed by the driver glue. All fw_cfg fields are big-endian.

use core::ptr;

use crate::error::{KernelError, KernelResult};
use crate::graphics::Framebuffer;

pub const NAME: &str = "QEMU virt (aarch64)";
/// RAM configured for the board (virt default used by the image
/// scripts).
pub const RAM_SIZE: u64 = 128 * 1024 * 1024;

/// Fixed framebuffer placement: well above kernel, heap and the
/// program load area.
const FB_MEMORY_BASE: usize = 0x4800_0000;

const FW_CFG_BASE: usize = 0x0902_0000;
const FW_CFG_DATA: usize = FW_CFG_BASE;
const FW_CFG_SELECTOR: usize = FW_CFG_BASE + 0x08;
const FW_CFG_DMA_HI: usize = FW_CFG_BASE + 0x10;
const FW_CFG_DMA_LO: usize = FW_CFG_BASE + 0x14;

const FW_CFG_FILE_DIR: u16 = 0x0019;

const FW_CFG_DMA_CTL_WRITE: u32 = 0x10;
const FW_CFG_DMA_CTL_SELECT: u32 = 0x08;
const FW_CFG_DMA_CTL_ERROR: u32 = 0x01;

/// XR24 fourcc (XRGB8888).
const RAMFB_FORMAT: u32 = 0x3432_5258;

fn read_data_u8() -> u8 {
    // SAFETY: fw_cfg data port of the virt machine.
    unsafe { ptr::read_volatile(FW_CFG_DATA as *const u8) }
}

fn select(selector: u16) {
    // SAFETY: fw_cfg selector port; big-endian per the spec.
    unsafe { ptr::write_volatile(FW_CFG_SELECTOR as *mut u16, selector.swap_bytes()) };
    for _ in 0..1000 {
        core::hint::spin_loop();
    }
}

fn read_bytes(buf: &mut [u8]) {
    for byte in buf {
        *byte = read_data_u8();
    }
}

/// One entry of the fw_cfg file directory (big-endian fields).
fn read_dir_entry() -> (u32, u16, [u8; 56]) {
    let mut raw = [0u8; 64];
    read_bytes(&mut raw);
    let size = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let selector = u16::from_be_bytes([raw[4], raw[5]]);
    let mut name = [0u8; 56];
    name.copy_from_slice(&raw[8..64]);
    (size, selector, name)
}

/// Write a fw_cfg item through the DMA interface.
fn dma_write(selector: u16, data: &[u8]) -> KernelResult<()> {
    #[repr(C, align(16))]
    struct DmaControl {
        control: u32,
        length: u32,
        address: u64,
    }

    let control = DmaControl {
        control: (FW_CFG_DMA_CTL_SELECT | FW_CFG_DMA_CTL_WRITE | (selector as u32) << 16)
            .swap_bytes(),
        length: (data.len() as u32).swap_bytes(),
        address: (data.as_ptr() as u64).swap_bytes(),
    };
    let control_addr = &control as *const DmaControl as u64;

    // SAFETY: handing the device a physical address of a live, aligned
    // control block; the barrier orders the setup stores before the
    // doorbell write, and we spin until the device clears the control
    // word.
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
        ptr::write_volatile(FW_CFG_DMA_HI as *mut u32, ((control_addr >> 32) as u32).swap_bytes());
        ptr::write_volatile(FW_CFG_DMA_LO as *mut u32, (control_addr as u32).swap_bytes());
        loop {
            core::arch::asm!("dsb sy", options(nostack, preserves_flags));
            let status = ptr::read_volatile(&control.control as *const u32).swap_bytes();
            if status & FW_CFG_DMA_CTL_ERROR != 0 {
                return Err(KernelError::HardwareError {
                    device: "fw_cfg",
                    code: status,
                });
            }
            if status & !FW_CFG_DMA_CTL_ERROR == 0 {
                break;
            }
        }
    }
    Ok(())
}

/// Locate the `etc/ramfb` selector in the fw_cfg file directory.
fn find_ramfb() -> Option<u16> {
    select(FW_CFG_FILE_DIR);

    let mut count_raw = [0u8; 4];
    read_bytes(&mut count_raw);
    let count = u32::from_be_bytes(count_raw);
    if count == 0 || count > 100 {
        return None;
    }

    for _ in 0..count {
        let (_size, selector, name) = read_dir_entry();
        let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
        if &name[..len] == b"etc/ramfb" {
            return Some(selector);
        }
    }
    None
}

/// Program ramfb to scan a linear XRGB8888 buffer at `FB_MEMORY_BASE`.
pub fn fb_init(width: u32, height: u32) -> KernelResult<Framebuffer> {
    let selector = find_ramfb().ok_or(KernelError::Unsupported { what: "ramfb" })?;

    let pitch = width * 4;
    // ramfb config structure, all fields big-endian.
    let mut config = [0u8; 28];
    config[0..8].copy_from_slice(&(FB_MEMORY_BASE as u64).to_be_bytes());
    config[8..12].copy_from_slice(&RAMFB_FORMAT.to_be_bytes());
    config[12..16].copy_from_slice(&0u32.to_be_bytes());
    config[16..20].copy_from_slice(&width.to_be_bytes());
    config[20..24].copy_from_slice(&height.to_be_bytes());
    config[24..28].copy_from_slice(&pitch.to_be_bytes());

    dma_write(selector, &config)?;

    // SAFETY: FB_MEMORY_BASE points at RAM reserved for the display;
    // nothing else in the memory map touches it.
    let fb = unsafe { Framebuffer::from_raw(FB_MEMORY_BASE as *mut u32, width, height, pitch) };
    println!("[FB] ramfb configured: {}x{} @ {:#x}", width, height, FB_MEMORY_BASE);
    Ok(fb)
}

/// GICv2 bring-up.
pub fn irq_init() -> KernelResult<()> {
    crate::arch::aarch64::gic::init()
}

/// Hook a handler to an INTID and enable the line.
pub fn irq_register(irq: u32, handler: fn()) -> KernelResult<()> {
    crate::arch::aarch64::gic::register_handler(irq, handler)?;
    crate::arch::aarch64::gic::enable_irq(irq)
}

/// 100 Hz generic timer tick via PPI 30.
pub fn timer_init(interval_ms: u32) -> KernelResult<()> {
    crate::arch::aarch64::timer::init(interval_ms)
}

// The virt board has no LED.
pub fn led_on() {}
pub fn led_off() {}
pub fn led_toggle() {}
