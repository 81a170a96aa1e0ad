//! virtio-mmio discovery glue (QEMU virt machine)
//!
//! The virt board exposes 32 virtio-mmio transport slots starting at
//! `0x0a00_0000`, 0x200 bytes apart, with SPIs 48..79. This module only
//! probes them -- magic, version, device id -- and reports what is
//! where; the queue-level drivers are collaborators that register their
//! devices with the HAL.

use alloc::vec::Vec;

use core::ptr;

const VIRTIO_MMIO_BASE: usize = 0x0a00_0000;
const VIRTIO_MMIO_STRIDE: usize = 0x200;
const VIRTIO_MMIO_SLOTS: usize = 32;
const VIRTIO_MMIO_IRQ_BASE: u32 = 48;

const REG_MAGIC: usize = 0x000;
const REG_VERSION: usize = 0x004;
const REG_DEVICE_ID: usize = 0x008;

/// "virt" little-endian.
const VIRTIO_MAGIC: u32 = 0x7472_6976;

/// Device type ids from the virtio specification.
pub mod device_type {
    pub const NET: u32 = 1;
    pub const BLOCK: u32 = 2;
    pub const INPUT: u32 = 18;
    pub const SOUND: u32 = 25;
}

/// One discovered transport.
#[derive(Debug, Clone, Copy)]
pub struct VirtioSlot {
    pub base: usize,
    pub irq: u32,
    pub device_id: u32,
    pub version: u32,
}

fn reg_read(base: usize, offset: usize) -> u32 {
    // SAFETY: base iterates the virt machine's virtio-mmio windows;
    // the probed registers are read-only identification fields.
    unsafe { ptr::read_volatile((base + offset) as *const u32) }
}

/// Scan every transport slot and report the populated ones.
pub fn probe() -> Vec<VirtioSlot> {
    let mut found = Vec::new();

    for i in 0..VIRTIO_MMIO_SLOTS {
        let base = VIRTIO_MMIO_BASE + i * VIRTIO_MMIO_STRIDE;
        if reg_read(base, REG_MAGIC) != VIRTIO_MAGIC {
            continue;
        }
        let device_id = reg_read(base, REG_DEVICE_ID);
        if device_id == 0 {
            continue; // placeholder slot
        }

        let slot = VirtioSlot {
            base,
            irq: VIRTIO_MMIO_IRQ_BASE + i as u32,
            device_id,
            version: reg_read(base, REG_VERSION),
        };
        println!(
            "[VIRTIO] slot {} at {:#x}: device {} (irq {})",
            i, base, device_id, slot.irq
        );
        found.push(slot);
    }

    if found.is_empty() {
        log::warn!(target: "virtio", "no devices found on the mmio bus");
    }
    found
}
