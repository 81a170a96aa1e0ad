//! Filesystem layer
//!
//! A FAT32 volume mounted over the block HAL is the system's persistent
//! state. The kernel owns a single mounted volume; programs reach it
//! through the kapi filesystem family.

pub mod blockdev;
pub mod fat32;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub use blockdev::{BlockDevice, RamDisk, SECTOR_SIZE};
pub use fat32::{DirEntryInfo, Fat32Volume};

/// Directories guaranteed to exist after first boot.
const FIRST_BOOT_DIRS: [&str; 6] = ["/bin", "/etc", "/home", "/home/user", "/tmp", "/music"];

/// The system volume. Boxed device so QEMU (virtio-blk) and the Pi
/// (EMMC) mount through the same slot.
static VOLUME: Mutex<Option<Fat32Volume<alloc::boxed::Box<dyn BlockDevice>>>> = Mutex::new(None);

/// Mount the system volume and provision the conventional directory
/// tree on first boot.
pub fn init(dev: alloc::boxed::Box<dyn BlockDevice>) -> KernelResult<()> {
    let mut volume = Fat32Volume::mount(dev)?;

    for dir in FIRST_BOOT_DIRS {
        match volume.is_directory(dir) {
            Ok(true) => {}
            Ok(false) => log::warn!(target: "fs", "{} exists but is a file", dir),
            Err(_) => volume.make_directory(dir)?,
        }
    }

    *VOLUME.lock() = Some(volume);
    println!("[FS] Root filesystem mounted");
    Ok(())
}

/// Run `f` against the mounted volume.
///
/// Returns `NotInitialized` before [`init`]. The lock is held for the
/// whole call; under cooperative scheduling that is the same exclusive
/// access the shared scratch buffers already assume.
pub fn with_volume<R>(
    f: impl FnOnce(&mut Fat32Volume<alloc::boxed::Box<dyn BlockDevice>>) -> KernelResult<R>,
) -> KernelResult<R> {
    let mut guard = VOLUME.lock();
    match guard.as_mut() {
        Some(volume) => f(volume),
        None => Err(KernelError::NotInitialized { subsystem: "fs" }),
    }
}

/// Test support: in-memory FAT32 volumes formatted from scratch.
#[cfg(test)]
pub mod testfs {
    use alloc::vec;

    use super::blockdev::{BlockDevice, RamDisk, SECTOR_SIZE};
    use super::fat32::{Fat32Volume, FAT32_EOC};

    const RESERVED_SECTORS: u16 = 32;
    const NUM_FATS: u8 = 2;

    fn put16(buf: &mut [u8], off: usize, val: u16) {
        buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
    }

    fn put32(buf: &mut [u8], off: usize, val: u32) {
        buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    /// Format a RAM disk as FAT32: BPB, two mirrored FATs, root
    /// directory at cluster 2.
    pub fn format(total_sectors: u32, sectors_per_cluster: u8) -> RamDisk {
        // Fixed-point iteration for the FAT size: the FAT must hold one
        // entry per data cluster (plus the two reserved entries).
        let mut fat_size: u32 = 1;
        loop {
            let data_sectors =
                total_sectors - RESERVED_SECTORS as u32 - NUM_FATS as u32 * fat_size;
            let clusters = data_sectors / sectors_per_cluster as u32;
            let needed = ((clusters + 2) * 4).div_ceil(SECTOR_SIZE as u32);
            if needed <= fat_size {
                break;
            }
            fat_size = needed;
        }

        let mut disk = RamDisk::new(total_sectors as u64);

        let mut boot = [0u8; SECTOR_SIZE];
        boot[0] = 0xEB;
        boot[1] = 0x58;
        boot[2] = 0x90;
        boot[3..11].copy_from_slice(b"VIBEOS  ");
        put16(&mut boot, 11, SECTOR_SIZE as u16);
        boot[13] = sectors_per_cluster;
        put16(&mut boot, 14, RESERVED_SECTORS);
        boot[16] = NUM_FATS;
        boot[21] = 0xF8; // media type
        put32(&mut boot, 32, total_sectors);
        put32(&mut boot, 36, fat_size);
        put32(&mut boot, 44, 2); // root cluster
        boot[66] = 0x29;
        boot[71..82].copy_from_slice(b"VIBEOS     ");
        boot[82..90].copy_from_slice(b"FAT32   ");
        boot[510] = 0x55;
        boot[511] = 0xAA;
        disk.write_sectors(0, &boot).unwrap();

        // FAT[0] = media marker, FAT[1] = EOC, FAT[2] = root (EOC).
        let mut fat0 = [0u8; SECTOR_SIZE];
        put32(&mut fat0, 0, 0x0FFF_FFF8);
        put32(&mut fat0, 4, 0x0FFF_FFFF);
        put32(&mut fat0, 8, FAT32_EOC);
        for copy in 0..NUM_FATS as u32 {
            disk.write_sectors(
                (RESERVED_SECTORS as u32 + copy * fat_size) as u64,
                &fat0,
            )
            .unwrap();
        }

        // Root directory cluster, zeroed.
        let data_start = RESERVED_SECTORS as u32 + NUM_FATS as u32 * fat_size;
        let zeros = vec![0u8; sectors_per_cluster as usize * SECTOR_SIZE];
        disk.write_sectors(data_start as u64, &zeros).unwrap();

        disk
    }

    /// Format and mount a fresh volume.
    pub fn fresh_volume(total_sectors: u32, sectors_per_cluster: u8) -> Fat32Volume<RamDisk> {
        Fat32Volume::mount(format(total_sectors, sectors_per_cluster)).unwrap()
    }
}
