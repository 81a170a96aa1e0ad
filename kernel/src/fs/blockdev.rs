//! Block device abstraction
//!
//! Sector-oriented storage interface the FAT32 driver mounts over. Real
//! devices (virtio-blk on QEMU, EMMC on the Pi) sit behind the HAL;
//! [`RamDisk`] backs the filesystem tests.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{FsError, KernelResult};

/// Sector size every device must use.
pub const SECTOR_SIZE: usize = 512;

/// Block device trait: 512-byte sectors, LBA addressing from 0.
///
/// Multi-sector transfers are a single contract here; whether a driver
/// issues one command or loops per sector is its own business. Errors
/// are sticky to a single request. No atomicity is promised across a
/// power loss, even within one call.
pub trait BlockDevice: Send {
    /// Total number of sectors on the device.
    fn sector_count(&self) -> u64;

    /// Read `buf.len() / 512` sectors starting at `lba`.
    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> KernelResult<()>;

    /// Write `buf.len() / 512` sectors starting at `lba`.
    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> KernelResult<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for alloc::boxed::Box<T> {
    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
        (**self).read_sectors(lba, buf)
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> KernelResult<()> {
        (**self).write_sectors(lba, buf)
    }
}

/// RAM-backed block device for tests and ramdisks.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    /// Create a zero-filled disk of `sectors` sectors.
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
        }
    }

    /// Wrap an existing image.
    pub fn from_image(data: Vec<u8>) -> Self {
        debug_assert!(data.len() % SECTOR_SIZE == 0);
        Self { data }
    }

    /// Take the raw image back out (used by remount tests).
    pub fn into_image(self) -> Vec<u8> {
        self.data
    }

    fn check_range(&self, lba: u64, len: usize) -> KernelResult<usize> {
        if len % SECTOR_SIZE != 0 {
            return Err(FsError::IoError.into());
        }
        let start = lba as usize * SECTOR_SIZE;
        let end = start + len;
        if end > self.data.len() {
            return Err(FsError::IoError.into());
        }
        Ok(start)
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
        let start = self.check_range(lba, buf.len())?;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> KernelResult<()> {
        let start = self.check_range(lba, buf.len())?;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramdisk_round_trip() {
        let mut disk = RamDisk::new(64);
        assert_eq!(disk.sector_count(), 64);

        let data = [0x42u8; SECTOR_SIZE * 3];
        disk.write_sectors(5, &data).unwrap();

        let mut out = [0u8; SECTOR_SIZE * 3];
        disk.read_sectors(5, &mut out).unwrap();
        assert_eq!(out[..], data[..]);
    }

    #[test]
    fn ramdisk_rejects_out_of_range() {
        let mut disk = RamDisk::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(disk.read_sectors(4, &mut buf).is_err());
        assert!(disk.write_sectors(100, &buf).is_err());
    }
}
