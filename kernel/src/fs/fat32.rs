//! FAT32 filesystem driver
//!
//! Read-write FAT32 over a [`BlockDevice`], with long filename (LFN)
//! support. The driver keeps one sector buffer and one cluster buffer as
//! shared scratch -- safe under the kernel's cooperative scheduling; a
//! preemptive port would need per-call buffers or a lock around the
//! volume (see the concurrency notes in the process substrate).
//!
//! All multi-byte on-disk fields are assembled byte-by-byte as
//! little-endian values. Casting packed structs over device memory is a
//! misaligned-load trap on AArch64, and this driver never does it.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::blockdev::{BlockDevice, SECTOR_SIZE};
use crate::error::{FsError, KernelError, KernelResult};

/// FAT entry marking a free cluster.
pub const FAT32_FREE: u32 = 0x0000_0000;
/// Any FAT entry at or above this value ends a chain.
pub const FAT32_EOC: u32 = 0x0FFF_FFF8;

/// Size of one directory slot on disk.
const DIR_ENTRY_SIZE: usize = 32;
/// First byte of a slot that was deleted.
const DELETED_MARKER: u8 = 0xE5;
/// Maximum filename length we assemble from LFN fragments.
const MAX_NAME: usize = 255;

bitflags! {
    /// Directory entry attribute byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
    }
}

/// All four low attribute bits set marks a long-filename fragment.
const ATTR_LFN: u8 = 0x0F;

/// A resolved directory entry.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedEntry {
    pub attr: Attributes,
    pub first_cluster: u32,
    pub size: u32,
}

impl ResolvedEntry {
    pub fn is_directory(&self) -> bool {
        self.attr.contains(Attributes::DIRECTORY)
    }
}

/// One listing row returned by [`Fat32Volume::list_dir`].
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u32,
}

/// Location of a directory slot on disk (cluster + slot index), used by
/// the write paths to rewrite an entry in place.
#[derive(Debug, Clone, Copy)]
struct SlotLocation {
    cluster: u32,
    index: usize,
}

/// A mounted FAT32 volume.
pub struct Fat32Volume<D: BlockDevice> {
    dev: D,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    num_fats: u32,
    fat_size: u32,
    root_cluster: u32,
    data_start: u32,
    total_clusters: u32,
    sector_buf: [u8; SECTOR_SIZE],
    cluster_buf: Vec<u8>,
}

fn read16(buf: &[u8], off: usize) -> u16 {
    buf[off] as u16 | (buf[off + 1] as u16) << 8
}

fn read32(buf: &[u8], off: usize) -> u32 {
    buf[off] as u32
        | (buf[off + 1] as u32) << 8
        | (buf[off + 2] as u32) << 16
        | (buf[off + 3] as u32) << 24
}

fn write16(buf: &mut [u8], off: usize, val: u16) {
    buf[off] = val as u8;
    buf[off + 1] = (val >> 8) as u8;
}

fn write32(buf: &mut [u8], off: usize, val: u32) {
    buf[off] = val as u8;
    buf[off + 1] = (val >> 8) as u8;
    buf[off + 2] = (val >> 16) as u8;
    buf[off + 3] = (val >> 24) as u8;
}

fn to_upper(c: u8) -> u8 {
    if c.is_ascii_lowercase() {
        c - 32
    } else {
        c
    }
}

/// Case-insensitive ASCII name comparison.
fn name_matches(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| to_upper(x) == to_upper(y))
}

/// Render an on-disk 8.3 name to the conventional `name.ext` form,
/// lowercased for display.
fn short_name_to_str(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    for &c in raw[..8].iter().take_while(|&&c| c != b' ') {
        out.push(c.to_ascii_lowercase());
    }
    if raw[8] != b' ' {
        out.push(b'.');
        for &c in raw[8..11].iter().take_while(|&&c| c != b' ') {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

/// Whether a filename can be stored directly in an 8.3 slot without a
/// long-filename chain.
fn fits_short_name(name: &[u8]) -> bool {
    if name.iter().filter(|&&c| c == b'.').count() > 1 {
        return false;
    }
    if !name
        .iter()
        .all(|&c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'_' | b'-' | b'~'))
    {
        return false;
    }
    let (stem, ext) = match name.iter().position(|&c| c == b'.') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => (name, &[][..]),
    };
    !stem.is_empty() && stem.len() <= 8 && ext.len() <= 3
}

/// Convert a filename to the 11-byte 8.3 field (uppercase, space
/// padded, extension after the last dot).
fn str_to_short_name(name: &[u8]) -> [u8; 11] {
    let mut out = [b' '; 11];
    let dot = name.iter().rposition(|&c| c == b'.');
    let (stem, ext) = match dot {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => (name, &[][..]),
    };
    for (i, &c) in stem.iter().take(8).enumerate() {
        out[i] = to_upper(c);
    }
    for (i, &c) in ext.iter().take(3).enumerate() {
        out[8 + i] = to_upper(c);
    }
    out
}

/// 8.3 checksum stored in every LFN fragment of the same entry.
fn short_name_checksum(short: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &c in &short[..11] {
        sum = (if sum & 1 != 0 { 0x80u8 } else { 0u8 })
            .wrapping_add(sum >> 1)
            .wrapping_add(c);
    }
    sum
}

/// Build one on-disk LFN fragment for `seq` (1-based). Fragments carry
/// 13 UTF-16LE units; the name is terminated by one 0x0000 unit and
/// padded with 0xFFFF.
fn lfn_fragment(name: &[u8], seq: usize, total: usize, checksum: u8) -> [u8; DIR_ENTRY_SIZE] {
    let mut slot = [0u8; DIR_ENTRY_SIZE];
    slot[0] = seq as u8 | if seq == total { 0x40 } else { 0 };
    slot[11] = ATTR_LFN;
    slot[13] = checksum;

    let base = (seq - 1) * 13;
    let ranges: [(usize, usize); 3] = [(1, 5), (14, 6), (28, 2)];
    let mut pos = 0;
    for (off, count) in ranges {
        for j in 0..count {
            let idx = base + pos;
            let unit: u16 = match idx.cmp(&name.len()) {
                core::cmp::Ordering::Less => name[idx] as u16,
                core::cmp::Ordering::Equal => 0x0000,
                core::cmp::Ordering::Greater => 0xFFFF,
            };
            write16(&mut slot, off + j * 2, unit);
            pos += 1;
        }
    }
    slot
}

/// Build the 8.3 directory slot that terminates an entry.
fn short_entry_slot(short: &[u8; 11], attr: Attributes, first_cluster: u32) -> [u8; DIR_ENTRY_SIZE] {
    let mut slot = [0u8; DIR_ENTRY_SIZE];
    slot[..11].copy_from_slice(short);
    slot[11] = attr.bits();
    write16(&mut slot, 20, (first_cluster >> 16) as u16);
    write16(&mut slot, 26, first_cluster as u16);
    write32(&mut slot, 28, 0);
    slot
}

/// Accumulates LFN fragments until the real entry arrives.
struct LfnState {
    name: [u8; MAX_NAME],
    active: bool,
    checksum: u8,
}

impl LfnState {
    fn new() -> Self {
        Self {
            name: [0; MAX_NAME],
            active: false,
            checksum: 0,
        }
    }

    fn reset(&mut self) {
        self.active = false;
    }

    /// Fold one 32-byte LFN slot into the accumulator. Fragments carry
    /// 13 UTF-16LE units at byte offsets 1, 14 and 28; we keep the low
    /// byte. `0x0000` and `0xFFFF` terminate a fragment.
    fn absorb(&mut self, slot: &[u8; DIR_ENTRY_SIZE]) {
        let order = slot[0];
        let seq = (order & 0x1F) as usize;
        if seq == 0 {
            return;
        }
        if order & 0x40 != 0 {
            self.name = [0; MAX_NAME];
            self.active = true;
            self.checksum = slot[13];
        }

        let base = (seq - 1) * 13;
        let ranges: [(usize, usize); 3] = [(1, 5), (14, 6), (28, 2)];
        let mut pos = 0;
        for (off, count) in ranges {
            for j in 0..count {
                let unit = read16(slot, off + j * 2);
                if unit == 0 || unit == 0xFFFF {
                    return;
                }
                if base + pos < MAX_NAME {
                    self.name[base + pos] = unit as u8;
                }
                pos += 1;
            }
        }
    }

    /// The assembled name, if a complete accumulation is active and its
    /// checksum matches the following short entry.
    fn take(&mut self, short_name: &[u8]) -> Option<Vec<u8>> {
        if !self.active {
            return None;
        }
        self.active = false;
        if self.checksum != short_name_checksum(short_name) {
            return None;
        }
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(MAX_NAME);
        Some(self.name[..len].to_vec())
    }
}

impl<D: BlockDevice> Fat32Volume<D> {
    /// Mount a FAT32 volume from sector 0 of `dev`.
    ///
    /// Rejects anything that is not FAT32: non-512-byte sectors, a
    /// non-zero 16-bit FAT size or root entry count (FAT12/16).
    pub fn mount(mut dev: D) -> KernelResult<Self> {
        let mut boot = [0u8; SECTOR_SIZE];
        dev.read_sectors(0, &mut boot)?;

        let bytes_per_sector = read16(&boot, 11) as u32;
        let sectors_per_cluster = boot[13] as u32;
        let reserved_sectors = read16(&boot, 14) as u32;
        let num_fats = boot[16] as u32;
        let root_entry_count = read16(&boot, 17);
        let fat_size_16 = read16(&boot, 22);
        let total_sectors_32 = read32(&boot, 32);
        let fat_size_32 = read32(&boot, 36);
        let root_cluster = read32(&boot, 44);

        if bytes_per_sector != SECTOR_SIZE as u32 {
            log::warn!(
                target: "fat32",
                "unsupported sector size {}",
                bytes_per_sector
            );
            return Err(FsError::InvalidVolume.into());
        }
        if fat_size_16 != 0 || root_entry_count != 0 {
            // FAT12/16 layout
            return Err(FsError::InvalidVolume.into());
        }
        if sectors_per_cluster == 0 || fat_size_32 == 0 || root_cluster < 2 {
            return Err(FsError::InvalidVolume.into());
        }

        let data_start = reserved_sectors + num_fats * fat_size_32;
        let total_clusters = (total_sectors_32 - data_start) / sectors_per_cluster;
        let cluster_bytes = (sectors_per_cluster * bytes_per_sector) as usize;

        println!(
            "[FAT32] Mounted: {} sectors/cluster, {} clusters, root at {}",
            sectors_per_cluster, total_clusters, root_cluster
        );

        Ok(Self {
            dev,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            fat_size: fat_size_32,
            root_cluster,
            data_start,
            total_clusters,
            sector_buf: [0; SECTOR_SIZE],
            cluster_buf: vec![0; cluster_bytes],
        })
    }

    /// Unmount, returning the underlying device.
    pub fn into_device(self) -> D {
        self.dev
    }

    /// Bytes per cluster (the allocation unit).
    pub fn cluster_bytes(&self) -> usize {
        (self.sectors_per_cluster * self.bytes_per_sector) as usize
    }

    /// Total data clusters on the volume.
    pub fn total_clusters(&self) -> u32 {
        self.total_clusters
    }

    // -----------------------------------------------------------------
    // FAT navigation
    // -----------------------------------------------------------------

    fn first_sector_of(&self, cluster: u32) -> u64 {
        (self.data_start + (cluster - 2) * self.sectors_per_cluster) as u64
    }

    /// Read the FAT entry for `cluster` (low 28 bits).
    fn fat_next(&mut self, cluster: u32) -> KernelResult<u32> {
        let fat_offset = cluster * 4;
        let sector = self.reserved_sectors + fat_offset / self.bytes_per_sector;
        let offset = (fat_offset % self.bytes_per_sector) as usize;

        self.dev.read_sectors(sector as u64, &mut self.sector_buf)?;
        Ok(read32(&self.sector_buf, offset) & 0x0FFF_FFFF)
    }

    /// Rewrite the FAT entry for `cluster`, preserving the reserved high
    /// 4 bits and mirroring the write to every FAT copy.
    fn fat_set(&mut self, cluster: u32, value: u32) -> KernelResult<()> {
        let fat_offset = cluster * 4;
        let sector = self.reserved_sectors + fat_offset / self.bytes_per_sector;
        let offset = (fat_offset % self.bytes_per_sector) as usize;

        self.dev.read_sectors(sector as u64, &mut self.sector_buf)?;
        let old = read32(&self.sector_buf, offset);
        write32(
            &mut self.sector_buf,
            offset,
            (old & 0xF000_0000) | (value & 0x0FFF_FFFF),
        );

        for copy in 0..self.num_fats {
            let mirror = (sector + copy * self.fat_size) as u64;
            self.dev.write_sectors(mirror, &self.sector_buf)?;
        }
        Ok(())
    }

    /// Claim the first free cluster, marking it end-of-chain.
    fn allocate_cluster(&mut self) -> KernelResult<u32> {
        for cluster in 2..self.total_clusters + 2 {
            if self.fat_next(cluster)? == FAT32_FREE {
                self.fat_set(cluster, FAT32_EOC)?;
                return Ok(cluster);
            }
        }
        Err(FsError::OutOfSpace.into())
    }

    /// Free a whole cluster chain.
    fn free_chain(&mut self, mut cluster: u32) -> KernelResult<()> {
        while (2..FAT32_EOC).contains(&cluster) {
            let next = self.fat_next(cluster)?;
            self.fat_set(cluster, FAT32_FREE)?;
            cluster = next;
        }
        Ok(())
    }

    /// Count free clusters (kapi disk-info family; also the test hook
    /// for delete semantics).
    pub fn free_cluster_count(&mut self) -> KernelResult<u32> {
        let mut free = 0;
        for cluster in 2..self.total_clusters + 2 {
            if self.fat_next(cluster)? == FAT32_FREE {
                free += 1;
            }
        }
        Ok(free)
    }

    // -----------------------------------------------------------------
    // Cluster I/O (shared scratch buffer)
    // -----------------------------------------------------------------

    fn read_cluster(&mut self, cluster: u32) -> KernelResult<()> {
        let sector = self.first_sector_of(cluster);
        self.dev.read_sectors(sector, &mut self.cluster_buf)
    }

    fn write_cluster(&mut self, cluster: u32) -> KernelResult<()> {
        let sector = self.first_sector_of(cluster);
        self.dev.write_sectors(sector, &self.cluster_buf)
    }

    fn zero_cluster(&mut self, cluster: u32) -> KernelResult<()> {
        self.cluster_buf.fill(0);
        self.write_cluster(cluster)
    }

    fn entries_per_cluster(&self) -> usize {
        self.cluster_bytes() / DIR_ENTRY_SIZE
    }

    fn slot(&self, index: usize) -> [u8; DIR_ENTRY_SIZE] {
        let mut out = [0u8; DIR_ENTRY_SIZE];
        out.copy_from_slice(&self.cluster_buf[index * DIR_ENTRY_SIZE..(index + 1) * DIR_ENTRY_SIZE]);
        out
    }

    fn parse_slot(slot: &[u8; DIR_ENTRY_SIZE]) -> ResolvedEntry {
        ResolvedEntry {
            attr: Attributes::from_bits_truncate(slot[11]),
            first_cluster: (read16(slot, 20) as u32) << 16 | read16(slot, 26) as u32,
            size: read32(slot, 28),
        }
    }

    // -----------------------------------------------------------------
    // Directory traversal
    // -----------------------------------------------------------------

    /// Find `name` in the directory chain starting at `dir_cluster`.
    fn find_in_dir(
        &mut self,
        dir_cluster: u32,
        name: &[u8],
    ) -> KernelResult<Option<(ResolvedEntry, SlotLocation)>> {
        let mut lfn = LfnState::new();
        let mut cluster = dir_cluster;

        while (2..FAT32_EOC).contains(&cluster) {
            self.read_cluster(cluster)?;

            for i in 0..self.entries_per_cluster() {
                let slot = self.slot(i);
                let first = slot[0];

                if first == 0x00 {
                    return Ok(None);
                }
                if first == DELETED_MARKER {
                    lfn.reset();
                    continue;
                }
                if slot[11] == ATTR_LFN {
                    lfn.absorb(&slot);
                    continue;
                }
                if slot[11] & Attributes::VOLUME_ID.bits() != 0 {
                    lfn.reset();
                    continue;
                }

                let entry_name = match lfn.take(&slot[..11]) {
                    Some(long) => long,
                    None => short_name_to_str(&slot[..11]),
                };
                if name_matches(&entry_name, name) {
                    return Ok(Some((
                        Self::parse_slot(&slot),
                        SlotLocation { cluster, index: i },
                    )));
                }
            }

            cluster = self.fat_next(cluster)?;
        }

        Ok(None)
    }

    fn root_entry(&self) -> ResolvedEntry {
        ResolvedEntry {
            attr: Attributes::DIRECTORY,
            first_cluster: self.root_cluster,
            size: 0,
        }
    }

    /// Resolve a `/`-separated path to its directory entry. An empty or
    /// `/`-only path yields a synthetic entry for the root directory.
    pub fn resolve(&mut self, path: &str) -> KernelResult<ResolvedEntry> {
        let mut current = self.root_entry();

        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_directory() {
                return Err(FsError::NotADirectory.into());
            }
            if component.len() > MAX_NAME {
                return Err(FsError::InvalidPath.into());
            }
            match self.find_in_dir(current.first_cluster, component.as_bytes())? {
                Some((entry, _)) => current = entry,
                None => return Err(FsError::NotFound.into()),
            }
        }

        Ok(current)
    }

    /// Size in bytes of the file at `path`.
    pub fn file_size(&mut self, path: &str) -> KernelResult<u32> {
        let entry = self.resolve(path)?;
        if entry.is_directory() {
            return Err(FsError::IsADirectory.into());
        }
        Ok(entry.size)
    }

    /// Whether `path` names a directory.
    pub fn is_directory(&mut self, path: &str) -> KernelResult<bool> {
        Ok(self.resolve(path)?.is_directory())
    }

    /// List a directory. Dot entries and volume labels are filtered.
    pub fn list_dir(&mut self, path: &str) -> KernelResult<Vec<DirEntryInfo>> {
        let dir = self.resolve(path)?;
        if !dir.is_directory() {
            return Err(FsError::NotADirectory.into());
        }

        let mut out = Vec::new();
        let mut lfn = LfnState::new();
        let mut cluster = dir.first_cluster;

        while (2..FAT32_EOC).contains(&cluster) {
            self.read_cluster(cluster)?;

            for i in 0..self.entries_per_cluster() {
                let slot = self.slot(i);
                let first = slot[0];

                if first == 0x00 {
                    return Ok(out);
                }
                if first == DELETED_MARKER {
                    lfn.reset();
                    continue;
                }
                if slot[11] == ATTR_LFN {
                    lfn.absorb(&slot);
                    continue;
                }
                if slot[11] & Attributes::VOLUME_ID.bits() != 0 || first == b'.' {
                    lfn.reset();
                    continue;
                }

                let name_bytes = match lfn.take(&slot[..11]) {
                    Some(long) => long,
                    None => short_name_to_str(&slot[..11]),
                };
                let entry = Self::parse_slot(&slot);
                out.push(DirEntryInfo {
                    name: String::from_utf8_lossy(&name_bytes).into_owned(),
                    is_dir: entry.is_directory(),
                    size: entry.size,
                });
            }

            cluster = self.fat_next(cluster)?;
        }

        Ok(out)
    }

    // -----------------------------------------------------------------
    // File reads
    // -----------------------------------------------------------------

    /// Read up to `buf.len()` bytes of the file at `path`, returning the
    /// number of bytes copied (`min(buf.len(), file size)`).
    pub fn read_file(&mut self, path: &str, buf: &mut [u8]) -> KernelResult<usize> {
        let entry = self.resolve(path)?;
        if entry.is_directory() {
            return Err(FsError::IsADirectory.into());
        }

        let to_read = buf.len().min(entry.size as usize);
        let mut cluster = entry.first_cluster;
        let mut done = 0;

        while (2..FAT32_EOC).contains(&cluster) && done < to_read {
            self.read_cluster(cluster)?;
            let chunk = self.cluster_bytes().min(to_read - done);
            buf[done..done + chunk].copy_from_slice(&self.cluster_buf[..chunk]);
            done += chunk;
            cluster = self.fat_next(cluster)?;
        }

        Ok(done)
    }

    // -----------------------------------------------------------------
    // Write paths
    // -----------------------------------------------------------------

    /// Split a path into its parent directory's first cluster and the
    /// final component.
    fn parse_parent<'p>(&mut self, path: &'p str) -> KernelResult<(u32, &'p str)> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath.into());
        }
        let split = path.rfind('/').unwrap_or(0);
        let (parent, name) = (&path[..split], &path[split + 1..]);
        if name.is_empty() || name.len() > MAX_NAME {
            return Err(FsError::InvalidPath.into());
        }

        let parent_entry = self.resolve(parent)?;
        if !parent_entry.is_directory() {
            return Err(FsError::NotADirectory.into());
        }
        Ok((parent_entry.first_cluster, name))
    }

    /// Locate a run of `needed` consecutive free slots, growing the
    /// directory with zeroed clusters when the chain runs out. Returns
    /// the run's global slot index within the directory.
    fn find_free_run(&mut self, dir_cluster: u32, needed: usize) -> KernelResult<usize> {
        let eps = self.entries_per_cluster();
        let mut cluster = dir_cluster;
        let mut global = 0usize;
        let mut run_start = 0usize;
        let mut run_len = 0usize;

        loop {
            self.read_cluster(cluster)?;
            for i in 0..eps {
                let first = self.cluster_buf[i * DIR_ENTRY_SIZE];
                if first == 0x00 || first == DELETED_MARKER {
                    if run_len == 0 {
                        run_start = global;
                    }
                    run_len += 1;
                    if run_len == needed {
                        return Ok(run_start);
                    }
                } else {
                    run_len = 0;
                }
                global += 1;
            }

            let next = self.fat_next(cluster)?;
            if (2..FAT32_EOC).contains(&next) {
                cluster = next;
                continue;
            }

            // Chain exhausted: append zeroed clusters until the run fits.
            let mut tail = cluster;
            while run_len < needed {
                let grown = self.allocate_cluster()?;
                self.fat_set(tail, grown)?;
                self.zero_cluster(grown)?;
                tail = grown;
                if run_len == 0 {
                    run_start = global;
                }
                run_len += eps;
                global += eps;
            }
            return Ok(run_start);
        }
    }

    /// Write consecutive directory slots starting at global index
    /// `start`, spanning cluster boundaries as needed.
    fn write_slot_run(
        &mut self,
        dir_cluster: u32,
        start: usize,
        slots: &[[u8; DIR_ENTRY_SIZE]],
    ) -> KernelResult<()> {
        let eps = self.entries_per_cluster();
        let end = start + slots.len();
        let mut cluster = dir_cluster;
        let mut base = 0usize;

        loop {
            if base + eps > start {
                self.read_cluster(cluster)?;
                for g in start.max(base)..end.min(base + eps) {
                    let off = (g - base) * DIR_ENTRY_SIZE;
                    self.cluster_buf[off..off + DIR_ENTRY_SIZE].copy_from_slice(&slots[g - start]);
                }
                self.write_cluster(cluster)?;
            }
            base += eps;
            if base >= end {
                return Ok(());
            }
            cluster = self.fat_next(cluster)?;
            if !(2..FAT32_EOC).contains(&cluster) {
                return Err(FsError::IoError.into());
            }
        }
    }

    /// Check whether a raw 8.3 name is already present in a directory.
    fn short_name_in_use(&mut self, dir_cluster: u32, short: &[u8; 11]) -> KernelResult<bool> {
        let mut cluster = dir_cluster;
        while (2..FAT32_EOC).contains(&cluster) {
            self.read_cluster(cluster)?;
            for i in 0..self.entries_per_cluster() {
                let slot = self.slot(i);
                if slot[0] == 0x00 {
                    return Ok(false);
                }
                if slot[0] == DELETED_MARKER || slot[11] == ATTR_LFN {
                    continue;
                }
                if slot[..11] == short[..] {
                    return Ok(true);
                }
            }
            cluster = self.fat_next(cluster)?;
        }
        Ok(false)
    }

    /// Derive a collision-free 8.3 alias (`STEM~N.EXT`) for a long name.
    fn derive_short_alias(&mut self, dir_cluster: u32, name: &[u8]) -> KernelResult<[u8; 11]> {
        let (stem_src, ext_src) = match name.iter().rposition(|&c| c == b'.') {
            Some(i) => (&name[..i], &name[i + 1..]),
            None => (name, &[][..]),
        };

        let mut short = [b' '; 11];
        let mut stem_len = 0;
        for &c in stem_src.iter().filter(|c| c.is_ascii_alphanumeric()) {
            if stem_len == 6 {
                break;
            }
            short[stem_len] = to_upper(c);
            stem_len += 1;
        }
        if stem_len == 0 {
            short[0] = b'X';
            stem_len = 1;
        }
        for (i, &c) in ext_src
            .iter()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(3)
            .enumerate()
        {
            short[8 + i] = to_upper(c);
        }

        for n in 1..=9u8 {
            short[stem_len] = b'~';
            short[stem_len + 1] = b'0' + n;
            if !self.short_name_in_use(dir_cluster, &short)? {
                return Ok(short);
            }
        }
        Err(FsError::OutOfSpace.into())
    }

    /// Create a directory entry. Names that fit 8.3 get a single slot;
    /// longer names get an LFN fragment chain (in reverse sequence
    /// order) followed by an aliased 8.3 slot.
    fn create_entry(
        &mut self,
        parent_cluster: u32,
        name: &str,
        attr: Attributes,
        first_cluster: u32,
    ) -> KernelResult<()> {
        let name_bytes = name.as_bytes();

        if fits_short_name(name_bytes) {
            let short = str_to_short_name(name_bytes);
            let start = self.find_free_run(parent_cluster, 1)?;
            let slots = [short_entry_slot(&short, attr, first_cluster)];
            return self.write_slot_run(parent_cluster, start, &slots);
        }

        let short = self.derive_short_alias(parent_cluster, name_bytes)?;
        let checksum = short_name_checksum(&short);
        let fragments = name_bytes.len().div_ceil(13);

        let mut slots = Vec::with_capacity(fragments + 1);
        for seq in (1..=fragments).rev() {
            slots.push(lfn_fragment(name_bytes, seq, fragments, checksum));
        }
        slots.push(short_entry_slot(&short, attr, first_cluster));

        let start = self.find_free_run(parent_cluster, slots.len())?;
        self.write_slot_run(parent_cluster, start, &slots)
    }

    /// Rewrite an existing entry's first cluster and size.
    fn update_entry(
        &mut self,
        parent_cluster: u32,
        name: &str,
        first_cluster: u32,
        size: u32,
    ) -> KernelResult<()> {
        let (_, loc) = self
            .find_in_dir(parent_cluster, name.as_bytes())?
            .ok_or(FsError::NotFound)?;
        self.read_cluster(loc.cluster)?;

        let off = loc.index * DIR_ENTRY_SIZE;
        write16(&mut self.cluster_buf, off + 20, (first_cluster >> 16) as u16);
        write16(&mut self.cluster_buf, off + 26, first_cluster as u16);
        write32(&mut self.cluster_buf, off + 28, size);

        self.write_cluster(loc.cluster)
    }

    /// Create an empty file. Succeeds silently when the path already
    /// exists.
    pub fn create_file(&mut self, path: &str) -> KernelResult<()> {
        let (parent, name) = self.parse_parent(path)?;
        if self.find_in_dir(parent, name.as_bytes())?.is_some() {
            return Ok(());
        }
        self.create_entry(parent, name, Attributes::ARCHIVE, 0)
    }

    /// Create a directory with `.` and `..` entries.
    pub fn make_directory(&mut self, path: &str) -> KernelResult<()> {
        let (parent, name) = self.parse_parent(path)?;
        if self.find_in_dir(parent, name.as_bytes())?.is_some() {
            return Err(FsError::AlreadyExists.into());
        }

        let dir_cluster = self.allocate_cluster()?;
        if let Err(e) = self.init_directory_cluster(dir_cluster, parent) {
            self.fat_set(dir_cluster, FAT32_FREE)?;
            return Err(e);
        }
        if let Err(e) = self.create_entry(parent, name, Attributes::DIRECTORY, dir_cluster) {
            self.fat_set(dir_cluster, FAT32_FREE)?;
            return Err(e);
        }
        Ok(())
    }

    fn init_directory_cluster(&mut self, dir_cluster: u32, parent_cluster: u32) -> KernelResult<()> {
        self.cluster_buf.fill(0);

        // "." points at the directory itself
        self.cluster_buf[..11].fill(b' ');
        self.cluster_buf[0] = b'.';
        self.cluster_buf[11] = Attributes::DIRECTORY.bits();
        write16(&mut self.cluster_buf, 20, (dir_cluster >> 16) as u16);
        write16(&mut self.cluster_buf, 26, dir_cluster as u16);

        // ".." points at the parent
        let off = DIR_ENTRY_SIZE;
        self.cluster_buf[off..off + 11].fill(b' ');
        self.cluster_buf[off] = b'.';
        self.cluster_buf[off + 1] = b'.';
        self.cluster_buf[off + 11] = Attributes::DIRECTORY.bits();
        write16(&mut self.cluster_buf, off + 20, (parent_cluster >> 16) as u16);
        write16(&mut self.cluster_buf, off + 26, parent_cluster as u16);

        self.write_cluster(dir_cluster)
    }

    /// Write a file, replacing any previous contents. Creates the entry
    /// when absent. Returns the number of bytes written.
    ///
    /// The new chain is fully written before the old one is freed, so an
    /// interrupted write orphans clusters rather than corrupting the
    /// file it replaces.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> KernelResult<usize> {
        let (parent, name) = self.parse_parent(path)?;

        let old_cluster = match self.find_in_dir(parent, name.as_bytes())? {
            Some((entry, _)) => {
                if entry.is_directory() {
                    return Err(FsError::IsADirectory.into());
                }
                entry.first_cluster
            }
            None => {
                self.create_entry(parent, name, Attributes::ARCHIVE, 0)?;
                0
            }
        };

        let cluster_bytes = self.cluster_bytes();
        let clusters_needed = data.len().div_ceil(cluster_bytes);

        let mut first_cluster = 0;
        let mut prev_cluster = 0;
        for chunk in data.chunks(cluster_bytes).take(clusters_needed) {
            let cluster = match self.allocate_cluster() {
                Ok(c) => c,
                Err(e) => {
                    if first_cluster != 0 {
                        self.free_chain(first_cluster)?;
                    }
                    return Err(e);
                }
            };
            if first_cluster == 0 {
                first_cluster = cluster;
            }
            if prev_cluster != 0 {
                self.fat_set(prev_cluster, cluster)?;
            }

            self.cluster_buf.fill(0);
            self.cluster_buf[..chunk.len()].copy_from_slice(chunk);
            if let Err(e) = self.write_cluster(cluster) {
                self.free_chain(first_cluster)?;
                return Err(e);
            }
            prev_cluster = cluster;
        }

        if let Err(e) = self.update_entry(parent, name, first_cluster, data.len() as u32) {
            if first_cluster != 0 {
                self.free_chain(first_cluster)?;
            }
            return Err(e);
        }

        if (2..FAT32_EOC).contains(&old_cluster) {
            self.free_chain(old_cluster)?;
        }

        Ok(data.len())
    }

    /// Delete a file: free its chain and mark the slot deleted. Refuses
    /// directories (recursive deletion belongs to a higher layer).
    pub fn delete(&mut self, path: &str) -> KernelResult<()> {
        let (parent, name) = self.parse_parent(path)?;
        let (entry, loc) = self
            .find_in_dir(parent, name.as_bytes())?
            .ok_or(FsError::NotFound)?;

        if entry.is_directory() {
            return Err(FsError::IsADirectory.into());
        }

        if (2..FAT32_EOC).contains(&entry.first_cluster) {
            self.free_chain(entry.first_cluster)?;
        }

        self.read_cluster(loc.cluster)?;
        self.cluster_buf[loc.index * DIR_ENTRY_SIZE] = DELETED_MARKER;
        self.write_cluster(loc.cluster)
    }

    /// Rename an entry in place by rewriting its 8.3 name field. The new
    /// name must fit 8.3; the entry's LFN fragments (if any) are left
    /// orphaned, matching the original driver.
    pub fn rename(&mut self, path: &str, new_name: &str) -> KernelResult<()> {
        let (parent, name) = self.parse_parent(path)?;
        let (_, loc) = self
            .find_in_dir(parent, name.as_bytes())?
            .ok_or(FsError::NotFound)?;

        self.read_cluster(loc.cluster)?;
        let off = loc.index * DIR_ENTRY_SIZE;
        let short = str_to_short_name(new_name.as_bytes());
        self.cluster_buf[off..off + 11].copy_from_slice(&short);
        self.write_cluster(loc.cluster)
    }
}

/// Map a filesystem error onto the historical negative return code used
/// across the kapi boundary.
pub fn error_code(err: &KernelError) -> i32 {
    match err {
        KernelError::FsError(FsError::NotFound) => -2,
        KernelError::FsError(FsError::NotADirectory) => -3,
        KernelError::FsError(FsError::IsADirectory) => -4,
        KernelError::FsError(FsError::OutOfSpace) => -5,
        KernelError::FsError(FsError::IoError) => -6,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use alloc::format;

    use super::super::blockdev::RamDisk;
    use super::super::testfs;
    use super::*;

    fn fresh() -> Fat32Volume<RamDisk> {
        testfs::fresh_volume(8 * 1024, 4)
    }

    #[test]
    fn mount_rejects_fat16_layout() {
        let mut disk = RamDisk::new(128);
        let mut boot = [0u8; SECTOR_SIZE];
        boot[11] = 0x00;
        boot[12] = 0x02; // 512 bytes/sector
        boot[13] = 1;
        write16(&mut boot, 14, 1);
        boot[16] = 2;
        write16(&mut boot, 17, 512); // root_entry_count != 0 -> FAT16
        write16(&mut boot, 22, 32); // fat_size_16 != 0
        disk.write_sectors(0, &boot).unwrap();

        assert!(matches!(
            Fat32Volume::mount(disk),
            Err(KernelError::FsError(FsError::InvalidVolume))
        ));
    }

    #[test]
    fn create_file_yields_empty_non_directory() {
        let mut vol = fresh();
        vol.create_file("/empty.txt").unwrap();
        assert_eq!(vol.file_size("/empty.txt").unwrap(), 0);
        assert!(!vol.is_directory("/empty.txt").unwrap());
        // Creating again is not an error.
        vol.create_file("/empty.txt").unwrap();
    }

    #[test]
    fn write_read_round_trip_at_cluster_boundaries() {
        let mut vol = fresh();
        let cb = vol.cluster_bytes();

        for n in [0usize, 1, cb - 1, cb, cb + 1, 3 * cb + 17] {
            let data: Vec<u8> = (0..n).map(|i| (i * 31 + n) as u8).collect();
            vol.write_file("/blob.bin", &data).unwrap();
            assert_eq!(vol.file_size("/blob.bin").unwrap() as usize, n);

            let mut out = vec![0u8; n];
            assert_eq!(vol.read_file("/blob.bin", &mut out).unwrap(), n);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn read_caps_at_buffer_and_file_size() {
        let mut vol = fresh();
        vol.write_file("/cap.bin", &[7u8; 100]).unwrap();

        let mut small = [0u8; 10];
        assert_eq!(vol.read_file("/cap.bin", &mut small).unwrap(), 10);

        let mut big = [0u8; 1000];
        assert_eq!(vol.read_file("/cap.bin", &mut big).unwrap(), 100);
        assert!(big[..100].iter().all(|&b| b == 7));
    }

    #[test]
    fn rewrite_frees_previous_chain() {
        let mut vol = fresh();
        let cb = vol.cluster_bytes();
        let free_before = vol.free_cluster_count().unwrap();

        vol.write_file("/grow.bin", &vec![1u8; 4 * cb]).unwrap();
        assert_eq!(vol.free_cluster_count().unwrap(), free_before - 4);

        // Shrinking reuses nothing from the old chain and frees it.
        vol.write_file("/grow.bin", &vec![2u8; cb]).unwrap();
        assert_eq!(vol.free_cluster_count().unwrap(), free_before - 1);
    }

    #[test]
    fn file_round_trip_survives_remount() {
        let mut vol = fresh();
        let data: Vec<u8> = (0..4097).map(|i| (i % 251) as u8).collect();
        vol.write_file("/tmp.bin", &data).unwrap();

        // Remount over the same image.
        let disk = vol.into_device();
        let mut vol = Fat32Volume::mount(disk).unwrap();

        assert_eq!(vol.file_size("/tmp.bin").unwrap(), 4097);
        let mut out = vec![0u8; 4097];
        vol.read_file("/tmp.bin", &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn delete_releases_clusters_and_entry() {
        let mut vol = fresh();
        let cb = vol.cluster_bytes();
        let free_before = vol.free_cluster_count().unwrap();

        vol.write_file("/victim.bin", &vec![9u8; 2 * cb + 1]).unwrap();
        vol.delete("/victim.bin").unwrap();

        assert!(matches!(
            vol.resolve("/victim.bin"),
            Err(KernelError::FsError(FsError::NotFound))
        ));
        assert_eq!(vol.free_cluster_count().unwrap(), free_before);
    }

    #[test]
    fn delete_refuses_directories() {
        let mut vol = fresh();
        vol.make_directory("/d").unwrap();
        assert!(matches!(
            vol.delete("/d"),
            Err(KernelError::FsError(FsError::IsADirectory))
        ));
    }

    #[test]
    fn mkdir_creates_dot_entries_only() {
        let mut vol = fresh();
        vol.make_directory("/sub").unwrap();

        assert!(vol.is_directory("/sub").unwrap());
        // Listing filters the dot entries, so a fresh directory is empty.
        assert!(vol.list_dir("/sub").unwrap().is_empty());
        // And a second mkdir fails.
        assert!(vol.make_directory("/sub").is_err());
    }

    #[test]
    fn nested_paths_resolve() {
        let mut vol = fresh();
        vol.make_directory("/a").unwrap();
        vol.make_directory("/a/b").unwrap();
        vol.write_file("/a/b/deep.txt", b"down here").unwrap();

        let mut out = [0u8; 9];
        vol.read_file("/a/b/deep.txt", &mut out).unwrap();
        assert_eq!(&out, b"down here");

        // Traversing through a file is rejected.
        assert!(matches!(
            vol.resolve("/a/b/deep.txt/x"),
            Err(KernelError::FsError(FsError::NotADirectory))
        ));
    }

    #[test]
    fn directory_grows_past_one_cluster() {
        let mut vol = fresh();
        vol.make_directory("/d").unwrap();
        let free_before = vol.free_cluster_count().unwrap();

        for i in 0..200 {
            vol.create_file(&format!("/d/f{:03}", i)).unwrap();
        }

        let listing = vol.list_dir("/d").unwrap();
        assert_eq!(listing.len(), 200);
        for i in 0..200 {
            let name = format!("f{:03}", i);
            assert!(listing.iter().any(|e| e.name == name), "missing {}", name);
        }
        // 200 slots at 64 per 2 KiB cluster needs extra clusters beyond
        // the one mkdir allocated.
        assert!(vol.free_cluster_count().unwrap() < free_before);
    }

    #[test]
    fn resolution_is_case_insensitive() {
        let mut vol = fresh();
        vol.write_file("/MiXeD.TxT", b"x").unwrap();
        assert_eq!(vol.file_size("/mixed.txt").unwrap(), 1);
        assert_eq!(vol.file_size("/MIXED.TXT").unwrap(), 1);
    }

    #[test]
    fn rename_rewrites_short_name() {
        let mut vol = fresh();
        vol.write_file("/old.txt", b"data").unwrap();
        vol.rename("/old.txt", "new.txt").unwrap();

        assert!(vol.resolve("/old.txt").is_err());
        assert_eq!(vol.file_size("/new.txt").unwrap(), 4);
    }

    #[test]
    fn long_filenames_survive_create_and_list() {
        let mut vol = fresh();

        // 255 characters, the LFN maximum.
        let long: String = core::iter::repeat('x').take(251).collect::<String>() + ".txt";
        assert_eq!(long.len(), 255);
        let path = format!("/{}", long);

        vol.write_file(&path, b"lfn payload").unwrap();

        assert_eq!(vol.file_size(&path).unwrap() as usize, 11);
        let listing = vol.list_dir("/").unwrap();
        assert!(listing.iter().any(|e| e.name == long));

        let mut out = [0u8; 11];
        vol.read_file(&path, &mut out).unwrap();
        assert_eq!(&out, b"lfn payload");
    }

    #[test]
    fn root_path_variants_resolve_to_root() {
        let mut vol = fresh();
        assert!(vol.resolve("").unwrap().is_directory());
        assert!(vol.resolve("/").unwrap().is_directory());
        assert!(vol.is_directory("/").unwrap());
        assert!(matches!(
            vol.file_size("/"),
            Err(KernelError::FsError(FsError::IsADirectory))
        ));
    }

    #[test]
    fn short_name_conversion() {
        assert_eq!(&str_to_short_name(b"hello.txt"), b"HELLO   TXT");
        assert_eq!(&str_to_short_name(b"a.b.c"), b"A.B     C  ");
        assert_eq!(&str_to_short_name(b"noext"), b"NOEXT      ");
        assert_eq!(
            short_name_to_str(b"HELLO   TXT").as_slice(),
            b"hello.txt"
        );
        assert_eq!(short_name_to_str(b"NOEXT      ").as_slice(), b"noext");
    }

    #[test]
    fn checksum_matches_reference_algorithm() {
        // Reference value computed with the canonical Microsoft rotation.
        let sum = short_name_checksum(b"HELLO   TXT");
        let mut expect: u8 = 0;
        for &c in b"HELLO   TXT" {
            expect = (expect >> 1).wrapping_add((expect & 1) << 7).wrapping_add(c);
        }
        assert_eq!(sum, expect);
    }

    #[test]
    fn lfn_fragments_reassemble() {
        let name = b"a-name-that-needs-three-fragments.txt";
        let fragments = name.len().div_ceil(13);
        let short = str_to_short_name(b"ANAMET~1.TXT");
        let sum = short_name_checksum(&short);

        let mut lfn = LfnState::new();
        // Fragments arrive highest-sequence-first, as written on disk.
        for seq in (1..=fragments).rev() {
            let slot = lfn_fragment(name, seq, fragments, sum);
            assert_eq!(slot[11], ATTR_LFN);
            lfn.absorb(&slot);
        }
        assert_eq!(lfn.take(&short).unwrap(), name.to_vec());

        // A checksum mismatch invalidates the accumulation.
        let mut lfn = LfnState::new();
        for seq in (1..=fragments).rev() {
            lfn.absorb(&lfn_fragment(name, seq, fragments, sum ^ 0xFF));
        }
        assert!(lfn.take(&short).is_none());
    }
}
