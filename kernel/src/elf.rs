//! ELF64 loader for program execution
//!
//! Validates little-endian AArch64 `ET_EXEC` images and lays their
//! `PT_LOAD` segments down at the linked virtual addresses (which equal
//! physical addresses -- there is no MMU). No relocation is performed;
//! executables link against the program load area, above the heap.
//!
//! Header fields are assembled byte-by-byte rather than read through
//! packed structs, so the loader never performs a misaligned load on a
//! buffer the filesystem happened to place oddly.

use crate::error::ElfError;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_AARCH64: u16 = 0xB7;
const PT_LOAD: u32 = 1;

/// ELF file header size
pub const EHDR_SIZE: usize = 64;
/// Program header entry size
pub const PHDR_SIZE: usize = 56;

/// Parsed ELF64 file header (the fields the loader needs).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElfHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

/// Parsed program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(bytes)
}

/// Validate an ELF image, returning its parsed header.
///
/// Each check failure maps to a distinct [`ElfError`] so callers can
/// report exactly what was wrong with the file.
pub fn validate(image: &[u8]) -> Result<ElfHeader, ElfError> {
    if image.len() < EHDR_SIZE {
        return Err(ElfError::TooShort);
    }
    if image[0..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if image[4] != ELFCLASS64 {
        return Err(ElfError::Not64Bit);
    }
    if image[5] != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    if read_u16(image, 18) != EM_AARCH64 {
        return Err(ElfError::WrongMachine);
    }
    if read_u16(image, 16) != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }

    Ok(ElfHeader {
        entry: read_u64(image, 24),
        phoff: read_u64(image, 32),
        phentsize: read_u16(image, 54),
        phnum: read_u16(image, 56),
    })
}

/// Parse the program header at index `i`, bounds-checked against the
/// image.
fn program_header(image: &[u8], hdr: &ElfHeader, i: usize) -> Result<ProgramHeader, ElfError> {
    let entsize = hdr.phentsize as usize;
    if entsize < PHDR_SIZE {
        return Err(ElfError::SegmentOutOfBounds);
    }
    let off = (hdr.phoff as usize)
        .checked_add(i * entsize)
        .ok_or(ElfError::SegmentOutOfBounds)?;
    if off + PHDR_SIZE > image.len() {
        return Err(ElfError::SegmentOutOfBounds);
    }

    Ok(ProgramHeader {
        p_type: read_u32(image, off),
        offset: read_u64(image, off + 8),
        vaddr: read_u64(image, off + 16),
        filesz: read_u64(image, off + 32),
        memsz: read_u64(image, off + 40),
    })
}

/// Load an executable: revalidate, copy every `PT_LOAD` segment to its
/// virtual address, zero the BSS tail, and return the entry address.
///
/// # Safety
///
/// Segment `p_vaddr` ranges must reference RAM that is free for program
/// use (the program load area). The loader writes there directly.
pub unsafe fn load(image: &[u8]) -> Result<u64, ElfError> {
    let hdr = validate(image)?;

    for i in 0..hdr.phnum as usize {
        let ph = program_header(image, &hdr, i)?;
        if ph.p_type != PT_LOAD {
            continue;
        }

        let filesz = ph.filesz as usize;
        let memsz = ph.memsz as usize;
        let offset = ph.offset as usize;
        if filesz > memsz {
            return Err(ElfError::SegmentOutOfBounds);
        }
        if offset.checked_add(filesz).map_or(true, |end| end > image.len()) {
            return Err(ElfError::SegmentOutOfBounds);
        }

        let dest = ph.vaddr as *mut u8;

        // SAFETY: per the function contract the segment's address range
        // is unused RAM; source range was bounds-checked above.
        unsafe {
            if filesz > 0 {
                core::ptr::copy_nonoverlapping(image.as_ptr().add(offset), dest, filesz);
            }
            if memsz > filesz {
                core::ptr::write_bytes(dest.add(filesz), 0, memsz - filesz);
            }
        }
    }

    Ok(hdr.entry)
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;

    /// Build a minimal valid ET_EXEC image with one PT_LOAD segment.
    fn build_image(vaddr: u64, payload: &[u8], memsz: u64, entry: u64) -> Vec<u8> {
        let payload_off = (EHDR_SIZE + PHDR_SIZE) as u64;
        let mut img = vec![0u8; EHDR_SIZE + PHDR_SIZE + payload.len()];

        img[0..4].copy_from_slice(&ELF_MAGIC);
        img[4] = ELFCLASS64;
        img[5] = ELFDATA2LSB;
        img[6] = 1; // EV_CURRENT
        img[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        img[18..20].copy_from_slice(&EM_AARCH64.to_le_bytes());
        img[20..24].copy_from_slice(&1u32.to_le_bytes());
        img[24..32].copy_from_slice(&entry.to_le_bytes());
        img[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        img[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        img[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        img[56..58].copy_from_slice(&1u16.to_le_bytes());

        let ph = EHDR_SIZE;
        img[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        img[ph + 8..ph + 16].copy_from_slice(&payload_off.to_le_bytes());
        img[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
        img[ph + 32..ph + 40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        img[ph + 40..ph + 48].copy_from_slice(&memsz.to_le_bytes());

        img[EHDR_SIZE + PHDR_SIZE..].copy_from_slice(payload);
        img
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(validate(&[]), Err(ElfError::TooShort));
    }

    #[test]
    fn rejects_magic_only_input() {
        assert_eq!(validate(&ELF_MAGIC), Err(ElfError::TooShort));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut img = build_image(0, &[], 0, 0);
        img[1] = b'X';
        assert_eq!(validate(&img), Err(ElfError::BadMagic));
    }

    #[test]
    fn rejects_foreign_machine() {
        let mut img = build_image(0, &[], 0, 0);
        // EM_X86_64
        img[18..20].copy_from_slice(&0x3Eu16.to_le_bytes());
        assert_eq!(validate(&img), Err(ElfError::WrongMachine));
    }

    #[test]
    fn rejects_relocatable() {
        let mut img = build_image(0, &[], 0, 0);
        // ET_REL
        img[16..18].copy_from_slice(&1u16.to_le_bytes());
        assert_eq!(validate(&img), Err(ElfError::NotExecutable));
    }

    #[test]
    fn rejects_32bit_and_big_endian() {
        let mut img = build_image(0, &[], 0, 0);
        img[4] = 1;
        assert_eq!(validate(&img), Err(ElfError::Not64Bit));

        let mut img = build_image(0, &[], 0, 0);
        img[5] = 2;
        assert_eq!(validate(&img), Err(ElfError::NotLittleEndian));
    }

    #[test]
    fn accepts_minimal_executable() {
        let img = build_image(0x4100_0000, b"\x00\x00\x00\x00", 4, 0x4100_0000);
        let hdr = validate(&img).unwrap();
        assert_eq!(hdr.entry, 0x4100_0000);
        assert_eq!(hdr.phnum, 1);
    }

    #[test]
    fn load_copies_segment_and_zeroes_bss() {
        // Target the segment at a live buffer so the copy is observable
        // without touching absolute addresses.
        let mut dest = vec![0xFFu8; 256];
        let payload: Vec<u8> = (0u8..64).collect();
        let vaddr = dest.as_mut_ptr() as u64;
        let img = build_image(vaddr, &payload, 128, vaddr);

        let entry = unsafe { load(&img) }.unwrap();
        assert_eq!(entry, vaddr);
        assert_eq!(&dest[..64], &payload[..]);
        // BSS tail [filesz, memsz) zeroed...
        assert!(dest[64..128].iter().all(|&b| b == 0));
        // ...and bytes past memsz untouched.
        assert!(dest[128..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn load_rejects_truncated_segment() {
        let mut dest = [0u8; 16];
        let vaddr = dest.as_mut_ptr() as u64;
        let mut img = build_image(vaddr, &[1, 2, 3, 4], 4, vaddr);
        // Claim more file bytes than the image holds.
        let ph = EHDR_SIZE;
        img[ph + 32..ph + 40].copy_from_slice(&(1u64 << 20).to_le_bytes());
        img[ph + 40..ph + 48].copy_from_slice(&(1u64 << 20).to_le_bytes());
        assert_eq!(unsafe { load(&img) }, Err(ElfError::SegmentOutOfBounds));
    }
}
