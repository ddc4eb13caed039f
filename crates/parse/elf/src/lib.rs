//! Minimal ELF64 parser for the executables the kernel loads.
//!
//! Validates the identification bytes and the header fields the loader
//! depends on (64-bit, little-endian, x86_64, `ET_EXEC` or `ET_DYN`), then
//! exposes the program header table. Only `PT_LOAD` and `PT_INTERP` matter
//! to the loader; everything else is skipped.

#![cfg_attr(not(test), no_std)]

/// ELF identification magic.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// `e_ident[EI_CLASS]` for 64-bit objects.
pub const ELFCLASS64: u8 = 2;
/// `e_ident[EI_DATA]` for little-endian objects.
pub const ELFDATA2LSB: u8 = 1;
/// `e_machine` for x86_64.
pub const EM_X86_64: u16 = 62;
/// `e_type` for fixed-address executables.
pub const ET_EXEC: u16 = 2;
/// `e_type` for position-independent executables.
pub const ET_DYN: u16 = 3;

/// Program header type: loadable segment.
pub const PT_LOAD: u32 = 1;
/// Program header type: dynamic interpreter path.
pub const PT_INTERP: u32 = 3;
/// Program header type: program header table location.
pub const PT_PHDR: u32 = 6;

/// Segment flag: executable.
pub const PF_X: u32 = 1 << 0;
/// Segment flag: writable.
pub const PF_W: u32 = 1 << 1;
/// Segment flag: readable.
pub const PF_R: u32 = 1 << 2;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

/// Why an ELF image was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Image shorter than the ELF header.
    TooShort,
    /// Identification magic mismatch.
    BadMagic,
    /// Not a 64-bit little-endian x86_64 object.
    WrongFormat,
    /// Neither `ET_EXEC` nor `ET_DYN`.
    NotExecutable,
    /// Program header table out of bounds or malformed.
    BadProgramHeaders,
    /// A segment's file range exceeds the image.
    SegmentOutOfBounds,
}

/// One decoded program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    /// Segment type (`PT_*`).
    pub p_type: u32,
    /// Segment flags (`PF_*`).
    pub p_flags: u32,
    /// Offset of the segment data in the file.
    pub p_offset: u64,
    /// Virtual address the segment wants to be loaded at.
    pub p_vaddr: u64,
    /// Bytes of data present in the file.
    pub p_filesz: u64,
    /// Bytes the segment occupies in memory (zero-filled past `p_filesz`).
    pub p_memsz: u64,
    /// Required alignment.
    pub p_align: u64,
}

impl ProgramHeader {
    /// Returns `true` for loadable segments.
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    /// Returns `true` if the segment requests write permission.
    pub fn writable(&self) -> bool {
        self.p_flags & PF_W != 0
    }

    /// Returns `true` if the segment requests execute permission.
    pub fn executable(&self) -> bool {
        self.p_flags & PF_X != 0
    }
}

/// A validated ELF64 image borrowed from the loader's buffer.
pub struct Elf64<'a> {
    data: &'a [u8],
    /// Program entry point.
    pub entry: u64,
    /// `e_type`: `ET_EXEC` or `ET_DYN`.
    pub elf_type: u16,
    phoff: usize,
    phentsize: usize,
    phnum: usize,
}

impl<'a> Elf64<'a> {
    /// Validates `data` as a loadable ELF64 image.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::TooShort);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ElfError::WrongFormat);
        }

        let elf_type = read_u16(data, 16);
        let machine = read_u16(data, 18);
        if machine != EM_X86_64 {
            return Err(ElfError::WrongFormat);
        }
        if elf_type != ET_EXEC && elf_type != ET_DYN {
            return Err(ElfError::NotExecutable);
        }

        let entry = read_u64(data, 24);
        let phoff = read_u64(data, 32) as usize;
        let phentsize = read_u16(data, 54) as usize;
        let phnum = read_u16(data, 56) as usize;

        if phentsize < PHDR_SIZE {
            return Err(ElfError::BadProgramHeaders);
        }
        let table_end = phoff
            .checked_add(phentsize.checked_mul(phnum).ok_or(ElfError::BadProgramHeaders)?)
            .ok_or(ElfError::BadProgramHeaders)?;
        if table_end > data.len() {
            return Err(ElfError::BadProgramHeaders);
        }

        let elf = Self {
            data,
            entry,
            elf_type,
            phoff,
            phentsize,
            phnum,
        };

        // Reject images whose segment data lies outside the file up front,
        // so the loader never has to re-check.
        for phdr in elf.program_headers() {
            let end = phdr
                .p_offset
                .checked_add(phdr.p_filesz)
                .ok_or(ElfError::SegmentOutOfBounds)?;
            if phdr.is_load() && end > data.len() as u64 {
                return Err(ElfError::SegmentOutOfBounds);
            }
        }

        Ok(elf)
    }

    /// Returns `true` for position-independent executables.
    pub fn is_pie(&self) -> bool {
        self.elf_type == ET_DYN
    }

    /// Number of program headers.
    pub fn phnum(&self) -> usize {
        self.phnum
    }

    /// Size of one program header entry as stored in the file.
    pub fn phentsize(&self) -> usize {
        self.phentsize
    }

    /// File offset of the program header table.
    pub fn phoff(&self) -> usize {
        self.phoff
    }

    /// Iterates the program header table.
    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + '_ {
        (0..self.phnum).map(move |i| {
            let base = self.phoff + i * self.phentsize;
            let d = self.data;
            ProgramHeader {
                p_type: read_u32(d, base),
                p_flags: read_u32(d, base + 4),
                p_offset: read_u64(d, base + 8),
                p_vaddr: read_u64(d, base + 16),
                p_filesz: read_u64(d, base + 32),
                p_memsz: read_u64(d, base + 40),
                p_align: read_u64(d, base + 48),
            }
        })
    }

    /// Returns the bytes of a segment that are present in the file.
    pub fn segment_data(&self, phdr: &ProgramHeader) -> &'a [u8] {
        let start = phdr.p_offset as usize;
        let end = start + phdr.p_filesz as usize;
        &self.data[start..end]
    }

    /// Returns the dynamic interpreter path, if the image requests one.
    pub fn interpreter(&self) -> Option<&'a str> {
        let phdr = self.program_headers().find(|p| p.p_type == PT_INTERP)?;
        let start = phdr.p_offset as usize;
        let end = start.checked_add(phdr.p_filesz as usize)?;
        if end > self.data.len() {
            return None;
        }
        let raw = &self.data[start..end];
        let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        core::str::from_utf8(&raw[..nul]).ok()
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a small valid ELF64 image with the given program headers and
    /// trailing segment data.
    fn build_elf(elf_type: u16, phdrs: &[(u32, u32, u64, u64, u64, u64)], extra: &[u8]) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let mut image = vec![0u8; phoff + phdrs.len() * PHDR_SIZE];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&elf_type.to_le_bytes());
        image[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        image[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
        image[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[56..58].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());

        for (i, &(p_type, p_flags, offset, vaddr, filesz, memsz)) in phdrs.iter().enumerate() {
            let base = phoff + i * PHDR_SIZE;
            image[base..base + 4].copy_from_slice(&p_type.to_le_bytes());
            image[base + 4..base + 8].copy_from_slice(&p_flags.to_le_bytes());
            image[base + 8..base + 16].copy_from_slice(&offset.to_le_bytes());
            image[base + 16..base + 24].copy_from_slice(&vaddr.to_le_bytes());
            image[base + 32..base + 40].copy_from_slice(&filesz.to_le_bytes());
            image[base + 40..base + 48].copy_from_slice(&memsz.to_le_bytes());
            image[base + 48..base + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        }
        image.extend_from_slice(extra);
        image
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = build_elf(ET_EXEC, &[], &[]);
        image[0] = 0;
        assert_eq!(Elf64::parse(&image).err(), Some(ElfError::BadMagic));
    }

    #[test]
    fn rejects_wrong_class() {
        let mut image = build_elf(ET_EXEC, &[], &[]);
        image[4] = 1; // ELFCLASS32
        assert_eq!(Elf64::parse(&image).err(), Some(ElfError::WrongFormat));
    }

    #[test]
    fn rejects_relocatable() {
        let image = build_elf(1 /* ET_REL */, &[], &[]);
        assert_eq!(Elf64::parse(&image).err(), Some(ElfError::NotExecutable));
    }

    #[test]
    fn accepts_pie() {
        let image = build_elf(ET_DYN, &[], &[]);
        let elf = Elf64::parse(&image).unwrap();
        assert!(elf.is_pie());
        assert_eq!(elf.entry, 0x40_1000);
    }

    #[test]
    fn iterates_load_segments() {
        let data_off = (EHDR_SIZE + 2 * PHDR_SIZE) as u64;
        let image = build_elf(
            ET_EXEC,
            &[
                (PT_LOAD, PF_R | PF_X, data_off, 0x400000, 4, 8),
                (PT_PHDR, PF_R, 0, 0x3F0000, 0, 0),
            ],
            b"\xDE\xAD\xBE\xEF",
        );
        let elf = Elf64::parse(&image).unwrap();
        let loads: Vec<_> = elf.program_headers().filter(|p| p.is_load()).collect();
        assert_eq!(loads.len(), 1);
        assert!(loads[0].executable());
        assert!(!loads[0].writable());
        assert_eq!(elf.segment_data(&loads[0]), b"\xDE\xAD\xBE\xEF");
        assert_eq!(loads[0].p_memsz, 8);
    }

    #[test]
    fn rejects_segment_past_eof() {
        let image = build_elf(ET_EXEC, &[(PT_LOAD, PF_R, 0, 0x400000, 1 << 20, 1 << 20)], &[]);
        assert_eq!(
            Elf64::parse(&image).err(),
            Some(ElfError::SegmentOutOfBounds)
        );
    }

    #[test]
    fn finds_interpreter() {
        let data_off = (EHDR_SIZE + PHDR_SIZE) as u64;
        let image = build_elf(
            ET_DYN,
            &[(PT_INTERP, PF_R, data_off, 0, 8, 8)],
            b"/lib/ld\0",
        );
        let elf = Elf64::parse(&image).unwrap();
        assert_eq!(elf.interpreter(), Some("/lib/ld"));
    }
}
