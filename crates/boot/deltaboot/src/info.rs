//! Boot-info blob parser and the aggregated [`BootInfo`] view.

use delta_core::addr::PhysAddr;
use heapless::Vec;

use crate::{BOOT_INFO_MAGIC, align8, tag};

/// Maximum number of memory regions retained from the memory map tag.
pub const MAX_MEMORY_REGIONS: usize = 128;

/// Maximum number of application processors retained from the SMP tag.
pub const MAX_SMP_CPUS: usize = 32;

/// Maximum retained command-line length.
const MAX_CMDLINE: usize = 256;

/// Why a blob failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Blob shorter than the fixed header.
    TooShort,
    /// Header magic is not `DBOK`.
    BadMagic,
    /// `total_size` exceeds the provided slice.
    BadTotalSize,
    /// A tag's size field runs past the end of the blob.
    TruncatedTag,
    /// The tag list is not terminated by an `END` tag.
    MissingEnd,
}

/// The kind of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Normal usable RAM.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables that can be reclaimed after parsing.
    AcpiReclaimable,
    /// ACPI Non-Volatile Storage.
    AcpiNvs,
    /// Defective physical memory.
    BadMemory,
    /// Bootloader data, reclaimable after boot.
    Bootloader,
    /// The kernel image.
    Kernel,
    /// Memory-mapped framebuffer.
    Framebuffer,
    /// The initrd image.
    Initrd,
    /// Loaded boot modules.
    Modules,
}

impl MemoryRegionKind {
    fn from_raw(raw: u32) -> Self {
        match raw {
            tag::MEM_USABLE => Self::Usable,
            tag::MEM_ACPI_RECLAIMABLE => Self::AcpiReclaimable,
            tag::MEM_ACPI_NVS => Self::AcpiNvs,
            tag::MEM_BAD => Self::BadMemory,
            tag::MEM_BOOTLOADER => Self::Bootloader,
            tag::MEM_KERNEL => Self::Kernel,
            tag::MEM_FRAMEBUFFER => Self::Framebuffer,
            tag::MEM_INITRD => Self::Initrd,
            tag::MEM_MODULES => Self::Modules,
            _ => Self::Reserved,
        }
    }
}

/// A contiguous physical memory region.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical start address.
    pub base: PhysAddr,
    /// Length in bytes.
    pub length: u64,
    /// Region kind.
    pub kind: MemoryRegionKind,
    /// Firmware attribute bits, passed through unmodified.
    pub attributes: u32,
}

/// Linear framebuffer description.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Physical address of the framebuffer.
    pub address: PhysAddr,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u8,
    /// Bit position of the red channel.
    pub red_shift: u8,
    /// Bit width of the red channel.
    pub red_size: u8,
    /// Bit position of the green channel.
    pub green_shift: u8,
    /// Bit width of the green channel.
    pub green_size: u8,
    /// Bit position of the blue channel.
    pub blue_shift: u8,
    /// Bit width of the blue channel.
    pub blue_size: u8,
}

/// Initial ramdisk location.
#[derive(Debug, Clone, Copy)]
pub struct InitrdInfo {
    /// Physical start address.
    pub start: PhysAddr,
    /// Length in bytes.
    pub length: u64,
}

/// Kernel image physical placement.
#[derive(Debug, Clone, Copy)]
pub struct KernelPhysInfo {
    /// Physical base of the kernel image.
    pub base: PhysAddr,
    /// Length of the kernel image in bytes.
    pub length: u64,
}

/// One application processor from the SMP tag.
#[derive(Debug, Clone, Copy)]
pub struct SmpCpu {
    /// Hardware (local APIC) id.
    pub apic_id: u32,
}

/// Everything the kernel needs from the boot-info blob.
pub struct BootInfo {
    /// Protocol version from the header.
    pub version: u32,
    /// Total blob size in bytes (header + tags), for frame reservation.
    pub total_size: u32,
    /// Physical address the blob was handed over at.
    pub blob_phys: PhysAddr,
    /// Physical memory map, in blob order.
    pub memory_map: Vec<MemoryRegion, MAX_MEMORY_REGIONS>,
    /// Framebuffer, if the bootloader set one up.
    pub framebuffer: Option<FramebufferInfo>,
    /// Kernel command line bytes (without the NUL).
    cmdline: Vec<u8, MAX_CMDLINE>,
    /// ACPI RSDP address and whether it is an XSDP.
    pub rsdp: Option<(PhysAddr, bool)>,
    /// Application processors (BSP excluded).
    pub smp_cpus: Vec<SmpCpu, MAX_SMP_CPUS>,
    /// Bootloader-reported wall-clock seconds since 2000-01-01.
    pub boot_time: Option<u32>,
    /// Kernel image physical placement.
    pub kernel_phys: Option<KernelPhysInfo>,
    /// EFI system table pointer.
    pub efi_system_table: Option<PhysAddr>,
    /// Initial ramdisk.
    pub initrd: Option<InitrdInfo>,
}

impl BootInfo {
    /// Returns the kernel command line, if present and valid UTF-8.
    pub fn cmdline(&self) -> Option<&str> {
        if self.cmdline.is_empty() {
            None
        } else {
            core::str::from_utf8(&self.cmdline).ok()
        }
    }

    /// Parses a boot-info blob.
    ///
    /// `blob_phys` is the physical address the slice was mapped from; it is
    /// recorded so the PMM can reserve the blob's frames.
    pub fn parse(blob: &[u8], blob_phys: PhysAddr) -> Result<Self, ParseError> {
        if blob.len() < tag::HEADER_SIZE {
            return Err(ParseError::TooShort);
        }

        let magic = read_u32(blob, 0);
        if magic != BOOT_INFO_MAGIC {
            return Err(ParseError::BadMagic);
        }
        let total_size = read_u32(blob, 4);
        if (total_size as usize) > blob.len() || (total_size as usize) < tag::HEADER_SIZE {
            return Err(ParseError::BadTotalSize);
        }
        let version = read_u32(blob, 8);

        let mut info = BootInfo {
            version,
            total_size,
            blob_phys,
            memory_map: Vec::new(),
            framebuffer: None,
            cmdline: Vec::new(),
            rsdp: None,
            smp_cpus: Vec::new(),
            boot_time: None,
            kernel_phys: None,
            efi_system_table: None,
            initrd: None,
        };

        let end = total_size as usize;
        let mut off = tag::HEADER_SIZE;
        loop {
            if off + tag::TAG_HEADER_SIZE > end {
                return Err(ParseError::MissingEnd);
            }
            let header = tag::TagHeader {
                tag_type: read_u16(blob, off),
                flags: read_u16(blob, off + 2),
                size: read_u32(blob, off + 4),
            };
            let size = header.size as usize;
            if size < tag::TAG_HEADER_SIZE || off + size > end {
                return Err(ParseError::TruncatedTag);
            }
            if header.tag_type == tag::END {
                break;
            }

            let payload = &blob[off + tag::TAG_HEADER_SIZE..off + size];
            info.decode_tag(header, payload);

            off += align8(size);
        }

        Ok(info)
    }

    fn decode_tag(&mut self, header: tag::TagHeader, payload: &[u8]) {
        match header.tag_type {
            tag::CMDLINE => {
                let text = cstr_bytes(payload);
                let _ = self.cmdline.extend_from_slice(text);
            }
            tag::MEMORY_MAP => {
                if payload.len() < 8 {
                    return;
                }
                let entry_size = read_u32(payload, 0) as usize;
                let entry_count = read_u32(payload, 4) as usize;
                if entry_size < tag::MMAP_ENTRY_SIZE {
                    return;
                }
                for i in 0..entry_count {
                    let base = 8 + i * entry_size;
                    if base + tag::MMAP_ENTRY_SIZE > payload.len() {
                        break;
                    }
                    let region = MemoryRegion {
                        base: PhysAddr::new(read_u64(payload, base)),
                        length: read_u64(payload, base + 8),
                        kind: MemoryRegionKind::from_raw(read_u32(payload, base + 16)),
                        attributes: read_u32(payload, base + 20),
                    };
                    if self.memory_map.push(region).is_err() {
                        break;
                    }
                }
            }
            tag::FRAMEBUFFER => {
                if payload.len() < 27 {
                    return;
                }
                self.framebuffer = Some(FramebufferInfo {
                    address: PhysAddr::new(read_u64(payload, 0)),
                    width: read_u32(payload, 8),
                    height: read_u32(payload, 12),
                    pitch: read_u32(payload, 16),
                    bpp: payload[20],
                    red_shift: payload[21],
                    red_size: payload[22],
                    green_shift: payload[23],
                    green_size: payload[24],
                    blue_shift: payload[25],
                    blue_size: payload[26],
                });
            }
            tag::ACPI_RSDP => {
                if payload.len() < 8 {
                    return;
                }
                let xsdp = header.flags & tag::ACPI_FLAG_XSDP != 0;
                self.rsdp = Some((PhysAddr::new(read_u64(payload, 0)), xsdp));
            }
            tag::SMP => {
                if payload.len() < 4 {
                    return;
                }
                let count = read_u32(payload, 0) as usize;
                for i in 0..count {
                    let base = 4 + i * 4;
                    if base + 4 > payload.len() {
                        break;
                    }
                    let cpu = SmpCpu {
                        apic_id: read_u32(payload, base),
                    };
                    if self.smp_cpus.push(cpu).is_err() {
                        break;
                    }
                }
            }
            tag::BOOT_TIME => {
                if payload.len() >= 4 {
                    self.boot_time = Some(read_u32(payload, 0));
                }
            }
            tag::KERNEL_PHYS => {
                if payload.len() >= 16 {
                    self.kernel_phys = Some(KernelPhysInfo {
                        base: PhysAddr::new(read_u64(payload, 0)),
                        length: read_u64(payload, 8),
                    });
                }
            }
            tag::EFI_SYSTEM_TABLE => {
                if payload.len() >= 8 {
                    self.efi_system_table = Some(PhysAddr::new(read_u64(payload, 0)));
                }
            }
            tag::INITRD => {
                if payload.len() >= 16 {
                    self.initrd = Some(InitrdInfo {
                        start: PhysAddr::new(read_u64(payload, 0)),
                        length: read_u64(payload, 8),
                    });
                }
            }
            // BOOTLOADER, KERNEL_FILE, MODULES: informational, not retained.
            _ => {}
        }
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

/// Returns the bytes of a NUL-terminated payload, without the NUL.
fn cstr_bytes(payload: &[u8]) -> &[u8] {
    match payload.iter().position(|&b| b == 0) {
        Some(n) => &payload[..n],
        None => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a blob from (type, flags, payload) tags, appending END and
    /// patching the header.
    fn build_blob(tags: &[(u16, u16, &[u8])]) -> std::vec::Vec<u8> {
        let mut blob = std::vec::Vec::new();
        blob.extend_from_slice(&BOOT_INFO_MAGIC.to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes()); // total_size, patched below
        blob.extend_from_slice(&1u32.to_le_bytes()); // version
        blob.extend_from_slice(&0u32.to_le_bytes()); // reserved

        for &(tag_type, flags, payload) in tags {
            let size = (tag::TAG_HEADER_SIZE + payload.len()) as u32;
            blob.extend_from_slice(&tag_type.to_le_bytes());
            blob.extend_from_slice(&flags.to_le_bytes());
            blob.extend_from_slice(&size.to_le_bytes());
            blob.extend_from_slice(payload);
            while blob.len() % 8 != 0 {
                blob.push(0);
            }
        }
        // END tag.
        blob.extend_from_slice(&tag::END.to_le_bytes());
        blob.extend_from_slice(&0u16.to_le_bytes());
        blob.extend_from_slice(&8u32.to_le_bytes());

        let total = blob.len() as u32;
        blob[4..8].copy_from_slice(&total.to_le_bytes());
        blob
    }

    fn mmap_payload(entries: &[(u64, u64, u32)]) -> std::vec::Vec<u8> {
        let mut p = std::vec::Vec::new();
        p.extend_from_slice(&(tag::MMAP_ENTRY_SIZE as u32).to_le_bytes());
        p.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for &(base, length, kind) in entries {
            p.extend_from_slice(&base.to_le_bytes());
            p.extend_from_slice(&length.to_le_bytes());
            p.extend_from_slice(&kind.to_le_bytes());
            p.extend_from_slice(&0u32.to_le_bytes());
        }
        p
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = build_blob(&[]);
        blob[0] = 0;
        assert!(matches!(
            BootInfo::parse(&blob, PhysAddr::zero()),
            Err(ParseError::BadMagic)
        ));
    }

    #[test]
    fn parses_empty_blob() {
        let blob = build_blob(&[]);
        let info = BootInfo::parse(&blob, PhysAddr::new(0x1000)).unwrap();
        assert_eq!(info.version, 1);
        assert!(info.memory_map.is_empty());
        assert!(info.framebuffer.is_none());
        assert_eq!(info.blob_phys.as_u64(), 0x1000);
    }

    #[test]
    fn parses_memory_map() {
        let payload = mmap_payload(&[
            (0x0, 0x100000, tag::MEM_RESERVED),
            (0x100000, 0x3F00000, tag::MEM_USABLE),
        ]);
        let blob = build_blob(&[(tag::MEMORY_MAP, 0, &payload)]);
        let info = BootInfo::parse(&blob, PhysAddr::zero()).unwrap();
        assert_eq!(info.memory_map.len(), 2);
        assert_eq!(info.memory_map[1].kind, MemoryRegionKind::Usable);
        assert_eq!(info.memory_map[1].base.as_u64(), 0x100000);
        assert_eq!(info.memory_map[1].length, 0x3F00000);
    }

    #[test]
    fn parses_cmdline_and_initrd() {
        let mut initrd = std::vec::Vec::new();
        initrd.extend_from_slice(&0x200000u64.to_le_bytes());
        initrd.extend_from_slice(&0x8000u64.to_le_bytes());
        let blob = build_blob(&[
            (tag::CMDLINE, 0, b"console=serial\0"),
            (tag::INITRD, 0, &initrd),
        ]);
        let info = BootInfo::parse(&blob, PhysAddr::zero()).unwrap();
        assert_eq!(info.cmdline(), Some("console=serial"));
        let rd = info.initrd.unwrap();
        assert_eq!(rd.start.as_u64(), 0x200000);
        assert_eq!(rd.length, 0x8000);
    }

    #[test]
    fn parses_rsdp_xsdp_flag() {
        let addr = 0xE0000u64.to_le_bytes();
        let blob = build_blob(&[(tag::ACPI_RSDP, tag::ACPI_FLAG_XSDP, &addr)]);
        let info = BootInfo::parse(&blob, PhysAddr::zero()).unwrap();
        assert_eq!(info.rsdp, Some((PhysAddr::new(0xE0000), true)));
    }

    #[test]
    fn parses_smp_cpus() {
        let mut payload = std::vec::Vec::new();
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&2u32.to_le_bytes());
        let blob = build_blob(&[(tag::SMP, 0, &payload)]);
        let info = BootInfo::parse(&blob, PhysAddr::zero()).unwrap();
        assert_eq!(info.smp_cpus.len(), 2);
        assert_eq!(info.smp_cpus[1].apic_id, 2);
    }

    #[test]
    fn truncated_tag_rejected() {
        let mut blob = build_blob(&[]);
        // Claim a tag bigger than the blob.
        let total = blob.len() as u32;
        blob[16..18].copy_from_slice(&tag::CMDLINE.to_le_bytes());
        blob[20..24].copy_from_slice(&(total + 64).to_le_bytes());
        assert!(matches!(
            BootInfo::parse(&blob, PhysAddr::zero()),
            Err(ParseError::TruncatedTag) | Err(ParseError::MissingEnd)
        ));
    }
}
