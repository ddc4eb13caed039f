//! x86_64 page table structures (PML4 -> PDPT -> PD -> PT).

use delta_core::addr::PhysAddr;

/// Physical address mask: bits 12..51 of a page table entry.
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Entries in one page table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// First upper-half (kernel) index in a top-level table.
pub const UPPER_HALF_START: usize = 256;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present / valid.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (ring 3).
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Cache disabled.
        const CACHE_DISABLE = 1 << 4;
        /// PS bit: 2 MiB page in a PD entry, 1 GiB page in a PDPT entry.
        const HUGE_PAGE     = 1 << 7;
        /// PAT bit for 4 KiB leaf entries (bit 7 shares the PS position,
        /// which is only meaningful in PD/PDPT entries).
        const PAT_4K        = 1 << 7;
        /// Global page (survives CR3 switches when CR4.PGE is set).
        const GLOBAL        = 1 << 8;
        /// PAT bit for 2 MiB huge pages.
        const PAT_2M        = 1 << 12;
        /// No-execute (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A single page table entry (64 bits).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing at `phys_addr` with the given `flags`.
    pub const fn new(phys_addr: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys_addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        // SAFETY: The masked value fits in 52 bits by construction.
        unsafe { PhysAddr::new_unchecked(self.0 & ADDR_MASK) }
    }

    /// Returns the flags portion of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    /// Returns `true` for a present huge-page leaf (PS set).
    pub const fn is_huge(self) -> bool {
        self.is_present() && (self.0 & (1 << 7)) != 0
    }
}

/// A 4 KiB-aligned page table containing 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries of this table.
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Zero-initializes all entries.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_not_present() {
        let entry = PageTableEntry::empty();
        assert!(!entry.is_present());
        assert!(!entry.is_huge());
    }

    #[test]
    fn entry_address_masked_from_flags() {
        let flags = PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE;
        let entry = PageTableEntry::new(PhysAddr::new(0x1234_5000), flags);
        assert_eq!(entry.address().as_u64(), 0x1234_5000);
        assert!(entry.flags().contains(PageTableFlags::NO_EXECUTE));
        assert!(!entry.flags().contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn huge_detection_requires_present() {
        let huge = PageTableEntry::new(
            PhysAddr::new(0x20_0000),
            PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE,
        );
        assert!(huge.is_huge());
        let stale = PageTableEntry::new(PhysAddr::new(0x20_0000), PageTableFlags::HUGE_PAGE);
        assert!(!stale.is_huge());
    }
}
