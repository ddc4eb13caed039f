//! Page table walker: builds and walks x86_64 page tables via the HHDM.
//!
//! All physical accesses go through `hhdm_offset + phys`, so the walker has
//! no dependency on CPU state and is exercised directly by host tests. TLB
//! maintenance is the caller's job (the VMM invalidates after leaf writes).

use delta_core::addr::{PAGE_SIZE, PAGE_SIZE_2M, PhysAddr, VirtAddr};

use crate::arch::x86_64::paging::{ENTRIES_PER_TABLE, PageTable, PageTableEntry, PageTableFlags};

bitflags::bitflags! {
    /// Architecture-independent mapping flags.
    ///
    /// Present is implied; no-execute is the default unless `EXECUTE` is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Page is writable.
        const WRITE         = 1 << 0;
        /// Page is accessible from user mode.
        const USER          = 1 << 1;
        /// Page is executable.
        const EXECUTE       = 1 << 2;
        /// Caching disabled (MMIO).
        const CACHE_DISABLE = 1 << 3;
        /// Write-combining memory type (framebuffers).
        const WRITE_COMBINE = 1 << 4;
        /// Global mapping, survives address-space switches.
        const GLOBAL        = 1 << 5;
    }
}

impl MapFlags {
    /// Converts to native entry flags for a 4 KiB leaf.
    ///
    /// Write-combining selects PAT index 4 (PAT bit set, PCD/PWT clear);
    /// the boot path programs PAT entry 4 to WC.
    pub fn to_native_4k(self) -> PageTableFlags {
        let mut native = self.to_native_common();
        if self.contains(Self::WRITE_COMBINE) {
            native |= PageTableFlags::PAT_4K;
        }
        native
    }

    /// Converts to native entry flags for a 2 MiB leaf.
    pub fn to_native_2m(self) -> PageTableFlags {
        let mut native = self.to_native_common() | PageTableFlags::HUGE_PAGE;
        if self.contains(Self::WRITE_COMBINE) {
            native |= PageTableFlags::PAT_2M;
        }
        native
    }

    fn to_native_common(self) -> PageTableFlags {
        let mut native = PageTableFlags::PRESENT;
        if self.contains(Self::WRITE) {
            native |= PageTableFlags::WRITABLE;
        }
        if !self.contains(Self::EXECUTE) {
            native |= PageTableFlags::NO_EXECUTE;
        }
        if self.contains(Self::USER) {
            native |= PageTableFlags::USER;
        }
        if self.contains(Self::CACHE_DISABLE) {
            native |= PageTableFlags::CACHE_DISABLE;
        }
        if self.contains(Self::GLOBAL) {
            native |= PageTableFlags::GLOBAL;
        }
        native
    }
}

/// Result of translating a virtual address.
#[derive(Debug, Clone, Copy)]
pub enum TranslateResult {
    /// Mapped via a 4 KiB leaf.
    Page4K {
        /// Physical frame base.
        frame: PhysAddr,
        /// Leaf entry flags.
        flags: PageTableFlags,
    },
    /// Mapped via a 2 MiB leaf.
    Page2M {
        /// Physical base of the 2 MiB page.
        phys_start: PhysAddr,
        /// Leaf entry flags.
        flags: PageTableFlags,
    },
    /// The address is not mapped.
    NotMapped,
}

/// Error from unmap operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The page is not mapped.
    NotMapped,
    /// The entry maps a different page size than requested.
    SizeMismatch,
}

/// Walks and builds page tables through the HHDM window.
pub struct PageTableMapper {
    hhdm_offset: u64,
}

impl PageTableMapper {
    /// Creates a mapper using the given HHDM offset.
    pub fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    /// The HHDM offset this mapper was built with.
    pub fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        (self.hhdm_offset + phys.as_u64()) as *mut u8
    }

    /// Returns a mutable reference to the [`PageTable`] at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must point to a valid, 4 KiB-aligned table reachable through
    /// the HHDM, with no concurrent mutation.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// Ensures `table[index]` points at a next-level table, allocating and
    /// zeroing one if the entry is empty. Missing intermediate flags are
    /// OR'd in so mixed kernel/user subtrees stay traversable.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate: PageTableFlags,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Option<PhysAddr> {
        // SAFETY: Caller guarantees table_phys is a valid table.
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            let combined = entry.flags() | intermediate;
            if combined != entry.flags() {
                table.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            Some(entry.address())
        } else {
            let frame = alloc()?;
            // SAFETY: The frame was just allocated for us and the HHDM covers
            // it. Zeroing prevents stale data being read as present entries.
            unsafe {
                core::ptr::write_bytes(self.phys_to_virt(frame), 0, PAGE_SIZE);
            }
            table.entries[index] = PageTableEntry::new(frame, intermediate);
            Some(frame)
        }
    }

    fn intermediate_flags_for(leaf: PageTableFlags) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if leaf.contains(PageTableFlags::USER) {
            flags |= PageTableFlags::USER;
        }
        flags
    }

    /// Maps a 4 KiB page, splitting a 2 MiB entry in the way if necessary.
    ///
    /// Returns `false` if an intermediate table could not be allocated.
    ///
    /// # Safety
    ///
    /// - `root` must point to a valid top-level table.
    /// - `alloc` must hand out unused, HHDM-covered 4 KiB frames.
    /// - The caller must invalidate the TLB for `virt` afterwards.
    pub unsafe fn map_4k(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> bool {
        let intermediate = Self::intermediate_flags_for(flags);
        // SAFETY: Forwarded caller contract.
        let Some(pdpt) = (unsafe { self.ensure_table(root, virt.pml4_index(), intermediate, alloc) })
        else {
            return false;
        };
        let Some(pd) = (unsafe { self.ensure_table(pdpt, virt.pdpt_index(), intermediate, alloc) })
        else {
            return false;
        };

        // A 2 MiB leaf occupying the slot must be shattered before a 4 KiB
        // entry can land inside its range.
        // SAFETY: pd is a valid PD table per the walk above.
        let pde = unsafe { self.table_at(pd) }.entries[virt.pd_index()];
        if pde.is_huge() && unsafe { !self.split_2mib(pd, virt, alloc) } {
            return false;
        }

        let Some(pt) = (unsafe { self.ensure_table(pd, virt.pd_index(), intermediate, alloc) })
        else {
            return false;
        };
        // SAFETY: pt is a valid PT table per the walk above.
        let pt_table = unsafe { self.table_at(pt) };
        pt_table.entries[virt.pt_index()] = PageTableEntry::new(phys, flags);
        true
    }

    /// Maps a 2 MiB huge page.
    ///
    /// # Safety
    ///
    /// Same contract as [`map_4k`]; `virt` and `phys` must be 2 MiB aligned.
    pub unsafe fn map_2mib(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> bool {
        debug_assert!(virt.is_aligned(PAGE_SIZE_2M as u64));
        debug_assert!(phys.is_aligned(PAGE_SIZE_2M as u64));
        let intermediate = Self::intermediate_flags_for(flags);
        // SAFETY: Forwarded caller contract.
        let Some(pdpt) = (unsafe { self.ensure_table(root, virt.pml4_index(), intermediate, alloc) })
        else {
            return false;
        };
        let Some(pd) = (unsafe { self.ensure_table(pdpt, virt.pdpt_index(), intermediate, alloc) })
        else {
            return false;
        };
        // SAFETY: pd is a valid PD table per the walk above.
        let pd_table = unsafe { self.table_at(pd) };
        pd_table.entries[virt.pd_index()] =
            PageTableEntry::new(phys, flags | PageTableFlags::HUGE_PAGE);
        true
    }

    /// Splits the 2 MiB leaf covering `virt` into 512 4 KiB entries with the
    /// original flags. The caller must invalidate the covered range.
    ///
    /// # Safety
    ///
    /// `pd` must be the PD table whose entry for `virt` is a present huge
    /// leaf; `alloc` as in [`map_4k`].
    unsafe fn split_2mib(
        &self,
        pd: PhysAddr,
        virt: VirtAddr,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> bool {
        // SAFETY: Caller guarantees pd is a valid PD table.
        let pd_table = unsafe { self.table_at(pd) };
        let huge = pd_table.entries[virt.pd_index()];
        debug_assert!(huge.is_huge());

        let Some(pt_frame) = alloc() else {
            return false;
        };
        // Carry the leaf flags over, translating the 2 MiB PAT bit to its
        // 4 KiB position and dropping PS.
        let mut leaf_flags = huge.flags();
        leaf_flags.remove(PageTableFlags::HUGE_PAGE);
        if huge.flags().contains(PageTableFlags::PAT_2M) {
            leaf_flags.remove(PageTableFlags::PAT_2M);
            leaf_flags |= PageTableFlags::PAT_4K;
        }

        // SAFETY: The new frame is unused and HHDM-covered.
        unsafe {
            core::ptr::write_bytes(self.phys_to_virt(pt_frame), 0, PAGE_SIZE);
        }
        // SAFETY: pt_frame was just allocated and zeroed.
        let pt_table = unsafe { self.table_at(pt_frame) };
        let base = huge.address();
        for i in 0..ENTRIES_PER_TABLE {
            pt_table.entries[i] =
                PageTableEntry::new(base + (i * PAGE_SIZE) as u64, leaf_flags);
        }

        pd_table.entries[virt.pd_index()] =
            PageTableEntry::new(pt_frame, Self::intermediate_flags_for(leaf_flags));
        true
    }

    /// Unmaps a 4 KiB page and returns its frame.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid top-level table; the caller must
    /// invalidate the TLB for `virt` afterwards.
    pub unsafe fn unmap_4k(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
    ) -> Result<PhysAddr, UnmapError> {
        // SAFETY: Caller guarantees root is valid.
        let pml4e = unsafe { self.table_at(root) }.entries[virt.pml4_index()];
        if !pml4e.is_present() {
            return Err(UnmapError::NotMapped);
        }
        // SAFETY: Present entries point at valid tables.
        let pdpte = unsafe { self.table_at(pml4e.address()) }.entries[virt.pdpt_index()];
        if !pdpte.is_present() {
            return Err(UnmapError::NotMapped);
        }
        if pdpte.is_huge() {
            return Err(UnmapError::SizeMismatch);
        }
        // SAFETY: As above.
        let pd = unsafe { self.table_at(pdpte.address()) };
        let pde = pd.entries[virt.pd_index()];
        if !pde.is_present() {
            return Err(UnmapError::NotMapped);
        }
        if pde.is_huge() {
            return Err(UnmapError::SizeMismatch);
        }
        // SAFETY: As above.
        let pt = unsafe { self.table_at(pde.address()) };
        let pte = pt.entries[virt.pt_index()];
        if !pte.is_present() {
            return Err(UnmapError::NotMapped);
        }
        pt.entries[virt.pt_index()] = PageTableEntry::empty();
        Ok(pte.address())
    }

    /// Unmaps a 2 MiB huge page and returns its physical base.
    ///
    /// # Safety
    ///
    /// Same contract as [`unmap_4k`].
    pub unsafe fn unmap_2mib(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
    ) -> Result<PhysAddr, UnmapError> {
        // SAFETY: Caller guarantees root is valid.
        let pml4e = unsafe { self.table_at(root) }.entries[virt.pml4_index()];
        if !pml4e.is_present() {
            return Err(UnmapError::NotMapped);
        }
        // SAFETY: Present entries point at valid tables.
        let pdpte = unsafe { self.table_at(pml4e.address()) }.entries[virt.pdpt_index()];
        if !pdpte.is_present() {
            return Err(UnmapError::NotMapped);
        }
        if pdpte.is_huge() {
            return Err(UnmapError::SizeMismatch);
        }
        // SAFETY: As above.
        let pd = unsafe { self.table_at(pdpte.address()) };
        let pde = pd.entries[virt.pd_index()];
        if !pde.is_present() {
            return Err(UnmapError::NotMapped);
        }
        if !pde.is_huge() {
            return Err(UnmapError::SizeMismatch);
        }
        pd.entries[virt.pd_index()] = PageTableEntry::empty();
        Ok(pde.address())
    }

    /// Translates a virtual address, reporting the mapping granularity.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid top-level table.
    pub unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> TranslateResult {
        // SAFETY: Caller guarantees root is valid.
        let pml4e = unsafe { self.table_at(root) }.entries[virt.pml4_index()];
        if !pml4e.is_present() {
            return TranslateResult::NotMapped;
        }
        // SAFETY: Present entries point at valid tables.
        let pdpte = unsafe { self.table_at(pml4e.address()) }.entries[virt.pdpt_index()];
        if !pdpte.is_present() {
            return TranslateResult::NotMapped;
        }
        // SAFETY: As above.
        let pde = unsafe { self.table_at(pdpte.address()) }.entries[virt.pd_index()];
        if !pde.is_present() {
            return TranslateResult::NotMapped;
        }
        if pde.is_huge() {
            return TranslateResult::Page2M {
                phys_start: pde.address(),
                flags: pde.flags(),
            };
        }
        // SAFETY: As above.
        let pte = unsafe { self.table_at(pde.address()) }.entries[virt.pt_index()];
        if !pte.is_present() {
            return TranslateResult::NotMapped;
        }
        TranslateResult::Page4K {
            frame: pte.address(),
            flags: pte.flags(),
        }
    }

    /// Translates a virtual address to physical, adding the in-leaf offset.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid top-level table.
    pub unsafe fn translate_addr(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Forwarded caller contract.
        match unsafe { self.translate(root, virt) } {
            TranslateResult::Page4K { frame, .. } => Some(frame + virt.page_offset()),
            TranslateResult::Page2M { phys_start, .. } => {
                Some(phys_start + (virt.as_u64() & (PAGE_SIZE_2M as u64 - 1)))
            }
            TranslateResult::NotMapped => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    /// Fake physical memory backing page tables for walker tests. The base
    /// address of the aligned host buffer is used as the HHDM offset, so
    /// physical addresses are offsets into the buffer.
    struct FakePhys {
        base: *mut u8,
        size: usize,
        next: core::cell::Cell<usize>,
    }

    impl FakePhys {
        fn new(pages: usize) -> Self {
            let size = pages * PAGE_SIZE;
            let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
            // SAFETY: layout has non-zero size.
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self {
                base,
                size,
                next: core::cell::Cell::new(0),
            }
        }

        fn hhdm(&self) -> u64 {
            self.base as u64
        }

        fn alloc_frame(&self) -> Option<PhysAddr> {
            let off = self.next.get();
            if off + PAGE_SIZE > self.size {
                return None;
            }
            self.next.set(off + PAGE_SIZE);
            Some(PhysAddr::new(off as u64))
        }
    }

    impl Drop for FakePhys {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.size, PAGE_SIZE).unwrap();
            // SAFETY: Same layout as the allocation.
            unsafe { std::alloc::dealloc(self.base, layout) };
        }
    }

    fn setup(pages: usize) -> (FakePhys, PageTableMapper, PhysAddr) {
        let phys = FakePhys::new(pages);
        let mapper = PageTableMapper::new(phys.hhdm());
        let root = phys.alloc_frame().unwrap();
        (phys, mapper, root)
    }

    #[test]
    fn map_translate_unmap_4k() {
        let (phys, mapper, root) = setup(32);
        let virt = VirtAddr::new(0x40_0000);
        let target = PhysAddr::new(0x7000);

        // SAFETY: Test tables live in the fake buffer.
        unsafe {
            assert!(mapper.map_4k(
                root,
                virt,
                target,
                MapFlags::WRITE.to_native_4k(),
                &mut || phys.alloc_frame(),
            ));
            assert_eq!(mapper.translate_addr(root, virt + 0x123), Some(target + 0x123));
            assert_eq!(mapper.unmap_4k(root, virt), Ok(target));
            assert!(mapper.translate_addr(root, virt).is_none());
            assert_eq!(mapper.unmap_4k(root, virt), Err(UnmapError::NotMapped));
        }
    }

    #[test]
    fn nx_is_default() {
        let (phys, mapper, root) = setup(32);
        let virt = VirtAddr::new(0x40_0000);

        // SAFETY: Test tables live in the fake buffer.
        unsafe {
            mapper.map_4k(
                root,
                virt,
                PhysAddr::new(0x3000),
                MapFlags::WRITE.to_native_4k(),
                &mut || phys.alloc_frame(),
            );
            match mapper.translate(root, virt) {
                TranslateResult::Page4K { flags, .. } => {
                    assert!(flags.contains(PageTableFlags::NO_EXECUTE));
                }
                other => panic!("unexpected mapping {other:?}"),
            }

            mapper.map_4k(
                root,
                virt + PAGE_SIZE as u64,
                PhysAddr::new(0x4000),
                (MapFlags::WRITE | MapFlags::EXECUTE).to_native_4k(),
                &mut || phys.alloc_frame(),
            );
            match mapper.translate(root, virt + PAGE_SIZE as u64) {
                TranslateResult::Page4K { flags, .. } => {
                    assert!(!flags.contains(PageTableFlags::NO_EXECUTE));
                }
                other => panic!("unexpected mapping {other:?}"),
            }
        }
    }

    #[test]
    fn map_2mib_translates_with_offset() {
        let (phys, mapper, root) = setup(32);
        let virt = VirtAddr::new(0x4000_0000);
        let target = PhysAddr::new(0x20_0000);

        // SAFETY: Test tables live in the fake buffer.
        unsafe {
            assert!(mapper.map_2mib(
                root,
                virt,
                target,
                MapFlags::WRITE.to_native_2m(),
                &mut || phys.alloc_frame(),
            ));
            let probe = virt + 0x12_3456;
            assert_eq!(mapper.translate_addr(root, probe), Some(target + 0x12_3456));
            assert_eq!(
                mapper.unmap_4k(root, virt),
                Err(UnmapError::SizeMismatch),
                "a huge leaf must not be unmapped at 4 KiB granularity"
            );
        }
    }

    #[test]
    fn mapping_4k_inside_huge_page_splits_it() {
        let (phys, mapper, root) = setup(64);
        let virt = VirtAddr::new(0x4000_0000);
        let huge_base = PhysAddr::new(0x20_0000);

        // SAFETY: Test tables live in the fake buffer.
        unsafe {
            mapper.map_2mib(
                root,
                virt,
                huge_base,
                (MapFlags::WRITE | MapFlags::GLOBAL).to_native_2m(),
                &mut || phys.alloc_frame(),
            );

            // Overwrite one 4 KiB page in the middle of the huge range.
            let inner = virt + 5 * PAGE_SIZE as u64;
            let new_frame = PhysAddr::new(0x9000);
            assert!(mapper.map_4k(
                root,
                inner,
                new_frame,
                MapFlags::WRITE.to_native_4k(),
                &mut || phys.alloc_frame(),
            ));

            // The overwritten page points at the new frame...
            assert_eq!(mapper.translate_addr(root, inner), Some(new_frame));
            // ...while its neighbours keep the original backing and flags.
            let neighbour = virt + 4 * PAGE_SIZE as u64;
            assert_eq!(
                mapper.translate_addr(root, neighbour),
                Some(huge_base + 4 * PAGE_SIZE as u64)
            );
            match mapper.translate(root, neighbour) {
                TranslateResult::Page4K { flags, .. } => {
                    assert!(flags.contains(PageTableFlags::GLOBAL));
                    assert!(flags.contains(PageTableFlags::WRITABLE));
                }
                other => panic!("expected split 4K mapping, got {other:?}"),
            }
            let last = virt + 511 * PAGE_SIZE as u64;
            assert_eq!(
                mapper.translate_addr(root, last),
                Some(huge_base + 511 * PAGE_SIZE as u64)
            );
        }
    }

    #[test]
    fn split_translates_wc_pat_bit() {
        let (phys, mapper, root) = setup(64);
        let virt = VirtAddr::new(0x4000_0000);

        // SAFETY: Test tables live in the fake buffer.
        unsafe {
            mapper.map_2mib(
                root,
                virt,
                PhysAddr::new(0x20_0000),
                (MapFlags::WRITE | MapFlags::WRITE_COMBINE).to_native_2m(),
                &mut || phys.alloc_frame(),
            );
            // Force a split by remapping one page inside.
            mapper.map_4k(
                root,
                virt,
                PhysAddr::new(0x9000),
                MapFlags::WRITE.to_native_4k(),
                &mut || phys.alloc_frame(),
            );
            // A surviving neighbour carries the PAT bit in its 4 KiB position.
            match mapper.translate(root, virt + PAGE_SIZE as u64) {
                TranslateResult::Page4K { flags, .. } => {
                    assert!(flags.contains(PageTableFlags::PAT_4K));
                }
                other => panic!("expected 4K mapping, got {other:?}"),
            }
        }
    }

    #[test]
    fn user_flag_propagates_to_intermediates() {
        let (phys, mapper, root) = setup(32);
        let virt = VirtAddr::new(0x40_0000);

        // SAFETY: Test tables live in the fake buffer.
        unsafe {
            mapper.map_4k(
                root,
                virt,
                PhysAddr::new(0x5000),
                (MapFlags::WRITE | MapFlags::USER).to_native_4k(),
                &mut || phys.alloc_frame(),
            );
            let pml4e = mapper.table_at(root).entries[virt.pml4_index()];
            assert!(pml4e.flags().contains(PageTableFlags::USER));
        }
    }

    #[test]
    fn alloc_failure_reports_false() {
        let (_phys, mapper, root) = setup(1);
        // SAFETY: Only the root table is touched before allocation fails.
        unsafe {
            assert!(!mapper.map_4k(
                root,
                VirtAddr::new(0x40_0000),
                PhysAddr::new(0x5000),
                MapFlags::WRITE.to_native_4k(),
                &mut || None,
            ));
        }
    }
}
