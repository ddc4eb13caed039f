//! Virtual memory manager.
//!
//! Owns the kernel pagemap and is the only code that installs or removes
//! virtual mappings. User pagemaps share the kernel's upper half: creation
//! copies the top-level kernel entries, teardown frees only the lower-half
//! paging structures.

use delta_core::addr::{PAGE_SIZE, PAGE_SIZE_2M, PhysAddr, VirtAddr};
use delta_core::sync::SpinLock;

use crate::arch::x86_64::paging::{ENTRIES_PER_TABLE, PageTable, UPPER_HALF_START};
use crate::mm::mapper::{MapFlags, PageTableMapper, TranslateResult, UnmapError};
use crate::mm::pmm;

/// Base of the kernel heap's virtual window.
pub const KHEAP_VIRT_START: u64 = 0xFFFF_9000_0000_0000;

/// End of the kernel heap's virtual window (64 GiB).
pub const KHEAP_VIRT_END: u64 = 0xFFFF_9010_0000_0000;

/// Frames of a 2 MiB run.
const FRAMES_PER_2M: usize = PAGE_SIZE_2M / PAGE_SIZE;

/// A root of a four-level translation tree.
///
/// The kernel has one; every user process has exactly one whose upper half
/// aliases the kernel's.
#[derive(Debug)]
pub struct Pagemap {
    root: PhysAddr,
}

impl Pagemap {
    /// Wraps an existing root table (the kernel pagemap at boot).
    pub fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    /// Physical address of the top-level table.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Creates a user pagemap whose upper half aliases `kernel_root`.
    ///
    /// # Safety
    ///
    /// `kernel_root` must be a valid top-level table reachable through the
    /// mapper's HHDM window, and `alloc` must hand out unused frames.
    pub unsafe fn new_user(
        kernel_root: PhysAddr,
        mapper: &PageTableMapper,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Option<Self> {
        let root = alloc()?;
        let hhdm = mapper.hhdm_offset();
        // SAFETY: Both frames are HHDM-covered; the new root is exclusively
        // ours and the kernel upper half is immutable after boot.
        unsafe {
            let dst = (hhdm + root.as_u64()) as *mut PageTable;
            core::ptr::write_bytes(dst as *mut u8, 0, PAGE_SIZE);
            let src = (hhdm + kernel_root.as_u64()) as *const PageTable;
            for i in UPPER_HALF_START..ENTRIES_PER_TABLE {
                (*dst).entries[i] = (*src).entries[i];
            }
        }
        Some(Self { root })
    }

    /// Frees the lower-half paging structures of a user pagemap.
    ///
    /// Only table frames are released; leaf frames belong to VMAs or to the
    /// objects backing them and are freed by process teardown. Upper-half
    /// entries alias kernel tables and are left alone.
    ///
    /// # Safety
    ///
    /// The pagemap must not be loaded on any CPU, and all of its tables must
    /// be reachable through the mapper's HHDM window.
    pub unsafe fn destroy_user(
        self,
        mapper: &PageTableMapper,
        free: &mut dyn FnMut(PhysAddr),
    ) {
        let hhdm = mapper.hhdm_offset();
        let table_at = |phys: PhysAddr| (hhdm + phys.as_u64()) as *mut PageTable;

        // SAFETY: Caller guarantees exclusive access to the tree.
        unsafe {
            let root = table_at(self.root);
            for pml4_idx in 0..UPPER_HALF_START {
                let pml4e = (*root).entries[pml4_idx];
                if !pml4e.is_present() {
                    continue;
                }
                let pdpt = table_at(pml4e.address());
                for pdpt_idx in 0..ENTRIES_PER_TABLE {
                    let pdpte = (*pdpt).entries[pdpt_idx];
                    if !pdpte.is_present() || pdpte.is_huge() {
                        continue;
                    }
                    let pd = table_at(pdpte.address());
                    for pd_idx in 0..ENTRIES_PER_TABLE {
                        let pde = (*pd).entries[pd_idx];
                        if pde.is_present() && !pde.is_huge() {
                            free(pde.address());
                        }
                    }
                    free(pdpte.address());
                }
                free(pml4e.address());
            }
            free(self.root);
        }
    }
}

/// The kernel-side VMM: kernel pagemap + mapper.
pub struct Vmm {
    kernel_map: Pagemap,
    mapper: PageTableMapper,
}

impl Vmm {
    /// Creates the VMM over the boot page tables.
    pub fn new(kernel_root: PhysAddr, hhdm_offset: u64) -> Self {
        Self {
            kernel_map: Pagemap::from_root(kernel_root),
            mapper: PageTableMapper::new(hhdm_offset),
        }
    }

    /// The kernel pagemap root.
    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel_map.root()
    }

    /// The page-table mapper (shared HHDM window).
    pub fn mapper(&self) -> &PageTableMapper {
        &self.mapper
    }

    /// Maps `count` frames at `virt` -> `phys` into an arbitrary pagemap.
    ///
    /// Uses 2 MiB leaves whenever both addresses are 2 MiB aligned and at
    /// least 512 frames remain; a huge entry in the way of a finer mapping
    /// is split. Each leaf write is followed by a TLB invalidation on the
    /// calling CPU.
    ///
    /// # Safety
    ///
    /// `root` must be a valid pagemap and the range must not be in use by
    /// concurrent walkers.
    pub unsafe fn map_range(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        count: usize,
        flags: MapFlags,
    ) -> bool {
        let mut alloc = || pmm::alloc(1);
        let mut i = 0usize;
        while i < count {
            let v = virt + (i * PAGE_SIZE) as u64;
            let p = phys + (i * PAGE_SIZE) as u64;
            let remaining = count - i;

            if v.is_aligned(PAGE_SIZE_2M as u64)
                && p.is_aligned(PAGE_SIZE_2M as u64)
                && remaining >= FRAMES_PER_2M
            {
                // SAFETY: Forwarded caller contract.
                if !unsafe { self.mapper.map_2mib(root, v, p, flags.to_native_2m(), &mut alloc) }
                {
                    return false;
                }
                flush_range(v, FRAMES_PER_2M);
                i += FRAMES_PER_2M;
            } else {
                // SAFETY: Forwarded caller contract.
                if !unsafe { self.mapper.map_4k(root, v, p, flags.to_native_4k(), &mut alloc) } {
                    return false;
                }
                flush_page(v);
                i += 1;
            }
        }
        true
    }

    /// Maps into the kernel pagemap.
    ///
    /// # Safety
    ///
    /// As [`map_range`].
    pub unsafe fn kernel_map(
        &self,
        virt: VirtAddr,
        phys: PhysAddr,
        count: usize,
        flags: MapFlags,
    ) -> bool {
        // SAFETY: Forwarded caller contract.
        unsafe { self.map_range(self.kernel_map.root(), virt, phys, count, flags) }
    }

    /// Unmaps `count` pages at `virt` from `root`, invalidating each.
    ///
    /// Huge leaves covering part of the range are unmapped whole when the
    /// range covers them, otherwise split first so only the requested pages
    /// disappear.
    ///
    /// # Safety
    ///
    /// As [`map_range`].
    pub unsafe fn unmap_range(&self, root: PhysAddr, virt: VirtAddr, count: usize) {
        let mut i = 0usize;
        while i < count {
            let v = virt + (i * PAGE_SIZE) as u64;
            let remaining = count - i;

            if v.is_aligned(PAGE_SIZE_2M as u64) && remaining >= FRAMES_PER_2M {
                // SAFETY: Forwarded caller contract.
                match unsafe { self.mapper.unmap_2mib(root, v) } {
                    Ok(_) => {
                        flush_range(v, FRAMES_PER_2M);
                        i += FRAMES_PER_2M;
                        continue;
                    }
                    Err(UnmapError::SizeMismatch) => {} // 4 KiB entries below
                    Err(UnmapError::NotMapped) => {
                        i += FRAMES_PER_2M;
                        continue;
                    }
                }
            }

            // SAFETY: Forwarded caller contract. A huge page partially
            // covered by the range is split by mapping logic beforehand;
            // a SizeMismatch here means the caller is unmapping inside a
            // huge leaf it never owned, which we skip.
            let _ = unsafe { self.mapper.unmap_4k(root, v) };
            flush_page(v);
            i += 1;
        }
    }

    /// Unmaps from the kernel pagemap.
    ///
    /// # Safety
    ///
    /// As [`map_range`].
    pub unsafe fn kernel_unmap(&self, virt: VirtAddr, count: usize) {
        // SAFETY: Forwarded caller contract.
        unsafe { self.unmap_range(self.kernel_map.root(), virt, count) }
    }

    /// Resolves a kernel virtual address to physical.
    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: The kernel pagemap is valid for the life of the system.
        unsafe { self.mapper.translate_addr(self.kernel_map.root(), virt) }
    }

    /// Reports the mapping granularity of a kernel virtual address.
    pub fn translate(&self, virt: VirtAddr) -> TranslateResult {
        // SAFETY: The kernel pagemap is valid for the life of the system.
        unsafe { self.mapper.translate(self.kernel_map.root(), virt) }
    }
}

// ---------------------------------------------------------------------------
// TLB maintenance
// ---------------------------------------------------------------------------

/// Invalidates one page on the calling CPU.
#[inline]
pub fn flush_page(virt: VirtAddr) {
    #[cfg(target_os = "none")]
    crate::arch::x86_64::instructions::invlpg(virt);
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Invalidates `count` pages on the calling CPU.
#[inline]
pub fn flush_range(virt: VirtAddr, count: usize) {
    for i in 0..count {
        flush_page(virt + (i * PAGE_SIZE) as u64);
    }
}

// ---------------------------------------------------------------------------
// Global VMM
// ---------------------------------------------------------------------------

/// Global virtual memory manager.
static VMM: SpinLock<Option<Vmm>> = SpinLock::new(None);

/// Installs the global VMM.
///
/// # Panics
///
/// Panics on double initialization.
pub fn init(kernel_root: PhysAddr, hhdm_offset: u64) {
    let mut global = VMM.lock();
    assert!(global.is_none(), "VMM already initialized");
    *global = Some(Vmm::new(kernel_root, hhdm_offset));
}

/// Executes a closure with the global VMM.
///
/// # Panics
///
/// Panics if the VMM has not been initialized.
pub fn with_vmm<R>(f: impl FnOnce(&Vmm) -> R) -> R {
    let vmm = VMM.lock();
    f(vmm.as_ref().expect("VMM not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use core::cell::RefCell;

    struct FakePhys {
        base: *mut u8,
        size: usize,
        next: RefCell<usize>,
        freed: RefCell<Vec<PhysAddr>>,
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
                next: RefCell::new(0),
                freed: RefCell::new(Vec::new()),
            }
        }

        fn hhdm(&self) -> u64 {
            self.base as u64
        }

        fn alloc_frame(&self) -> Option<PhysAddr> {
            let mut next = self.next.borrow_mut();
            if *next + PAGE_SIZE > self.size {
                return None;
            }
            let addr = PhysAddr::new(*next as u64);
            *next += PAGE_SIZE;
            Some(addr)
        }
    }

    impl Drop for FakePhys {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.size, PAGE_SIZE).unwrap();
            // SAFETY: Same layout as the allocation.
            unsafe { std::alloc::dealloc(self.base, layout) };
        }
    }

    #[test]
    fn user_pagemap_aliases_kernel_upper_half() {
        let phys = FakePhys::new(64);
        let mapper = PageTableMapper::new(phys.hhdm());
        let kernel_root = phys.alloc_frame().unwrap();

        // Give the kernel pagemap one upper-half mapping.
        let kvirt = VirtAddr::new_truncate(0xFFFF_8000_0000_0000);
        // SAFETY: All tables live in the fake buffer.
        unsafe {
            mapper.map_4k(
                kernel_root,
                kvirt,
                PhysAddr::new(0x5000),
                MapFlags::WRITE.to_native_4k(),
                &mut || phys.alloc_frame(),
            );

            let user = Pagemap::new_user(kernel_root, &mapper, &mut || phys.alloc_frame())
                .unwrap();
            // Kernel mapping visible through the user pagemap.
            assert_eq!(
                mapper.translate_addr(user.root(), kvirt),
                Some(PhysAddr::new(0x5000))
            );
            // Lower half starts empty.
            assert!(
                mapper
                    .translate_addr(user.root(), VirtAddr::new(0x40_0000))
                    .is_none()
            );
        }
    }

    #[test]
    fn destroy_user_frees_only_lower_tables() {
        let phys = FakePhys::new(64);
        let mapper = PageTableMapper::new(phys.hhdm());
        let kernel_root = phys.alloc_frame().unwrap();

        // SAFETY: All tables live in the fake buffer.
        unsafe {
            // One upper-half kernel mapping shared into the user map.
            mapper.map_4k(
                kernel_root,
                VirtAddr::new_truncate(0xFFFF_8000_0000_0000),
                PhysAddr::new(0x5000),
                MapFlags::WRITE.to_native_4k(),
                &mut || phys.alloc_frame(),
            );
            let kernel_tables = *phys.next.borrow() / PAGE_SIZE;

            let user = Pagemap::new_user(kernel_root, &mapper, &mut || phys.alloc_frame())
                .unwrap();
            // One user mapping forces a PDPT+PD+PT chain.
            mapper.map_4k(
                user.root(),
                VirtAddr::new(0x40_0000),
                PhysAddr::new(0x6000),
                (MapFlags::WRITE | MapFlags::USER).to_native_4k(),
                &mut || phys.alloc_frame(),
            );
            let user_tables = *phys.next.borrow() / PAGE_SIZE - kernel_tables;

            user.destroy_user(&mapper, &mut |f| phys.freed.borrow_mut().push(f));

            // Every user-owned table frame (root + PDPT + PD + PT) came back;
            // kernel tables were untouched.
            assert_eq!(phys.freed.borrow().len(), user_tables);
            assert_eq!(
                mapper.translate_addr(kernel_root, VirtAddr::new_truncate(0xFFFF_8000_0000_0000)),
                Some(PhysAddr::new(0x5000))
            );
        }
    }
}
