//! Bitmap-based physical frame allocator.
//!
//! One bit per 4 KiB frame, 1 = used. The bitmap itself lives in a usable
//! region of physical memory and is accessed through the HHDM. Allocation
//! scans from a rotating cursor with an O(1) skip over all-ones words and
//! wraps to the start once before giving up; freeing lowers the cursor.

use delta_core::addr::{PAGE_SIZE, PhysAddr};
use delta_core::sync::SpinLock;

const BITS_PER_WORD: usize = 64;

/// A physical memory range fed to [`FrameBitmap::new`].
#[derive(Debug, Clone, Copy)]
pub struct PhysRegion {
    /// Physical start address.
    pub base: PhysAddr,
    /// Length in bytes.
    pub length: u64,
    /// Whether the range is normal usable RAM.
    pub usable: bool,
}

/// The frame bitmap and its allocation cursor.
pub struct FrameBitmap {
    /// Bitmap words in HHDM-mapped memory. Bit = 1 means used.
    words: &'static mut [u64],
    /// Number of frames tracked.
    max_frames: usize,
    /// Number of currently free frames.
    free_frames: usize,
    /// Frame index to resume the next scan from.
    cursor: usize,
}

impl FrameBitmap {
    /// Builds the bitmap from the boot memory map.
    ///
    /// Marks everything used, clears usable ranges, then re-reserves the
    /// bitmap's own frames, every range in `reserved` (kernel image,
    /// boot-info blob, initrd), and frame 0.
    ///
    /// # Safety
    ///
    /// - `hhdm_offset` must map all of physical memory described by
    ///   `regions` (`virt = phys + hhdm_offset`).
    /// - The regions must accurately describe RAM; the chosen bitmap region
    ///   must not be in use by anything else.
    pub unsafe fn new(
        regions: &[PhysRegion],
        reserved: &[(PhysAddr, u64)],
        hhdm_offset: u64,
    ) -> Option<Self> {
        let max_addr = regions
            .iter()
            .filter(|r| r.usable)
            .map(|r| r.base.as_u64() + r.length)
            .max()?;

        let max_frames = (max_addr / PAGE_SIZE as u64) as usize;
        let word_count = max_frames.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = word_count * 8;

        // Place the bitmap in the first usable region that fits, preferring
        // regions at or above 1 MiB.
        let bitmap_phys = regions
            .iter()
            .filter(|r| r.usable && r.length >= bitmap_bytes as u64)
            .filter(|r| r.base.as_u64() >= 0x10_0000)
            .map(|r| r.base)
            .next()
            .or_else(|| {
                regions
                    .iter()
                    .filter(|r| {
                        r.usable && r.length >= bitmap_bytes as u64 && r.base.as_u64() > 0
                    })
                    .map(|r| r.base)
                    .next()
            })?;

        // SAFETY: The caller guarantees the HHDM covers bitmap_phys and the
        // region is unused; we are the sole writer during init.
        let words = unsafe {
            let ptr = (hhdm_offset + bitmap_phys.as_u64()) as *mut u64;
            core::slice::from_raw_parts_mut(ptr, word_count)
        };

        // All frames start reserved.
        words.fill(u64::MAX);

        let mut bitmap = Self {
            words,
            max_frames,
            free_frames: 0,
            cursor: 0,
        };

        // Clear usable ranges.
        for region in regions.iter().filter(|r| r.usable) {
            let start = region.base.frame_index() as usize;
            let count = (region.length / PAGE_SIZE as u64) as usize;
            for frame in start..start + count {
                if frame < max_frames && bitmap.test(frame) {
                    bitmap.clear(frame);
                    bitmap.free_frames += 1;
                }
            }
        }

        // Re-reserve the bitmap's own frames.
        bitmap.reserve_range(bitmap_phys, bitmap_bytes as u64);

        // Re-reserve kernel image, boot-info blob, initrd, ...
        for &(base, length) in reserved {
            bitmap.reserve_range(base, length);
        }

        // Frame 0 is never handed out.
        if max_frames > 0 && !bitmap.test(0) {
            bitmap.set(0);
            bitmap.free_frames -= 1;
        }

        Some(bitmap)
    }

    fn reserve_range(&mut self, base: PhysAddr, length: u64) {
        let start = base.frame_index() as usize;
        let count = (length as usize).div_ceil(PAGE_SIZE);
        for frame in start..start + count {
            if frame < self.max_frames && !self.test(frame) {
                self.set(frame);
                self.free_frames -= 1;
            }
        }
    }

    #[inline]
    fn test(&self, frame: usize) -> bool {
        self.words[frame / BITS_PER_WORD] & (1 << (frame % BITS_PER_WORD)) != 0
    }

    #[inline]
    fn set(&mut self, frame: usize) {
        self.words[frame / BITS_PER_WORD] |= 1 << (frame % BITS_PER_WORD);
    }

    #[inline]
    fn clear(&mut self, frame: usize) {
        self.words[frame / BITS_PER_WORD] &= !(1 << (frame % BITS_PER_WORD));
    }

    /// Scans `[start, limit)` for `count` consecutive free frames, skipping
    /// whole all-ones words. Returns the first frame of the run.
    fn scan(&self, start: usize, limit: usize, count: usize) -> Option<usize> {
        let mut run = 0usize;
        let mut run_start = 0usize;
        let mut frame = start;

        while frame < limit {
            // At a word boundary with no run in progress, skip fully
            // allocated words in one comparison each.
            if frame % BITS_PER_WORD == 0 && run == 0 {
                while frame + BITS_PER_WORD <= limit
                    && self.words[frame / BITS_PER_WORD] == u64::MAX
                {
                    frame += BITS_PER_WORD;
                }
                if frame >= limit {
                    break;
                }
            }

            if !self.test(frame) {
                if run == 0 {
                    run_start = frame;
                }
                run += 1;
                if run == count {
                    return Some(run_start);
                }
            } else {
                run = 0;
            }
            frame += 1;
        }
        None
    }

    /// Allocates `count` consecutive frames. Returns the base address, or
    /// `None` without any partial allocation.
    pub fn alloc(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 || self.free_frames < count {
            return None;
        }

        // Scan from the cursor, then wrap to the beginning once.
        let found = self
            .scan(self.cursor, self.max_frames, count)
            .or_else(|| self.scan(0, self.cursor, count))?;

        for frame in found..found + count {
            self.set(frame);
        }
        self.free_frames -= count;
        self.cursor = found + count;
        Some(PhysAddr::new((found * PAGE_SIZE) as u64))
    }

    /// Frees `count` frames starting at `base`.
    pub fn free(&mut self, base: PhysAddr, count: usize) {
        let start = base.frame_index() as usize;
        for frame in start..start + count {
            if frame < self.max_frames && self.test(frame) {
                self.clear(frame);
                self.free_frames += 1;
            }
        }
        if start < self.cursor {
            self.cursor = start;
        }
    }

    /// Number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Number of tracked frames.
    pub fn total_frames(&self) -> usize {
        self.max_frames
    }

    /// Counts set bits; used by tests to check the accounting invariant.
    pub fn used_frames(&self) -> usize {
        let full_words = self.max_frames / BITS_PER_WORD;
        let mut used: usize = self.words[..full_words]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum();
        for frame in full_words * BITS_PER_WORD..self.max_frames {
            if self.test(frame) {
                used += 1;
            }
        }
        used
    }
}

// ---------------------------------------------------------------------------
// Global PMM
// ---------------------------------------------------------------------------

/// Global physical memory manager.
static PMM: SpinLock<Option<FrameBitmap>> = SpinLock::new(None);

/// Installs the frame bitmap as the global PMM.
///
/// # Panics
///
/// Panics on double initialization.
pub fn init(bitmap: FrameBitmap) {
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(bitmap);
}

/// Executes a closure with the global PMM.
///
/// # Panics
///
/// Panics if the PMM has not been initialized.
pub fn with_pmm<R>(f: impl FnOnce(&mut FrameBitmap) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

/// Allocates `count` consecutive frames from the global PMM.
pub fn alloc(count: usize) -> Option<PhysAddr> {
    with_pmm(|pmm| pmm.alloc(count))
}

/// Frees `count` frames starting at `base` back to the global PMM.
pub fn free(base: PhysAddr, count: usize) {
    with_pmm(|pmm| pmm.free(base, count));
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    /// Fake physical memory: an aligned host buffer whose base address acts
    /// as the HHDM offset, so `phys 0` is the start of the buffer.
    struct FakePhys {
        base: *mut u8,
        size: usize,
    }

    impl FakePhys {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
            // SAFETY: layout has non-zero size.
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self { base, size }
        }

        fn hhdm(&self) -> u64 {
            self.base as u64
        }
    }

    impl Drop for FakePhys {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.size, PAGE_SIZE).unwrap();
            // SAFETY: Same layout as the allocation.
            unsafe { std::alloc::dealloc(self.base, layout) };
        }
    }

    /// 16 MiB of fake RAM with one usable region starting at 1 MiB.
    fn make_bitmap(phys: &FakePhys) -> FrameBitmap {
        let regions = [
            PhysRegion {
                base: PhysAddr::zero(),
                length: 0x10_0000,
                usable: false,
            },
            PhysRegion {
                base: PhysAddr::new(0x10_0000),
                length: (phys.size - 0x10_0000) as u64,
                usable: true,
            },
        ];
        // SAFETY: The fake buffer covers all described physical memory.
        unsafe { FrameBitmap::new(&regions, &[], phys.hhdm()).unwrap() }
    }

    #[test]
    fn init_reserves_bitmap_and_low_memory() {
        let phys = FakePhys::new(16 * 1024 * 1024);
        let bitmap = make_bitmap(&phys);

        // 15 MiB usable minus the bitmap's own page(s).
        let usable_frames = (16 * 1024 * 1024 - 0x10_0000) / PAGE_SIZE;
        let bitmap_pages = bitmap.total_frames().div_ceil(8).div_ceil(PAGE_SIZE);
        assert_eq!(bitmap.free_frames(), usable_frames - bitmap_pages);
        assert_eq!(bitmap.total_frames(), 16 * 1024 * 1024 / PAGE_SIZE);
    }

    #[test]
    fn alloc_returns_usable_frames() {
        let phys = FakePhys::new(16 * 1024 * 1024);
        let mut bitmap = make_bitmap(&phys);

        let frame = bitmap.alloc(1).unwrap();
        assert!(frame.as_u64() >= 0x10_0000);
        assert!(frame.is_aligned(PAGE_SIZE as u64));
    }

    #[test]
    fn contiguous_runs_are_contiguous() {
        let phys = FakePhys::new(16 * 1024 * 1024);
        let mut bitmap = make_bitmap(&phys);

        let a = bitmap.alloc(8).unwrap();
        let b = bitmap.alloc(8).unwrap();
        assert_eq!(b.as_u64() - a.as_u64(), 8 * PAGE_SIZE as u64);
    }

    #[test]
    fn accounting_invariant_over_random_ops() {
        let phys = FakePhys::new(16 * 1024 * 1024);
        let mut bitmap = make_bitmap(&phys);
        let baseline_used = bitmap.used_frames();

        let mut outstanding: Vec<(PhysAddr, usize)> = Vec::new();
        let mut seed = 0x1357_9BDFu64;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let count = (seed >> 33) as usize % 7 + 1;
            if seed & 1 == 0 || outstanding.is_empty() {
                if let Some(base) = bitmap.alloc(count) {
                    outstanding.push((base, count));
                }
            } else {
                let idx = (seed >> 17) as usize % outstanding.len();
                let (base, count) = outstanding.swap_remove(idx);
                bitmap.free(base, count);
            }

            let held: usize = outstanding.iter().map(|&(_, n)| n).sum();
            assert_eq!(bitmap.used_frames(), baseline_used + held);
            assert_eq!(
                bitmap.free_frames() + bitmap.used_frames(),
                bitmap.total_frames()
            );
        }
    }

    #[test]
    fn exhaustion_returns_none_without_partial_allocation() {
        let phys = FakePhys::new(2 * 1024 * 1024);
        let regions = [PhysRegion {
            base: PhysAddr::new(0x10_0000),
            length: (phys.size - 0x10_0000) as u64,
            usable: true,
        }];
        // SAFETY: The fake buffer covers the described region.
        let mut bitmap = unsafe { FrameBitmap::new(&regions, &[], phys.hhdm()).unwrap() };

        let free_before = bitmap.free_frames();
        assert!(bitmap.alloc(free_before + 1).is_none());
        assert_eq!(bitmap.free_frames(), free_before);

        // Drain completely, then one more must fail.
        while bitmap.alloc(1).is_some() {}
        assert_eq!(bitmap.free_frames(), 0);
        assert!(bitmap.alloc(1).is_none());
    }

    #[test]
    fn free_lowers_cursor_for_reuse() {
        let phys = FakePhys::new(16 * 1024 * 1024);
        let mut bitmap = make_bitmap(&phys);

        let first = bitmap.alloc(4).unwrap();
        let _second = bitmap.alloc(4).unwrap();
        bitmap.free(first, 4);
        // The freed run is found again even though the cursor moved past it.
        let third = bitmap.alloc(4).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn boot_ping_64mib_map() {
        // 64 MiB of fake RAM, one usable region [0x100000, 0x4000000).
        let phys = FakePhys::new(64 * 1024 * 1024);
        let regions = [PhysRegion {
            base: PhysAddr::new(0x10_0000),
            length: 0x400_0000 - 0x10_0000,
            usable: true,
        }];
        // Reserve a 2 MiB kernel image at 1 MiB, like the boot path does.
        let reserved = [(PhysAddr::new(0x10_0000), 0x20_0000u64)];
        // SAFETY: The fake buffer covers the described region.
        let bitmap = unsafe { FrameBitmap::new(&regions, &reserved, phys.hhdm()).unwrap() };

        // 63 MiB usable minus 2 MiB kernel minus the bitmap pages.
        let expect = (0x400_0000 - 0x10_0000) / PAGE_SIZE - 512 - 2;
        let got = bitmap.free_frames();
        assert!(
            got.abs_diff(expect) <= 2,
            "free frames {got} not within 2 of {expect}"
        );
    }
}
