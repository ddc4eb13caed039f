//! Kernel heap: per-size slab caches plus a large direct-page path.
//!
//! Sizes up to 2048 bytes come from slabs; a slab is a single 4 KiB page
//! beginning with a header, followed by objects of one size class. Larger
//! allocations take whole pages with a large-allocation header. Both paths
//! sit on a backing allocator that bridges the heap's kernel-virtual window
//! to PMM frames and recycles freed virtual ranges as exact-fit holes.

use core::ptr;

use delta_core::addr::{PAGE_SIZE, VirtAddr};
use delta_core::sync::SpinLock;

use crate::mm::pages_for;

/// Number of slab size classes.
const BUCKET_COUNT: usize = 8;

/// Slab size classes in bytes.
const BUCKET_SIZES: [usize; BUCKET_COUNT] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Minimum alignment of any heap pointer.
const MIN_ALIGN: usize = 16;

/// Magic at the start of a slab page.
const SLAB_MAGIC: u32 = 0x534C_4142;

/// Magic at the start of a large allocation.
const LARGE_MAGIC: u32 = 0x4C52_4745;

/// Allocates `pages` contiguous, writable kernel pages.
pub type BackingAllocFn = fn(pages: usize) -> Option<*mut u8>;

/// Returns `pages` previously obtained from the paired alloc function.
pub type BackingFreeFn = fn(ptr: *mut u8, pages: usize);

/// Header at the start of every slab page.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    bucket: u32,
    total_objs: u32,
    free_objs: u32,
    free_list: *mut FreeObj,
    prev: *mut SlabHeader,
    next: *mut SlabHeader,
}

/// Free-list node stored inside each free object.
#[repr(C)]
struct FreeObj {
    next: *mut FreeObj,
}

/// Header at the start of a large allocation's first page.
#[repr(C)]
struct LargeHeader {
    magic: u32,
    _pad: u32,
    pages: usize,
}

/// Offset of the first object in a slab page for a given object size.
fn slab_data_offset(obj_size: usize) -> usize {
    let align = obj_size.max(MIN_ALIGN);
    (size_of::<SlabHeader>() + align - 1) & !(align - 1)
}

/// One slab cache: three lists of slabs keyed by occupancy.
struct SlabCache {
    obj_size: usize,
    empty: *mut SlabHeader,
    partial: *mut SlabHeader,
    full: *mut SlabHeader,
}

// SAFETY: Raw slab pointers are only touched under the heap lock.
unsafe impl Send for SlabCache {}

impl SlabCache {
    const fn new(obj_size: usize) -> Self {
        Self {
            obj_size,
            empty: ptr::null_mut(),
            partial: ptr::null_mut(),
            full: ptr::null_mut(),
        }
    }
}

unsafe fn list_remove(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
    // SAFETY: Caller guarantees slab is a live member of the list at *head.
    unsafe {
        if !(*slab).prev.is_null() {
            (*(*slab).prev).next = (*slab).next;
        }
        if !(*slab).next.is_null() {
            (*(*slab).next).prev = (*slab).prev;
        }
        if *head == slab {
            *head = (*slab).next;
        }
        (*slab).prev = ptr::null_mut();
        (*slab).next = ptr::null_mut();
    }
}

unsafe fn list_prepend(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
    // SAFETY: Caller guarantees slab is detached and *head is a valid list.
    unsafe {
        (*slab).next = *head;
        (*slab).prev = ptr::null_mut();
        if !(*head).is_null() {
            (**head).prev = slab;
        }
        *head = slab;
    }
}

/// Heap occupancy counters for `KMEM_STATS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    /// Bytes handed out from slabs.
    pub slab_used: u64,
    /// Total bytes of object capacity across all slabs.
    pub slab_capacity: u64,
    /// Bytes handed out through the large path (page granularity).
    pub large_used: u64,
}

/// The kernel heap. All public methods are behind one coarse lock in the
/// global instance; allocations are short, contention is acceptable.
pub struct KernelHeap {
    caches: [SlabCache; BUCKET_COUNT],
    stats: HeapStats,
    backing_alloc: BackingAllocFn,
    backing_free: BackingFreeFn,
}

impl KernelHeap {
    /// Creates a heap over the given backing allocator.
    pub fn new(backing_alloc: BackingAllocFn, backing_free: BackingFreeFn) -> Self {
        Self {
            caches: core::array::from_fn(|i| SlabCache::new(BUCKET_SIZES[i])),
            stats: HeapStats::default(),
            backing_alloc,
            backing_free,
        }
    }

    /// Current occupancy counters.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Creates a fresh slab page for `bucket` and chains its free list.
    fn slab_create(&mut self, bucket: usize) -> Option<*mut SlabHeader> {
        let obj_size = self.caches[bucket].obj_size;
        let page = (self.backing_alloc)(1)?;

        let slab = page as *mut SlabHeader;
        let data_off = slab_data_offset(obj_size);
        let total = (PAGE_SIZE - data_off) / obj_size;

        // SAFETY: page is a fresh writable 4 KiB page owned by us.
        unsafe {
            (*slab).magic = SLAB_MAGIC;
            (*slab).bucket = bucket as u32;
            (*slab).total_objs = total as u32;
            (*slab).free_objs = total as u32;
            (*slab).prev = ptr::null_mut();
            (*slab).next = ptr::null_mut();

            // Chain every object into the free list.
            let first = page.add(data_off) as *mut FreeObj;
            (*slab).free_list = first;
            let mut obj = first;
            for _ in 0..total - 1 {
                let next = (obj as *mut u8).add(obj_size) as *mut FreeObj;
                (*obj).next = next;
                obj = next;
            }
            (*obj).next = ptr::null_mut();
        }

        self.stats.slab_capacity += (total * obj_size) as u64;
        Some(slab)
    }

    /// Destroys an empty slab, returning its page to the backing allocator.
    fn slab_destroy(&mut self, bucket: usize, slab: *mut SlabHeader) {
        // SAFETY: The slab is detached from all lists by the caller.
        unsafe {
            debug_assert_eq!((*slab).free_objs, (*slab).total_objs);
            let total = (*slab).total_objs as usize;
            self.stats.slab_capacity -= (total * self.caches[bucket].obj_size) as u64;
        }
        (self.backing_free)(slab as *mut u8, 1);
    }

    /// Allocates `size` bytes. Returns null on exhaustion or `size == 0`.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        if let Some(bucket) = BUCKET_SIZES.iter().position(|&b| size <= b) {
            return self.alloc_from_bucket(bucket);
        }

        // Large path: whole pages with a header up front.
        let total = (size + size_of::<LargeHeader>() + MIN_ALIGN - 1) & !(MIN_ALIGN - 1);
        let pages = pages_for(total);
        let Some(base) = (self.backing_alloc)(pages) else {
            return ptr::null_mut();
        };
        let header = base as *mut LargeHeader;
        // SAFETY: base is a fresh writable allocation of `pages` pages.
        unsafe {
            (*header).magic = LARGE_MAGIC;
            (*header)._pad = 0;
            (*header).pages = pages;
        }
        self.stats.large_used += (pages * PAGE_SIZE) as u64;
        let data = (base as usize + size_of::<LargeHeader>() + MIN_ALIGN - 1) & !(MIN_ALIGN - 1);
        data as *mut u8
    }

    fn alloc_from_bucket(&mut self, bucket: usize) -> *mut u8 {
        let obj_size = self.caches[bucket].obj_size;

        // Take a partial slab, else promote an empty one, else create one.
        let slab = if !self.caches[bucket].partial.is_null() {
            self.caches[bucket].partial
        } else {
            let slab = if !self.caches[bucket].empty.is_null() {
                let slab = self.caches[bucket].empty;
                // SAFETY: slab is the live head of the empty list.
                unsafe { list_remove(&mut self.caches[bucket].empty, slab) };
                slab
            } else {
                match self.slab_create(bucket) {
                    Some(slab) => slab,
                    None => return ptr::null_mut(),
                }
            };
            // SAFETY: slab is detached.
            unsafe { list_prepend(&mut self.caches[bucket].partial, slab) };
            slab
        };

        // SAFETY: slab is a valid slab page with a non-empty free list.
        unsafe {
            let obj = (*slab).free_list;
            debug_assert!(!obj.is_null());
            (*slab).free_list = (*obj).next;
            (*slab).free_objs -= 1;

            if (*slab).free_objs == 0 {
                list_remove(&mut self.caches[bucket].partial, slab);
                list_prepend(&mut self.caches[bucket].full, slab);
            }

            self.stats.slab_used += obj_size as u64;
            obj as *mut u8
        }
    }

    /// Frees a pointer returned by [`alloc`](Self::alloc).
    ///
    /// The block kind is identified by the magic at its page boundary.
    ///
    /// # Panics
    ///
    /// Panics on a pointer whose enclosing page carries neither magic;
    /// that is heap corruption or a foreign pointer.
    pub fn free(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }

        let page = (p as usize & !(PAGE_SIZE - 1)) as *mut u8;
        // SAFETY: Heap pointers always lie in a page that starts with one of
        // our headers; the magic discriminates which.
        let magic = unsafe { *(page as *const u32) };

        match magic {
            SLAB_MAGIC => self.free_slab_obj(page as *mut SlabHeader, p),
            LARGE_MAGIC => {
                let header = page as *mut LargeHeader;
                // SAFETY: magic identified a live large header.
                let pages = unsafe { (*header).pages };
                self.stats.large_used -= (pages * PAGE_SIZE) as u64;
                (self.backing_free)(page, pages);
            }
            other => panic!("heap: free of invalid pointer {p:p} (magic {other:#x})"),
        }
    }

    fn free_slab_obj(&mut self, slab: *mut SlabHeader, p: *mut u8) {
        // SAFETY: The page magic identified a live slab; the object belongs
        // to it and is no longer referenced by the caller.
        unsafe {
            let bucket = (*slab).bucket as usize;
            let obj = p as *mut FreeObj;
            (*obj).next = (*slab).free_list;
            (*slab).free_list = obj;
            // A slab with no free objects sits on the full list; anywhere
            // else it is on the partial list.
            let was_full = (*slab).free_objs == 0;
            (*slab).free_objs += 1;
            self.stats.slab_used -= self.caches[bucket].obj_size as u64;

            if (*slab).free_objs == (*slab).total_objs {
                // Fully free. Keep one empty slab per cache to avoid
                // thrashing; destroy beyond that when other slabs exist.
                if was_full {
                    list_remove(&mut self.caches[bucket].full, slab);
                } else {
                    list_remove(&mut self.caches[bucket].partial, slab);
                }

                let have_other = !self.caches[bucket].partial.is_null()
                    || !self.caches[bucket].empty.is_null()
                    || !self.caches[bucket].full.is_null();
                if have_other {
                    self.slab_destroy(bucket, slab);
                } else {
                    list_prepend(&mut self.caches[bucket].empty, slab);
                }
            } else if was_full {
                list_remove(&mut self.caches[bucket].full, slab);
                list_prepend(&mut self.caches[bucket].partial, slab);
            }
        }
    }

    /// Resizes an allocation, preserving the pointer when the current block
    /// already fits.
    pub fn realloc(&mut self, p: *mut u8, size: usize) -> *mut u8 {
        if p.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            self.free(p);
            return ptr::null_mut();
        }

        let page = (p as usize & !(PAGE_SIZE - 1)) as *mut u8;
        // SAFETY: As in `free`.
        let magic = unsafe { *(page as *const u32) };
        let old_size = match magic {
            // SAFETY: magic identified the header type.
            SLAB_MAGIC => unsafe {
                self.caches[(*(page as *const SlabHeader)).bucket as usize].obj_size
            },
            LARGE_MAGIC => unsafe {
                (*(page as *const LargeHeader)).pages * PAGE_SIZE - size_of::<LargeHeader>()
            },
            other => panic!("heap: realloc of invalid pointer {p:p} (magic {other:#x})"),
        };

        if size <= old_size {
            return p;
        }

        let new_p = self.alloc(size);
        if new_p.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: Both blocks are live and at least old_size bytes.
        unsafe {
            ptr::copy_nonoverlapping(p, new_p, old_size);
        }
        self.free(p);
        new_p
    }

    /// Allocates raw pages directly from the backing allocator (VMO backing
    /// and other page-granular users). Not zeroed.
    pub fn alloc_pages(&mut self, pages: usize) -> Option<*mut u8> {
        (self.backing_alloc)(pages)
    }

    /// Returns raw pages obtained from [`alloc_pages`](Self::alloc_pages).
    pub fn free_pages(&mut self, ptr: *mut u8, pages: usize) {
        (self.backing_free)(ptr, pages);
    }
}

// ---------------------------------------------------------------------------
// Backing allocator: kernel-virtual cursor + exact-fit hole reuse
// ---------------------------------------------------------------------------

/// Capacity of the virtual-hole table.
const VHOLE_COUNT: usize = 256;

/// A freed virtual range available for reuse.
#[derive(Debug, Clone, Copy)]
struct VHole {
    addr: VirtAddr,
    pages: usize,
}

/// Tracks the heap's virtual window: a bump cursor plus freed holes.
///
/// Pure address bookkeeping; the target glue attaches physical frames via
/// the VMM around it.
pub struct VirtWindow {
    cursor: VirtAddr,
    end: VirtAddr,
    holes: [Option<VHole>; VHOLE_COUNT],
}

impl VirtWindow {
    /// Creates a window spanning `[start, end)`.
    pub const fn new(start: VirtAddr, end: VirtAddr) -> Self {
        Self {
            cursor: start,
            end,
            holes: [None; VHOLE_COUNT],
        }
    }

    /// Takes an exact-fit hole, or bumps the cursor. Returns `None` when the
    /// window is exhausted.
    pub fn take(&mut self, pages: usize) -> Option<VirtAddr> {
        // Exact-fit first, to keep the address space from bloating.
        for slot in self.holes.iter_mut() {
            if let Some(hole) = *slot {
                if hole.pages == pages {
                    *slot = None;
                    return Some(hole.addr);
                }
            }
        }

        let bytes = (pages * PAGE_SIZE) as u64;
        if self.cursor.as_u64() + bytes > self.end.as_u64() {
            return None;
        }
        let addr = self.cursor;
        self.cursor = self.cursor + bytes;
        Some(addr)
    }

    /// Records a freed range for reuse. A full table leaks the range (the
    /// physical frames behind it were already returned).
    pub fn record(&mut self, addr: VirtAddr, pages: usize) -> bool {
        for slot in self.holes.iter_mut() {
            if slot.is_none() {
                *slot = Some(VHole { addr, pages });
                return true;
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Global heap
// ---------------------------------------------------------------------------

/// Global kernel heap.
static HEAP: SpinLock<Option<KernelHeap>> = SpinLock::new(None);

/// Installs the global heap over the given backing allocator.
///
/// # Panics
///
/// Panics on double initialization.
pub fn init(backing_alloc: BackingAllocFn, backing_free: BackingFreeFn) {
    let mut heap = HEAP.lock();
    assert!(heap.is_none(), "heap already initialized");
    *heap = Some(KernelHeap::new(backing_alloc, backing_free));
}

/// Executes a closure with the global heap.
///
/// # Panics
///
/// Panics if the heap has not been initialized.
pub fn with_heap<R>(f: impl FnOnce(&mut KernelHeap) -> R) -> R {
    let mut heap = HEAP.lock();
    f(heap.as_mut().expect("heap not initialized"))
}

/// Allocates `pages` raw kernel pages for page-granular users (VMO backing).
pub fn alloc_pages(pages: usize) -> Option<*mut u8> {
    with_heap(|h| h.alloc_pages(pages))
}

/// Frees raw pages from [`alloc_pages`].
pub fn free_pages(ptr: *mut u8, pages: usize) {
    with_heap(|h| h.free_pages(ptr, pages));
}

/// Current heap occupancy counters.
pub fn stats() -> HeapStats {
    with_heap(|h| h.stats())
}

// ---------------------------------------------------------------------------
// Target backing: VirtWindow + VMM + PMM, and the global allocator
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod target {
    use super::*;
    use crate::mm::mapper::MapFlags;
    use crate::mm::{pmm, vmm};

    /// The heap's virtual window over `KHEAP_VIRT_START..KHEAP_VIRT_END`.
    static WINDOW: SpinLock<VirtWindow> = SpinLock::new(VirtWindow::new(
        VirtAddr::new_truncate(vmm::KHEAP_VIRT_START),
        VirtAddr::new_truncate(vmm::KHEAP_VIRT_END),
    ));

    /// Backing alloc: reserve virtual space, attach PMM frames, map writable.
    pub(super) fn backing_alloc(pages: usize) -> Option<*mut u8> {
        let virt = WINDOW.lock().take(pages)?;
        let phys = match pmm::alloc(pages) {
            Some(phys) => phys,
            None => {
                WINDOW.lock().record(virt, pages);
                return None;
            }
        };
        let ok = vmm::with_vmm(|vmm| {
            // SAFETY: The range was just reserved from the heap window and
            // the frames are fresh.
            unsafe { vmm.kernel_map(virt, phys, pages, MapFlags::WRITE | MapFlags::GLOBAL) }
        });
        if !ok {
            pmm::free(phys, pages);
            WINDOW.lock().record(virt, pages);
            return None;
        }
        Some(virt.as_mut_ptr())
    }

    /// Backing free: return each frame, unmap the range, record the hole.
    pub(super) fn backing_free(ptr: *mut u8, pages: usize) {
        let virt = VirtAddr::new_truncate(ptr as u64);
        vmm::with_vmm(|vmm| {
            // Frames may be discontiguous after hole reuse; resolve and free
            // them one page at a time.
            for i in 0..pages {
                let v = virt + (i * PAGE_SIZE) as u64;
                if let Some(phys) = vmm.virt_to_phys(v) {
                    pmm::free(phys.align_down(PAGE_SIZE as u64), 1);
                }
            }
            // SAFETY: The range belongs to the heap window and is no longer
            // referenced.
            unsafe { vmm.kernel_unmap(virt, pages) };
        });
        if !WINDOW.lock().record(virt, pages) {
            delta_core::kwarn!("heap: vhole table full, leaking {} pages at {}", pages, virt);
        }
    }

    /// Initializes the global heap over the VMM/PMM backing.
    pub fn init_kernel_heap() {
        super::init(backing_alloc, backing_free);
    }

    /// `#[global_allocator]` adapter over the kernel heap.
    ///
    /// Alignments above the largest slab class are not supported; the slab
    /// classes are powers of two, so rounding the size up to the alignment
    /// guarantees the placement.
    struct HeapAllocator;

    // SAFETY: alloc/dealloc delegate to the locked kernel heap, which hands
    // out unique, properly sized blocks.
    unsafe impl core::alloc::GlobalAlloc for HeapAllocator {
        unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
            if layout.align() > 2048 {
                return core::ptr::null_mut();
            }
            let size = layout.size().max(layout.align());
            super::with_heap(|h| h.alloc(size))
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
            super::with_heap(|h| h.free(ptr));
        }
    }

    #[global_allocator]
    static GLOBAL_HEAP: HeapAllocator = HeapAllocator;
}

#[cfg(target_os = "none")]
pub use target::init_kernel_heap;

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Page-granular std backing with an outstanding-pages counter so tests
    /// can observe slabs being returned.
    static OUTSTANDING_PAGES: AtomicUsize = AtomicUsize::new(0);

    fn std_backing_alloc(pages: usize) -> Option<*mut u8> {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        OUTSTANDING_PAGES.fetch_add(pages, Ordering::Relaxed);
        Some(ptr)
    }

    fn std_backing_free(ptr: *mut u8, pages: usize) {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: ptr came from std_backing_alloc with the same layout.
        unsafe { std::alloc::dealloc(ptr, layout) };
        OUTSTANDING_PAGES.fetch_sub(pages, Ordering::Relaxed);
    }

    fn heap() -> KernelHeap {
        KernelHeap::new(std_backing_alloc, std_backing_free)
    }

    #[test]
    fn small_sizes_round_to_buckets() {
        let mut h = heap();
        let a = h.alloc(1);
        let b = h.alloc(16);
        assert!(!a.is_null() && !b.is_null());
        // Both came from the 16-byte bucket of the same slab page.
        assert_eq!(
            a as usize & !(PAGE_SIZE - 1),
            b as usize & !(PAGE_SIZE - 1)
        );
        assert_eq!(b as usize - a as usize, 16);
        h.free(a);
        h.free(b);
    }

    #[test]
    fn objects_are_aligned_to_their_class() {
        let mut h = heap();
        for &size in &BUCKET_SIZES {
            let p = h.alloc(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % size.max(MIN_ALIGN), 0, "class {size}");
            h.free(p);
        }
    }

    #[test]
    fn freed_objects_are_reused() {
        let mut h = heap();
        let a = h.alloc(64);
        h.free(a);
        let b = h.alloc(64);
        assert_eq!(a, b);
        h.free(b);
    }

    #[test]
    fn large_allocations_take_whole_pages() {
        let mut h = heap();
        let p = h.alloc(3 * PAGE_SIZE);
        assert!(!p.is_null());
        assert_eq!(h.stats().large_used, 4 * PAGE_SIZE as u64);
        // SAFETY: p points at a writable region of the requested size.
        unsafe {
            core::ptr::write_bytes(p, 0xAB, 3 * PAGE_SIZE);
        }
        h.free(p);
        assert_eq!(h.stats().large_used, 0);
    }

    #[test]
    fn slab_returns_page_when_cache_has_other_slabs() {
        let mut h = heap();
        let before = OUTSTANDING_PAGES.load(Ordering::Relaxed);

        // The 2048-byte class fits one object per slab page, so two
        // allocations occupy two slabs.
        let a = h.alloc(2048);
        let b = h.alloc(2048);
        assert_eq!(OUTSTANDING_PAGES.load(Ordering::Relaxed), before + 2);

        // Freeing one slab while another exists destroys the empty one.
        h.free(a);
        assert_eq!(OUTSTANDING_PAGES.load(Ordering::Relaxed), before + 1);

        // The last slab is retained as the cache's single empty slab.
        h.free(b);
        assert_eq!(OUTSTANDING_PAGES.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn stats_track_usage() {
        let mut h = heap();
        assert_eq!(h.stats().slab_used, 0);
        let p = h.alloc(100); // 128-byte class
        assert_eq!(h.stats().slab_used, 128);
        assert!(h.stats().slab_capacity >= 128);
        h.free(p);
        assert_eq!(h.stats().slab_used, 0);
    }

    #[test]
    fn realloc_preserves_pointer_when_it_fits() {
        let mut h = heap();
        let p = h.alloc(100); // 128-byte class
        assert_eq!(h.realloc(p, 120), p);

        // Growing copies the data to a new block.
        // SAFETY: p is live and at least 4 bytes.
        unsafe { ptr::copy_nonoverlapping(b"abcd".as_ptr(), p, 4) };
        let q = h.realloc(p, 4096 * 2);
        assert_ne!(q, p);
        // SAFETY: q is live and holds the copied prefix.
        unsafe {
            assert_eq!(core::slice::from_raw_parts(q, 4), b"abcd");
        }
        h.free(q);
    }

    #[test]
    fn virt_window_prefers_exact_holes() {
        let mut w = VirtWindow::new(
            VirtAddr::new_truncate(0xFFFF_9000_0000_0000),
            VirtAddr::new_truncate(0xFFFF_9000_0010_0000),
        );
        let a = w.take(4).unwrap();
        let b = w.take(2).unwrap();
        assert_eq!(b.as_u64() - a.as_u64(), 4 * PAGE_SIZE as u64);

        assert!(w.record(a, 4));
        // A 3-page request does not fit the 4-page hole; the cursor bumps.
        let c = w.take(3).unwrap();
        assert!(c > b);
        // A 4-page request reuses the hole exactly.
        assert_eq!(w.take(4), Some(a));
    }

    #[test]
    fn virt_window_exhausts_cleanly() {
        let mut w = VirtWindow::new(
            VirtAddr::new_truncate(0xFFFF_9000_0000_0000),
            VirtAddr::new_truncate(0xFFFF_9000_0000_2000),
        );
        assert!(w.take(2).is_some());
        assert!(w.take(1).is_none());
    }
}
