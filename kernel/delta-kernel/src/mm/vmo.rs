//! Virtual memory objects: kernel-managed contiguous memory mappable into
//! one or more processes.
//!
//! Backing pages come from the heap's raw-page allocator and stay at one
//! kernel virtual address for the object's life — except across a resize,
//! which swaps the entire backing and re-maps every mapper. The VMO's
//! internal lock is held across that walk, serializing resize against any
//! other resize or mapping of the same object.

use alloc::sync::Arc;
use core::any::Any;

use delta_core::addr::{PAGE_SIZE, VirtAddr};
use delta_core::sync::IrqSpinLock;
use delta_syscall::{Error, Rights, Stat, VMO_FLAG_RESIZABLE};

use crate::mm::mapper::MapFlags;
use crate::mm::{heap, pages_for};
use crate::obj::{KernelObject, ObjectRef, ObjectType};
use crate::proc::Process;

struct VmoState {
    /// Backing pages in kernel virtual space.
    pages: *mut u8,
    /// Logical size in bytes.
    size: usize,
    /// Committed bytes (the whole object; there is no lazy commit).
    committed: usize,
}

// SAFETY: The raw backing pointer is only dereferenced under the state
// lock, and the referenced pages are exclusively owned by this VMO.
unsafe impl Send for VmoState {}

/// A virtual memory object.
pub struct Vmo {
    flags: u32,
    state: IrqSpinLock<VmoState>,
}

impl Vmo {
    /// Allocates a zero-filled VMO of `size` bytes.
    pub fn new(size: usize, flags: u32) -> Result<Arc<Self>, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let page_count = pages_for(size);
        let pages = heap::alloc_pages(page_count).ok_or(Error::ResourceExhausted)?;
        // SAFETY: The raw-page allocator does not zero; the pages are fresh
        // and exclusively ours.
        unsafe {
            core::ptr::write_bytes(pages, 0, page_count * PAGE_SIZE);
        }
        Ok(Arc::new(Self {
            flags,
            state: IrqSpinLock::new(VmoState {
                pages,
                size,
                committed: size,
            }),
        }))
    }

    /// Logical size in bytes.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Whether the VMO may be resized.
    pub fn resizable(&self) -> bool {
        self.flags & VMO_FLAG_RESIZABLE != 0
    }
}

impl Drop for Vmo {
    fn drop(&mut self) {
        let state = self.state.lock();
        if !state.pages.is_null() {
            heap::free_pages(state.pages, pages_for(state.committed));
        }
    }
}

impl KernelObject for Vmo {
    fn obj_type(&self) -> ObjectType {
        ObjectType::Vmo
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let state = self.state.lock();
        let offset = offset as usize;
        if offset >= state.size {
            return Ok(0);
        }
        let n = buf.len().min(state.size - offset);
        // SAFETY: The backing covers [0, size) and the lock is held.
        unsafe {
            core::ptr::copy_nonoverlapping(state.pages.add(offset), buf.as_mut_ptr(), n);
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize, Error> {
        let state = self.state.lock();
        let offset = offset as usize;
        if offset >= state.size {
            return Ok(0);
        }
        let n = buf.len().min(state.size - offset);
        // SAFETY: As in read; the pages are writable kernel memory.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), state.pages.add(offset), n);
        }
        Ok(n)
    }

    fn stat(&self) -> Result<Stat, Error> {
        Ok(Stat {
            obj_type: ObjectType::Vmo as u32,
            _pad: 0,
            size: self.size() as u64,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Handle-level operations
// ---------------------------------------------------------------------------

/// Creates a VMO and grants a handle with `rights` to `process`.
pub fn create(
    process: &Arc<Process>,
    size: usize,
    flags: u32,
    rights: Rights,
) -> Result<i32, Error> {
    let vmo = Vmo::new(size, flags)?;
    process.with_handles(|table| table.grant(vmo, rights))
}

/// Resolves `handle` and runs `f` with the object reference and its
/// concrete VMO view.
fn with_vmo<R>(
    process: &Arc<Process>,
    handle: i32,
    f: impl FnOnce(&ObjectRef, &Vmo) -> Result<R, Error>,
) -> Result<R, Error> {
    let obj = process.with_handles(|t| t.object(handle))?;
    let vmo = obj
        .as_any()
        .downcast_ref::<Vmo>()
        .ok_or(Error::InvalidArgument)?;
    f(&obj, vmo)
}

/// Reads from the VMO behind `handle`; requires `READ`.
pub fn read(
    process: &Arc<Process>,
    handle: i32,
    buf: &mut [u8],
    offset: u64,
) -> Result<usize, Error> {
    process.with_handles(|t| t.check_rights(handle, Rights::READ))?;
    with_vmo(process, handle, |_, vmo| vmo.read(buf, offset))
}

/// Writes to the VMO behind `handle`; requires `WRITE`.
pub fn write(
    process: &Arc<Process>,
    handle: i32,
    buf: &[u8],
    offset: u64,
) -> Result<usize, Error> {
    process.with_handles(|t| t.check_rights(handle, Rights::WRITE))?;
    with_vmo(process, handle, |_, vmo| vmo.write(buf, offset))
}

/// Converts requested map rights to page flags. No-execute is the default.
fn map_rights_to_flags(map_rights: Rights) -> MapFlags {
    let mut flags = MapFlags::USER;
    if map_rights.contains(Rights::WRITE) {
        flags |= MapFlags::WRITE;
    }
    if map_rights.contains(Rights::EXECUTE) {
        flags |= MapFlags::EXECUTE;
    }
    flags
}

/// Maps the VMO behind `handle` into `process`.
///
/// Requires `MAP` on the handle, and `map_rights` must be a subset of the
/// handle's rights. The kernel process receives a direct kernel pointer;
/// user processes get page mappings recorded as a VMA at `vaddr_hint` or at
/// a VMA-allocated run.
pub fn map(
    process: &Arc<Process>,
    handle: i32,
    vaddr_hint: Option<VirtAddr>,
    offset: usize,
    len: usize,
    map_rights: Rights,
) -> Result<VirtAddr, Error> {
    let entry_rights = process.with_handles(|t| {
        t.check_rights(handle, Rights::MAP)?;
        Ok::<_, Error>(t.get(handle)?.rights)
    })?;
    if !entry_rights.contains(map_rights) {
        return Err(Error::PermissionDenied);
    }

    with_vmo(process, handle, |obj, vmo| {
        // Hold the VMO lock so a concurrent resize cannot swap the backing
        // between the address computation and the mapping installation.
        let state = vmo.state.lock();
        if offset >= state.size {
            return Err(Error::InvalidArgument);
        }
        let len = if len == 0 { state.size - offset } else { len };
        if offset + len > state.size {
            return Err(Error::InvalidArgument);
        }

        // The kernel process maps nothing: the backing is already kernel
        // memory.
        if !process.is_user() {
            return Ok(VirtAddr::new_truncate(state.pages as u64 + offset as u64));
        }

        let flags = map_rights_to_flags(map_rights);
        let vaddr = match vaddr_hint {
            Some(hint) => {
                process.with_vmas(|vmas| {
                    vmas.add(hint, len as u64, flags, Some(obj.clone()), offset as u64)
                })?;
                hint
            }
            None => process.with_vmas(|vmas| {
                vmas.alloc(len as u64, flags, Some(obj.clone()), offset as u64)
            })?,
        };

        #[cfg(target_os = "none")]
        {
            let backing_virt = VirtAddr::new_truncate(state.pages as u64 + offset as u64);
            // The heap window lies outside the direct map, so the physical
            // base is resolved through the kernel pagemap walk.
            let phys = crate::mm::vmm::with_vmm(|vmm| vmm.virt_to_phys(backing_virt))
                .ok_or(Error::BadState)?;
            let root = process.pagemap_root().ok_or(Error::BadState)?;
            let ok = crate::mm::vmm::with_vmm(|vmm| {
                // SAFETY: The VMA reservation guarantees the range is unused
                // in this pagemap; the physical run backs the VMO under its
                // lock.
                unsafe { vmm.map_range(root, vaddr, phys, pages_for(len), flags) }
            });
            if !ok {
                let _ = process.with_vmas(|vmas| vmas.remove(vaddr));
                return Err(Error::ResourceExhausted);
            }
        }

        drop(state);
        Ok(vaddr)
    })
}

/// Unmaps a previously mapped range and removes its VMA.
pub fn unmap(process: &Arc<Process>, vaddr: VirtAddr, len: usize) -> Result<(), Error> {
    let _ = len;
    let vma = process.with_vmas(|vmas| vmas.remove(vaddr))?;

    #[cfg(target_os = "none")]
    if let Some(root) = process.pagemap_root() {
        crate::mm::vmm::with_vmm(|vmm| {
            // SAFETY: The VMA owned this range; nothing else maps it.
            unsafe { vmm.unmap_range(root, vma.start, pages_for(vma.length as usize)) };
        });
    }

    drop(vma);
    Ok(())
}

// ---------------------------------------------------------------------------
// Resize
// ---------------------------------------------------------------------------

/// How one VMA must change across a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RemapPlan {
    /// Pages to unmap at the old location.
    unmap_pages: usize,
    /// New VMA length (grown when the VMA covered the former end and no
    /// neighbour collides).
    new_length: u64,
    /// Pages to map against the new backing (0 when the VMA now lies
    /// entirely past the end).
    map_pages: usize,
}

/// Computes the remap of a single VMA when its backing VMO changes size.
fn plan_remap(
    vma_length: u64,
    obj_offset: u64,
    old_size: u64,
    new_size: u64,
    growth_collides: bool,
) -> RemapPlan {
    let unmap_pages = pages_for(vma_length as usize);

    let mut new_length = vma_length;
    if new_size > old_size && obj_offset + vma_length == old_size && !growth_collides {
        new_length += new_size - old_size;
    }

    let map_pages = if obj_offset < new_size {
        let remaining = new_size - obj_offset;
        pages_for(new_length.min(remaining) as usize)
    } else {
        0
    };

    RemapPlan {
        unmap_pages,
        new_length,
        map_pages,
    }
}

/// Resizes the VMO behind `handle`.
///
/// Requires the `RESIZABLE` flag and `WRITE`. Allocates a fresh backing,
/// copies `min(old, new)` bytes, zeroes the tail, then — in one critical
/// section under the VMO lock — re-maps every process whose VMAs reference
/// this object and swaps the backing.
pub fn resize(process: &Arc<Process>, handle: i32, new_size: usize) -> Result<(), Error> {
    if new_size == 0 {
        return Err(Error::InvalidArgument);
    }
    process.with_handles(|t| t.check_rights(handle, Rights::WRITE))?;

    with_vmo(process, handle, |obj, vmo| {
        if !vmo.resizable() {
            return Err(Error::PermissionDenied);
        }

        // The lock is held until every mapper has been re-pointed;
        // concurrent maps and resizes of this VMO serialize here.
        let mut state = vmo.state.lock();
        let old_size = state.size;
        if new_size == old_size {
            return Ok(());
        }

        let old_pages = pages_for(old_size);
        let new_pages = pages_for(new_size);
        if new_pages == old_pages {
            state.size = new_size;
            state.committed = new_size;
            return Ok(());
        }

        let new_backing = heap::alloc_pages(new_pages).ok_or(Error::ResourceExhausted)?;
        let copy = old_size.min(new_size);
        // SAFETY: Both backings are live; the new one is exclusively ours.
        unsafe {
            core::ptr::copy_nonoverlapping(state.pages, new_backing, copy);
            core::ptr::write_bytes(new_backing.add(copy), 0, new_pages * PAGE_SIZE - copy);
        }

        let old_backing = state.pages;
        state.pages = new_backing;
        state.size = new_size;
        state.committed = new_size;

        // Re-point every mapping of this object while the lock is held.
        remap_all_mappers(obj, new_backing, old_size as u64, new_size as u64);

        drop(state);
        heap::free_pages(old_backing, old_pages);
        Ok(())
    })
}

/// Walks every process's VMA list and re-maps areas backed by `obj` onto
/// `new_backing`. Runs with the VMO lock held.
fn remap_all_mappers(obj: &ObjectRef, new_backing: *mut u8, old_size: u64, new_size: u64) {
    #[cfg(not(target_os = "none"))]
    let _ = new_backing;

    crate::proc::for_each(|process| {
        process.with_vmas(|vmas| {
            // Growth-collision checks need the whole list, so decide first.
            let collisions: alloc::vec::Vec<(VirtAddr, bool)> = vmas
                .iter()
                .filter(|v| v.backing.as_ref().is_some_and(|b| Arc::ptr_eq(b, obj)))
                .map(|v| {
                    let grown_end = v.start.as_u64()
                        + v.length
                        + new_size.saturating_sub(old_size);
                    (v.start, vmas.growth_collides(v.start, grown_end))
                })
                .collect();

            #[cfg(target_os = "none")]
            let root = process.pagemap_root();

            for vma in vmas.iter_mut() {
                let backed = vma.backing.as_ref().is_some_and(|b| Arc::ptr_eq(b, obj));
                if !backed {
                    continue;
                }
                let collides = collisions
                    .iter()
                    .find(|(start, _)| *start == vma.start)
                    .is_some_and(|(_, c)| *c);
                let plan = plan_remap(vma.length, vma.obj_offset, old_size, new_size, collides);

                #[cfg(target_os = "none")]
                if let Some(root) = root {
                    crate::mm::vmm::with_vmm(|vmm| {
                        // SAFETY: The old range belonged to this VMA and the
                        // pagemap is live.
                        unsafe { vmm.unmap_range(root, vma.start, plan.unmap_pages) };

                        if plan.map_pages > 0 {
                            let backing_virt = VirtAddr::new_truncate(
                                new_backing as u64 + vma.obj_offset,
                            );
                            if let Some(phys) = vmm.virt_to_phys(backing_virt) {
                                // SAFETY: The range was just vacated and the
                                // new backing is committed.
                                unsafe {
                                    vmm.map_range(
                                        root,
                                        vma.start,
                                        phys,
                                        plan.map_pages,
                                        vma.flags,
                                    );
                                }
                            }
                        }
                    });
                }
                vma.length = plan.new_length;
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    fn std_backing_alloc(pages: usize) -> Option<*mut u8> {
        let layout =
            core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        (!ptr.is_null()).then_some(ptr)
    }

    fn std_backing_free(ptr: *mut u8, pages: usize) {
        let layout =
            core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: ptr came from std_backing_alloc with the same layout.
        unsafe { std::alloc::dealloc(ptr, layout) };
    }

    fn ensure_heap() {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| heap::init(std_backing_alloc, std_backing_free));
    }

    fn test_process() -> Arc<Process> {
        Process::new_kernel_for_tests("vmo-tests")
    }

    #[test]
    fn create_zeroes_and_reads_back() {
        ensure_heap();
        let process = test_process();
        let h = create(&process, 12288, 0, Rights::READ | Rights::WRITE | Rights::MAP).unwrap();

        let mut buf = [0xFFu8; 64];
        assert_eq!(read(&process, h, &mut buf, 0).unwrap(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_at_offsets() {
        ensure_heap();
        let process = test_process();
        let h = create(&process, 12288, 0, Rights::READ | Rights::WRITE).unwrap();

        let a = [b'A'; 4096];
        let b = [b'B'; 4096];
        let c = [b'C'; 4096];
        assert_eq!(write(&process, h, &a, 0).unwrap(), 4096);
        assert_eq!(write(&process, h, &b, 4096).unwrap(), 4096);
        assert_eq!(write(&process, h, &c, 8192).unwrap(), 4096);

        let mut out = [0u8; 4096];
        assert_eq!(read(&process, h, &mut out, 4096).unwrap(), 4096);
        assert!(out.iter().all(|&x| x == b'B'));
    }

    #[test]
    fn reads_are_short_at_eof() {
        ensure_heap();
        let process = test_process();
        let h = create(&process, 100, 0, Rights::READ | Rights::WRITE).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(read(&process, h, &mut buf, 90).unwrap(), 10);
        assert_eq!(read(&process, h, &mut buf, 100).unwrap(), 0);
        assert_eq!(read(&process, h, &mut buf, 200).unwrap(), 0);
    }

    #[test]
    fn rights_are_enforced() {
        ensure_heap();
        let process = test_process();
        let h = create(&process, 4096, 0, Rights::READ).unwrap();
        let mut buf = [0u8; 4];
        assert!(read(&process, h, &mut buf, 0).is_ok());
        assert_eq!(
            write(&process, h, &buf, 0).unwrap_err(),
            Error::PermissionDenied
        );
        assert_eq!(
            map(&process, h, None, 0, 0, Rights::READ).unwrap_err(),
            Error::PermissionDenied
        );
    }

    #[test]
    fn map_rights_must_be_subset() {
        ensure_heap();
        let process = test_process();
        let h = create(&process, 4096, 0, Rights::READ | Rights::MAP).unwrap();
        // Write mapping exceeds the handle's rights.
        assert_eq!(
            map(&process, h, None, 0, 0, Rights::READ | Rights::WRITE).unwrap_err(),
            Error::PermissionDenied
        );
        // Read mapping is allowed; the kernel process gets a pointer.
        assert!(map(&process, h, None, 0, 0, Rights::READ).is_ok());
    }

    #[test]
    fn kernel_map_returns_backing_pointer() {
        ensure_heap();
        let process = test_process();
        let h = create(
            &process,
            8192,
            0,
            Rights::READ | Rights::WRITE | Rights::MAP,
        )
        .unwrap();

        write(&process, h, b"marker", 4096).unwrap();
        let addr = map(&process, h, None, 4096, 4096, Rights::READ).unwrap();
        // SAFETY: The address points into the VMO backing.
        let seen = unsafe { core::slice::from_raw_parts(addr.as_ptr::<u8>(), 6) };
        assert_eq!(seen, b"marker");
    }

    #[test]
    fn map_bounds_are_checked() {
        ensure_heap();
        let process = test_process();
        let h = create(&process, 8192, 0, Rights::READ | Rights::MAP).unwrap();
        assert_eq!(
            map(&process, h, None, 8192, 0, Rights::READ).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            map(&process, h, None, 4096, 8192, Rights::READ).unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn resize_requires_flag_and_right() {
        ensure_heap();
        let process = test_process();
        let fixed = create(&process, 4096, 0, Rights::READ | Rights::WRITE).unwrap();
        assert_eq!(
            resize(&process, fixed, 8192).unwrap_err(),
            Error::PermissionDenied
        );

        let read_only = create(&process, 4096, VMO_FLAG_RESIZABLE, Rights::READ).unwrap();
        assert_eq!(
            resize(&process, read_only, 8192).unwrap_err(),
            Error::PermissionDenied
        );
    }

    #[test]
    fn resize_preserves_prefix_and_zeroes_tail() {
        ensure_heap();
        let process = test_process();
        let h = create(
            &process,
            4096,
            VMO_FLAG_RESIZABLE,
            Rights::READ | Rights::WRITE,
        )
        .unwrap();
        write(&process, h, b"persist", 0).unwrap();

        resize(&process, h, 3 * 4096).unwrap();

        let mut buf = [0u8; 7];
        assert_eq!(read(&process, h, &mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"persist");
        let mut tail = [0xFFu8; 16];
        assert_eq!(read(&process, h, &mut tail, 2 * 4096).unwrap(), 16);
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn resize_grows_vma_that_covered_the_end() {
        ensure_heap();
        let process = test_process();
        let h = create(
            &process,
            4096,
            VMO_FLAG_RESIZABLE,
            Rights::READ | Rights::WRITE | Rights::MAP,
        )
        .unwrap();
        // Record a VMA over the whole object, as a user mapping would.
        let obj = process.with_handles(|t| t.object(h)).unwrap();
        process
            .with_vmas(|vmas| {
                vmas.add(
                    VirtAddr::new(0x40_0000),
                    4096,
                    map_rights_to_flags(Rights::READ),
                    Some(obj),
                    0,
                )
            })
            .unwrap();

        resize(&process, h, 2 * 4096 + 1).unwrap();

        process.with_vmas(|vmas| {
            let vma = vmas.find(VirtAddr::new(0x40_0000)).unwrap();
            // Grew by exactly the size delta.
            assert_eq!(vma.length, 4096 + (2 * 4096 + 1 - 4096) as u64);
        });
    }

    #[test]
    fn remap_plan_covers_shrink_growth_and_collision() {
        // Shrink: a VMA at offset 8192 of a formerly 16 KiB object that is
        // now 4 KiB maps nothing.
        let plan = plan_remap(4096, 8192, 16384, 4096, false);
        assert_eq!(plan.unmap_pages, 1);
        assert_eq!(plan.map_pages, 0);
        assert_eq!(plan.new_length, 4096);

        // Shrink with partial overlap: offset 0, length 16 KiB, new size
        // 6 KiB -> map 2 pages.
        let plan = plan_remap(16384, 0, 16384, 6144, false);
        assert_eq!(plan.map_pages, 2);

        // Growth with collision: the VMA cannot grow.
        let plan = plan_remap(4096, 0, 4096, 8192, true);
        assert_eq!(plan.new_length, 4096);
        assert_eq!(plan.map_pages, 1);

        // Growth without collision extends the VMA to the new end.
        let plan = plan_remap(4096, 0, 4096, 8192, false);
        assert_eq!(plan.new_length, 8192);
        assert_eq!(plan.map_pages, 2);
    }
}
