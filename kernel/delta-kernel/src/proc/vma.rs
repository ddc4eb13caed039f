//! Per-process virtual memory area tracking.
//!
//! A VMA records one contiguous user mapping: range, flags, and an optional
//! backing object with its offset. VMAs of one process never overlap.
//! Anonymous VMAs (no backing object) own their physical pages; backed VMAs
//! hold a reference to the backing object, which owns the pages.

use alloc::vec::Vec;

use delta_core::addr::{PAGE_SIZE, VirtAddr};
use delta_syscall::Error;

use crate::mm::mapper::MapFlags;
use crate::obj::ObjectRef;

/// Lowest user-space address handed out to mappings.
pub const USER_SPACE_START: u64 = 0x40_0000;

/// One past the highest canonical low-half user address.
pub const USER_SPACE_END: u64 = 0x8000_0000_0000;

/// One virtual memory area.
pub struct Vma {
    /// Start address (page aligned).
    pub start: VirtAddr,
    /// Length in bytes (page aligned).
    pub length: u64,
    /// Mapping flags used when the range was installed.
    pub flags: MapFlags,
    /// Backing object, `None` for anonymous memory.
    pub backing: Option<ObjectRef>,
    /// Offset into the backing object.
    pub obj_offset: u64,
}

impl Vma {
    /// One past the last address of the area.
    pub fn end(&self) -> u64 {
        self.start.as_u64() + self.length
    }

    /// Whether `addr` falls inside the area.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr.as_u64() < self.end()
    }
}

/// The per-process VMA list plus the allocation hint.
pub struct VmaList {
    areas: Vec<Vma>,
    /// Next address to try for hint-less allocations.
    next_addr: u64,
}

impl VmaList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            areas: Vec::new(),
            next_addr: USER_SPACE_START,
        }
    }

    /// The recorded areas, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.areas.iter()
    }

    /// Mutable iteration (VMO resize adjusts lengths in place).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Vma> {
        self.areas.iter_mut()
    }

    /// Number of recorded areas.
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Whether no areas are recorded.
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    fn overlaps(&self, start: u64, length: u64) -> bool {
        let end = start + length;
        self.areas
            .iter()
            .any(|vma| start < vma.end() && vma.start.as_u64() < end)
    }

    /// Finds a free run of `length` bytes, scanning from the hint and
    /// skipping past conflicting areas. Advances the hint on success.
    pub fn find_free(&mut self, length: u64) -> Option<VirtAddr> {
        if length == 0 {
            return None;
        }
        let length = (length + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

        let mut addr = self.next_addr.max(USER_SPACE_START);
        'outer: while addr + length <= USER_SPACE_END {
            for vma in &self.areas {
                if addr < vma.end() && vma.start.as_u64() < addr + length {
                    // Conflict; continue past this area.
                    addr = (vma.end() + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
                    continue 'outer;
                }
            }
            self.next_addr = addr + length;
            return Some(VirtAddr::new(addr));
        }
        None
    }

    /// Records an area at a caller-chosen address.
    ///
    /// Fails with [`Error::AlreadyExists`] when the range would overlap an
    /// existing area.
    pub fn add(
        &mut self,
        start: VirtAddr,
        length: u64,
        flags: MapFlags,
        backing: Option<ObjectRef>,
        obj_offset: u64,
    ) -> Result<(), Error> {
        let length = (length + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        if length == 0 || !start.is_aligned(PAGE_SIZE as u64) {
            return Err(Error::InvalidArgument);
        }
        if self.overlaps(start.as_u64(), length) {
            return Err(Error::AlreadyExists);
        }
        self.areas.push(Vma {
            start,
            length,
            flags,
            backing,
            obj_offset,
        });
        Ok(())
    }

    /// Finds a free run and records an area there in one step.
    pub fn alloc(
        &mut self,
        length: u64,
        flags: MapFlags,
        backing: Option<ObjectRef>,
        obj_offset: u64,
    ) -> Result<VirtAddr, Error> {
        let start = self.find_free(length).ok_or(Error::ResourceExhausted)?;
        self.add(start, length, flags, backing, obj_offset)?;
        Ok(start)
    }

    /// Removes the area starting exactly at `start`, returning it.
    pub fn remove(&mut self, start: VirtAddr) -> Result<Vma, Error> {
        let idx = self
            .areas
            .iter()
            .position(|vma| vma.start == start)
            .ok_or(Error::NotFound)?;
        Ok(self.areas.swap_remove(idx))
    }

    /// Finds the area containing `addr`.
    pub fn find(&self, addr: VirtAddr) -> Option<&Vma> {
        self.areas.iter().find(|vma| vma.contains(addr))
    }

    /// Drains all areas for process teardown.
    pub fn drain(&mut self) -> Vec<Vma> {
        core::mem::take(&mut self.areas)
    }

    /// True when growing `vma` by `growth` bytes would collide with a
    /// neighbouring area.
    pub fn growth_collides(&self, vma_start: VirtAddr, new_end: u64) -> bool {
        self.areas.iter().any(|other| {
            other.start != vma_start && other.start.as_u64() < new_end && vma_start < other.start
        })
    }
}

impl Default for VmaList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(list: &mut VmaList, len: u64) -> VirtAddr {
        list.alloc(len, MapFlags::WRITE | MapFlags::USER, None, 0)
            .unwrap()
    }

    #[test]
    fn allocations_start_at_user_base_and_advance() {
        let mut list = VmaList::new();
        let a = anon(&mut list, 0x3000);
        let b = anon(&mut list, 0x1000);
        assert_eq!(a.as_u64(), USER_SPACE_START);
        assert_eq!(b.as_u64(), USER_SPACE_START + 0x3000);
    }

    #[test]
    fn areas_never_overlap() {
        let mut list = VmaList::new();
        for _ in 0..32 {
            anon(&mut list, 0x2000);
        }
        let areas: Vec<(u64, u64)> = list.iter().map(|v| (v.start.as_u64(), v.end())).collect();
        for (i, &(s1, e1)) in areas.iter().enumerate() {
            for &(s2, e2) in &areas[i + 1..] {
                assert!(e1 <= s2 || e2 <= s1, "overlap [{s1:#x},{e1:#x}) [{s2:#x},{e2:#x})");
            }
        }
    }

    #[test]
    fn explicit_add_rejects_overlap() {
        let mut list = VmaList::new();
        let a = anon(&mut list, 0x4000);
        let inside = VirtAddr::new(a.as_u64() + 0x1000);
        assert_eq!(
            list.add(inside, 0x1000, MapFlags::USER, None, 0).unwrap_err(),
            Error::AlreadyExists
        );
    }

    #[test]
    fn find_free_skips_hint_collisions() {
        let mut list = VmaList::new();
        // Occupy a fixed range ahead of the hint.
        list.add(
            VirtAddr::new(USER_SPACE_START + 0x2000),
            0x2000,
            MapFlags::USER,
            None,
            0,
        )
        .unwrap();
        // A 3-page allocation cannot sit at the hint (would overlap); it
        // lands past the fixed range.
        let got = list.find_free(0x3000).unwrap();
        assert_eq!(got.as_u64(), USER_SPACE_START + 0x4000);
    }

    #[test]
    fn remove_and_reuse() {
        let mut list = VmaList::new();
        let a = anon(&mut list, 0x2000);
        let removed = list.remove(a).unwrap();
        assert_eq!(removed.length, 0x2000);
        assert!(list.remove(a).is_err());
        assert!(list.find(a).is_none());
    }

    #[test]
    fn find_locates_containing_area() {
        let mut list = VmaList::new();
        let a = anon(&mut list, 0x3000);
        assert!(list.find(VirtAddr::new(a.as_u64() + 0x2FFF)).is_some());
        assert!(list.find(VirtAddr::new(a.as_u64() + 0x3000)).is_none());
    }
}
