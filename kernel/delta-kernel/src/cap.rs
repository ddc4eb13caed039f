//! Per-process capability tables.
//!
//! A handle is an index into a dense per-process table; each live entry
//! holds one object reference, a file offset, open flags, and a rights
//! mask. Authority is the pair (handle possession, rights). Rights only
//! ever shrink: duplication intersects masks and replacement requires a
//! subset.

use alloc::vec::Vec;

use delta_syscall::{Error, Rights};

use crate::obj::ObjectRef;

/// Initial slot count of a fresh table.
pub const INITIAL_HANDLES: usize = 16;

/// One live handle table entry.
pub struct HandleEntry {
    /// The object this handle refers to (one reference held).
    pub obj: ObjectRef,
    /// File position for seekable objects; readdir cursor for directories.
    pub offset: u64,
    /// Open flags, currently unused by the core.
    pub flags: u32,
    /// Capability rights mask.
    pub rights: Rights,
}

impl core::fmt::Debug for HandleEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandleEntry")
            .field("obj", &core::ptr::addr_of!(*self.obj))
            .field("offset", &self.offset)
            .field("flags", &self.flags)
            .field("rights", &self.rights)
            .finish()
    }
}

/// A dense handle table. Indices are stable for the life of an entry and
/// reused after close.
pub struct HandleTable {
    slots: Vec<Option<HandleEntry>>,
    count: usize,
}

impl HandleTable {
    /// Creates a table with the initial capacity.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(INITIAL_HANDLES);
        slots.resize_with(INITIAL_HANDLES, || None);
        Self { slots, count: 0 }
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Current slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Grants a handle to `obj` with `rights`, taking one reference.
    ///
    /// Finds the lowest free slot, doubling the table when full.
    pub fn grant(&mut self, obj: ObjectRef, rights: Rights) -> Result<i32, Error> {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                let old = self.slots.len();
                self.slots.resize_with(old * 2, || None);
                old
            }
        };
        self.slots[slot] = Some(HandleEntry {
            obj,
            offset: 0,
            flags: 0,
            rights,
        });
        self.count += 1;
        Ok(slot as i32)
    }

    /// Returns the entry behind `handle`.
    pub fn get(&self, handle: i32) -> Result<&HandleEntry, Error> {
        usize::try_from(handle)
            .ok()
            .and_then(|idx| self.slots.get(idx))
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidArgument)
    }

    /// Returns the entry behind `handle`, mutably (offset updates).
    pub fn get_mut(&mut self, handle: i32) -> Result<&mut HandleEntry, Error> {
        usize::try_from(handle)
            .ok()
            .and_then(|idx| self.slots.get_mut(idx))
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidArgument)
    }

    /// Returns a new reference to the object behind `handle`.
    pub fn object(&self, handle: i32) -> Result<ObjectRef, Error> {
        Ok(self.get(handle)?.obj.clone())
    }

    /// Checks that `handle` carries every right in `required`.
    pub fn check_rights(&self, handle: i32, required: Rights) -> Result<(), Error> {
        if self.get(handle)?.rights.contains(required) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// Removes and returns the entry (the channel-transfer move).
    pub fn take(&mut self, handle: i32) -> Result<HandleEntry, Error> {
        let slot = usize::try_from(handle).map_err(|_| Error::InvalidArgument)?;
        let entry = self
            .slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(Error::InvalidArgument)?;
        self.count -= 1;
        Ok(entry)
    }

    /// Closes `handle`, dropping its object reference.
    pub fn close(&mut self, handle: i32) -> Result<(), Error> {
        self.take(handle).map(drop)
    }

    /// Duplicates `handle` with `new_rights` intersected into the source
    /// rights. Requires `DUPLICATE` on the source.
    pub fn duplicate(&mut self, handle: i32, new_rights: Rights) -> Result<i32, Error> {
        let (obj, rights) = {
            let entry = self.get(handle)?;
            if !entry.rights.contains(Rights::DUPLICATE) {
                return Err(Error::PermissionDenied);
            }
            (entry.obj.clone(), entry.rights.reduce(new_rights))
        };
        self.grant(obj, rights)
    }

    /// Replaces the rights of `handle`; the new mask must be a subset.
    pub fn replace_rights(&mut self, handle: i32, new_rights: Rights) -> Result<(), Error> {
        let entry = self.get_mut(handle)?;
        if !entry.rights.contains(new_rights) {
            return Err(Error::PermissionDenied);
        }
        entry.rights = new_rights;
        Ok(())
    }

    /// Drains every live entry (process teardown).
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.count = 0;
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::{KernelObject, ObjectType};
    use alloc::sync::Arc;
    use core::any::Any;

    struct Dummy;

    impl KernelObject for Dummy {
        fn obj_type(&self) -> ObjectType {
            ObjectType::Device
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn obj() -> ObjectRef {
        Arc::new(Dummy)
    }

    #[test]
    fn grant_assigns_dense_indices() {
        let mut table = HandleTable::new();
        let o = obj();
        assert_eq!(table.grant(o.clone(), Rights::READ).unwrap(), 0);
        assert_eq!(table.grant(o.clone(), Rights::READ).unwrap(), 1);
        assert_eq!(table.grant(o, Rights::READ).unwrap(), 2);
        assert_eq!(table.count(), 3);
    }

    #[test]
    fn closed_slots_are_reused() {
        let mut table = HandleTable::new();
        let o = obj();
        let a = table.grant(o.clone(), Rights::READ).unwrap();
        let _b = table.grant(o.clone(), Rights::READ).unwrap();
        table.close(a).unwrap();
        assert_eq!(table.grant(o, Rights::READ).unwrap(), a);
    }

    #[test]
    fn table_doubles_when_full() {
        let mut table = HandleTable::new();
        let o = obj();
        for i in 0..INITIAL_HANDLES as i32 {
            assert_eq!(table.grant(o.clone(), Rights::READ).unwrap(), i);
        }
        assert_eq!(table.capacity(), INITIAL_HANDLES);
        let next = table.grant(o, Rights::READ).unwrap();
        assert_eq!(next, INITIAL_HANDLES as i32);
        assert_eq!(table.capacity(), INITIAL_HANDLES * 2);
    }

    #[test]
    fn grant_takes_a_reference_close_drops_it() {
        let mut table = HandleTable::new();
        let o = obj();
        let baseline = Arc::strong_count(&o);
        let h = table.grant(o.clone(), Rights::READ).unwrap();
        assert_eq!(Arc::strong_count(&o), baseline + 1);
        table.close(h).unwrap();
        assert_eq!(Arc::strong_count(&o), baseline);
    }

    #[test]
    fn duplicate_requires_right_and_reduces() {
        let mut table = HandleTable::new();
        let o = obj();

        let no_dup = table.grant(o.clone(), Rights::READ).unwrap();
        assert_eq!(
            table.duplicate(no_dup, Rights::READ).unwrap_err(),
            Error::PermissionDenied
        );

        let h = table
            .grant(o, Rights::READ | Rights::WRITE | Rights::DUPLICATE)
            .unwrap();
        let dup = table
            .duplicate(h, Rights::READ | Rights::TRANSFER | Rights::MAP)
            .unwrap();
        // Only the intersection survives; nothing was added.
        assert_eq!(table.get(dup).unwrap().rights, Rights::READ);
    }

    #[test]
    fn rights_monotone_over_operations() {
        let mut table = HandleTable::new();
        let o = obj();
        let original = Rights::READ | Rights::WRITE | Rights::DUPLICATE;
        let mut h = table.grant(o, original).unwrap();

        // Any chain of duplications and replacements stays within the
        // original grant.
        for step in [
            Rights::READ | Rights::DUPLICATE,
            Rights::READ | Rights::DUPLICATE | Rights::MAP,
            Rights::DUPLICATE,
        ] {
            h = table.duplicate(h, step).unwrap();
            assert!(original.contains(table.get(h).unwrap().rights));
        }

        assert_eq!(
            table.replace_rights(h, Rights::WRITE).unwrap_err(),
            Error::PermissionDenied
        );
        table.replace_rights(h, Rights::empty()).unwrap();
        assert_eq!(table.get(h).unwrap().rights, Rights::empty());
    }

    #[test]
    fn invalid_handles_rejected() {
        let table = HandleTable::new();
        assert_eq!(table.get(-1).unwrap_err(), Error::InvalidArgument);
        assert_eq!(table.get(0).unwrap_err(), Error::InvalidArgument);
        assert_eq!(table.get(1000).unwrap_err(), Error::InvalidArgument);
    }
}
