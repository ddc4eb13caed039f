//! Capability rights bits.
//!
//! A handle's authority is the combination of possessing the handle and this
//! mask. Duplication intersects masks, so rights are monotone decreasing over
//! any sequence of handle operations.

bitflags::bitflags! {
    /// Rights mask attached to every handle table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u32 {
        /// Read through the object's read op.
        const READ = 0x01;
        /// Write through the object's write op.
        const WRITE = 0x02;
        /// Map with execute permission.
        const EXECUTE = 0x04;
        /// Map the object into an address space.
        const MAP = 0x08;
        /// Duplicate the handle.
        const DUPLICATE = 0x10;
        /// Transfer the handle through a channel.
        const TRANSFER = 0x20;
        /// Signal the object.
        const SIGNAL = 0x40;
        /// Query the object through `object_get_info`.
        const GET_INFO = 0x80;
        /// Wait on the object (process exit, etc.).
        const WAIT = 0x100;
    }
}

impl Rights {
    /// The usual grant for freshly created objects the caller fully owns.
    pub const fn default_owner() -> Self {
        Self::from_bits_truncate(
            Self::READ.bits()
                | Self::WRITE.bits()
                | Self::MAP.bits()
                | Self::DUPLICATE.bits()
                | Self::TRANSFER.bits()
                | Self::GET_INFO.bits()
                | Self::WAIT.bits(),
        )
    }

    /// Intersects with `requested`; duplication can only reduce rights.
    pub const fn reduce(self, requested: Rights) -> Rights {
        Self::from_bits_truncate(self.bits() & requested.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_bit_positions() {
        assert_eq!(Rights::READ.bits(), 0x01);
        assert_eq!(Rights::WRITE.bits(), 0x02);
        assert_eq!(Rights::EXECUTE.bits(), 0x04);
        assert_eq!(Rights::MAP.bits(), 0x08);
        assert_eq!(Rights::DUPLICATE.bits(), 0x10);
        assert_eq!(Rights::TRANSFER.bits(), 0x20);
        assert_eq!(Rights::SIGNAL.bits(), 0x40);
        assert_eq!(Rights::GET_INFO.bits(), 0x80);
        assert_eq!(Rights::WAIT.bits(), 0x100);
    }

    #[test]
    fn reduce_never_adds() {
        let granted = Rights::READ | Rights::DUPLICATE;
        let requested = Rights::READ | Rights::WRITE | Rights::TRANSFER;
        let reduced = granted.reduce(requested);
        assert_eq!(reduced, Rights::READ);
        assert!(granted.contains(reduced));
    }
}
