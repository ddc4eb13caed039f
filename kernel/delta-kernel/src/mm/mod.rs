//! Memory management: physical frames, kernel page tables, the kernel heap,
//! and virtual memory objects.

pub mod heap;
pub mod hhdm;
pub mod mapper;
pub mod pmm;
pub mod vmm;
pub mod vmo;

pub use delta_core::addr::{PAGE_SIZE, PAGE_SIZE_2M};

/// Number of 4 KiB pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}
