//! Synchronization primitives.
//!
//! Two lock flavors with distinct types so interrupt discipline is visible at
//! the type level: [`SpinLock`] for data never touched from interrupt
//! handlers, [`IrqSpinLock`] for data shared with them.

mod irq_spinlock;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
