//! In-tree drivers. The core only needs the serial console; everything
//! else registers objects through the namespace from its own crate.

pub mod uart16550;
