//! Architecture support. x86_64 only; the dispatch layer exists so that the
//! rest of the kernel never names the architecture directly.

pub mod x86_64;

#[cfg(target_os = "none")]
pub use x86_64::cpu_init;
