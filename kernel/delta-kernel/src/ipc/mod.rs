//! Inter-process communication.

pub mod channel;
