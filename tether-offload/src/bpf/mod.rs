//! BPF map and program management for network accounting.

pub mod handler;
pub mod loader;
pub mod syscalls;

pub use handler::{BpfHandler, EntryLimits, InitError};
