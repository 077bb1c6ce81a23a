//! Demand-paged virtual memory for a small x86 kernel: supplemental page
//! tables, a clock-replaced frame table, swap, and memory-mapped files.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod vm;

pub use vm::{AddressSpace, PageFault, VmConfig, VmSystem};
