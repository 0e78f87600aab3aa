//! Storage stack for a small x86_64 kernel
//!
//! PCI enumeration, AHCI and NVMe drivers, a block device abstraction, a
//! GPT partition locator, and a read-only FAT32 driver. Everything is
//! synchronous and single-threaded: one sequential caller drives all I/O,
//! one command is in flight per controller at a time, and hardware waits
//! are bounded busy-wait loops.
//!
//! The crate defines no panic handler; the embedding kernel provides one.

#![cfg_attr(not(test), no_std)]

pub mod drivers;
pub mod fs;
pub mod logger;
pub mod poll;
pub mod storage;

pub use drivers::block::{
    ActiveBlockDevice, AnyBlockDevice, BlockDevice, BlockDeviceInfo, BlockError,
};
pub use storage::StorageStack;

#[cfg(target_arch = "x86_64")]
pub use storage::init;
