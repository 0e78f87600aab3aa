//! Filesystem support
//!
//! GPT partition location and a read-only FAT32 driver, both layered on the
//! block device abstraction.

pub mod fat;
pub mod gpt;
