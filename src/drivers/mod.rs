//! Storage hardware drivers
//!
//! PCI enumeration plus the AHCI and NVMe controller drivers, unified
//! behind the block device abstraction.

pub mod ahci;
pub mod block;
pub mod nvme;
pub mod pci;
