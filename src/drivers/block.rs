//! Unified block device abstraction
//!
//! Both storage drivers are folded behind the `BlockDevice` trait so that
//! everything above this layer operates purely on logical 512-byte sectors.
//! The `AnyBlockDevice` enum provides type-safe dispatch without trait
//! objects; `ActiveBlockDevice` holds the one device adopted at probe time
//! (NVMe preferred over AHCI) or nothing at all.

use crate::drivers::ahci::{self, AhciController, AhciError};
use crate::drivers::nvme::{self, NvmeController, NvmeError};
use crate::drivers::pci::ConfigAccess;

/// Standard sector size (512 bytes)
pub const SECTOR_SIZE: usize = 512;

/// Information about a block device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// Driver name ("nvme", "ahci")
    pub name: &'static str,
    /// Size of each block in bytes
    pub block_size: u32,
    /// Total number of blocks on the device (0 if unknown)
    pub num_blocks: u64,
}

/// Unified error type for block operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// No block device is active
    NoDevice,
    /// The driver reported a failure (command error or timeout)
    DeviceError,
    /// Invalid parameter (bad count, buffer too small, etc.)
    InvalidParameter,
}

impl From<NvmeError> for BlockError {
    fn from(e: NvmeError) -> Self {
        match e {
            NvmeError::NoController => BlockError::NoDevice,
            NvmeError::InvalidParameter => BlockError::InvalidParameter,
            _ => BlockError::DeviceError,
        }
    }
}

impl From<AhciError> for BlockError {
    fn from(e: AhciError) -> Self {
        match e {
            AhciError::NoController | AhciError::NoDevice => BlockError::NoDevice,
            AhciError::InvalidParameter => BlockError::InvalidParameter,
            _ => BlockError::DeviceError,
        }
    }
}

/// Common interface for block storage
pub trait BlockDevice {
    /// Device information
    fn info(&self) -> BlockDeviceInfo;

    /// Read `count` blocks starting at `lba` into `buffer`
    fn read_blocks(&mut self, lba: u64, count: u32, buffer: &mut [u8]) -> Result<(), BlockError>;

    /// Read a single block
    fn read_block(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), BlockError> {
        self.read_blocks(lba, 1, buffer)
    }
}

impl BlockDevice for NvmeController {
    fn info(&self) -> BlockDeviceInfo {
        BlockDeviceInfo {
            name: "nvme",
            block_size: SECTOR_SIZE as u32,
            num_blocks: self.num_blocks(),
        }
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buffer: &mut [u8]) -> Result<(), BlockError> {
        NvmeController::read_blocks(self, lba, count, buffer)?;
        Ok(())
    }
}

impl BlockDevice for AhciController {
    fn info(&self) -> BlockDeviceInfo {
        BlockDeviceInfo {
            name: "ahci",
            block_size: SECTOR_SIZE as u32,
            num_blocks: self.sector_count(),
        }
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buffer: &mut [u8]) -> Result<(), BlockError> {
        self.read_sectors(lba, count, buffer)?;
        Ok(())
    }
}

/// Type-safe dispatch over the concrete drivers
pub enum AnyBlockDevice {
    Nvme(NvmeController),
    Ahci(AhciController),
}

impl BlockDevice for AnyBlockDevice {
    fn info(&self) -> BlockDeviceInfo {
        match self {
            AnyBlockDevice::Nvme(dev) => dev.info(),
            AnyBlockDevice::Ahci(dev) => dev.info(),
        }
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buffer: &mut [u8]) -> Result<(), BlockError> {
        // Qualified call: NvmeController has an inherent read_blocks too
        match self {
            AnyBlockDevice::Nvme(dev) => BlockDevice::read_blocks(dev, lba, count, buffer),
            AnyBlockDevice::Ahci(dev) => BlockDevice::read_blocks(dev, lba, count, buffer),
        }
    }
}

/// The block device adopted at probe time, if any.
///
/// NVMe is tried first; AHCI second. Reads against an absent device fail
/// immediately with `BlockError::NoDevice`.
pub struct ActiveBlockDevice {
    inner: Option<AnyBlockDevice>,
}

impl ActiveBlockDevice {
    /// A device holder with nothing behind it
    pub const fn absent() -> Self {
        Self { inner: None }
    }

    /// Probe the PCI bus for a storage controller and adopt the first one
    /// that comes up.
    pub fn probe<C: ConfigAccess>(cam: &C) -> Self {
        match nvme::take_queue_memory() {
            Some(queues) => match NvmeController::probe(cam, queues) {
                Ok(dev) => return Self {
                    inner: Some(AnyBlockDevice::Nvme(dev)),
                },
                Err(NvmeError::NoController) => {
                    log::debug!("block: no NVMe controller");
                }
                Err(e) => {
                    log::warn!("block: NVMe init failed: {:?}", e);
                }
            },
            None => log::error!("block: NVMe queue memory already taken"),
        }

        match ahci::take_command_context() {
            Some(ctx) => match AhciController::probe(cam, ctx) {
                Ok(dev) => return Self {
                    inner: Some(AnyBlockDevice::Ahci(dev)),
                },
                Err(AhciError::NoController) => {
                    log::debug!("block: no AHCI controller");
                }
                Err(e) => {
                    log::warn!("block: AHCI init failed: {:?}", e);
                }
            },
            None => log::error!("block: AHCI command context already taken"),
        }

        log::warn!("block: no usable storage device");
        Self { inner: None }
    }

    /// Metadata of the active device, or `None` if no device was adopted
    pub fn active(&self) -> Option<BlockDeviceInfo> {
        self.inner.as_ref().map(|dev| dev.info())
    }
}

impl BlockDevice for ActiveBlockDevice {
    fn info(&self) -> BlockDeviceInfo {
        self.active().unwrap_or(BlockDeviceInfo {
            name: "none",
            block_size: 0,
            num_blocks: 0,
        })
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buffer: &mut [u8]) -> Result<(), BlockError> {
        match &mut self.inner {
            Some(dev) => dev.read_blocks(lba, count, buffer),
            None => Err(BlockError::NoDevice),
        }
    }
}
