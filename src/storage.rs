//! Storage stack entry point
//!
//! Ties the layers together: PCI probe picks a block device, GPT locates
//! the EFI System Partition, FAT32 mounts it. The stack is an explicit
//! value handed to the caller (typically a shell loop) rather than a
//! global; the caller drives all I/O sequentially.

use crate::drivers::block::{ActiveBlockDevice, BlockDevice, BlockDeviceInfo};
use crate::fs::fat::Fat32Volume;
use crate::fs::gpt;

/// Probe the PCI bus and build a storage stack over whatever device comes
/// up. With no usable controller the stack still works, but every mount
/// and read reports failure.
#[cfg(target_arch = "x86_64")]
pub fn init() -> StorageStack<ActiveBlockDevice> {
    let device = ActiveBlockDevice::probe(&crate::drivers::pci::PortCam);
    match device.active() {
        Some(info) => log::info!(
            "storage: using {} ({} blocks of {} bytes)",
            info.name,
            info.num_blocks,
            info.block_size
        ),
        None => log::warn!("storage: no device, operations will fail"),
    }
    StorageStack::new(device)
}

/// The storage stack: one block device plus the mounted volume, if any.
pub struct StorageStack<D: BlockDevice> {
    disk: D,
    volume: Option<Fat32Volume>,
}

impl<D: BlockDevice> StorageStack<D> {
    pub fn new(disk: D) -> Self {
        Self { disk, volume: None }
    }

    /// Name of the underlying device driver ("nvme", "ahci", "none")
    pub fn device_name(&self) -> &'static str {
        self.disk.info().name
    }

    /// Metadata of the underlying block device
    pub fn info(&self) -> BlockDeviceInfo {
        self.disk.info()
    }

    /// Whether a volume is currently mounted
    pub fn is_mounted(&self) -> bool {
        self.volume.is_some()
    }

    /// Locate the EFI System Partition and mount it as FAT32.
    ///
    /// A disk without a valid GPT is treated as an unpartitioned filesystem
    /// starting at block 0. Any previous mount is discarded up front, so a
    /// failed mount leaves the stack unmounted.
    pub fn mount(&mut self) -> bool {
        self.volume = None;
        let partition_lba = gpt::find_esp_start(&mut self.disk).unwrap_or(0);
        match Fat32Volume::mount(&mut self.disk, partition_lba) {
            Some(volume) => {
                self.volume = Some(volume);
                true
            }
            None => false,
        }
    }

    /// List the root directory, reporting each short name to `each`.
    pub fn list_root(&mut self, each: impl FnMut(&str)) -> bool {
        match self.volume {
            Some(volume) => volume.list_root(&mut self.disk, each),
            None => {
                log::warn!("storage: list_root before mount");
                false
            }
        }
    }

    /// Read the root-directory file `name` into `buffer`; returns the
    /// file's true size (the copy is truncated to the buffer if smaller).
    pub fn read_file(&mut self, name: &str, buffer: &mut [u8]) -> Option<u32> {
        let volume = match self.volume {
            Some(volume) => volume,
            None => {
                log::warn!("storage: read_file before mount");
                return None;
            }
        };
        volume.read_file(&mut self.disk, name, buffer)
    }
}
