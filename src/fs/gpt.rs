//! GPT (GUID Partition Table) parser
//!
//! Locates the EFI System Partition. A disk without a valid GPT header is
//! treated as unpartitioned: the caller falls back to mounting at block 0.

use crate::drivers::block::{BlockDevice, SECTOR_SIZE};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// GPT header signature "EFI PART"
const GPT_SIGNATURE: u64 = 0x5452415020494645;

/// EFI System Partition type GUID (C12A7328-F81F-11D2-BA4B-00A0C93EC93B)
/// Stored in mixed-endian format
const ESP_TYPE_GUID: [u8; 16] = [
    0x28, 0x73, 0x2a, 0xc1, // LE: C12A7328
    0x1f, 0xf8, // LE: F81F
    0xd2, 0x11, // LE: 11D2
    0xba, 0x4b, // BE: BA4B
    0x00, 0xa0, 0xc9, 0x3e, 0xc9, 0x3b, // BE: 00A0C93EC93B
];

/// GPT Header structure (at LBA 1)
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout, Unaligned)]
struct GptHeader {
    /// Signature ("EFI PART")
    signature: u64,
    /// Revision (usually 0x00010000)
    revision: u32,
    /// Header size (usually 92 bytes)
    header_size: u32,
    /// CRC32 of header
    header_crc32: u32,
    /// Reserved (must be zero)
    reserved: u32,
    /// Current LBA (location of this header)
    current_lba: u64,
    /// Backup LBA (location of the backup header)
    backup_lba: u64,
    /// First usable LBA for partitions
    first_usable_lba: u64,
    /// Last usable LBA for partitions
    last_usable_lba: u64,
    /// Disk GUID
    disk_guid: [u8; 16],
    /// Starting LBA of partition entry array
    partition_entry_lba: u64,
    /// Number of partition entries
    num_partition_entries: u32,
    /// Size of each partition entry (usually 128 bytes)
    partition_entry_size: u32,
    /// CRC32 of partition entry array
    partition_entry_crc32: u32,
}

/// GPT Partition Entry
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout, Unaligned)]
struct GptPartitionEntry {
    /// Partition type GUID
    type_guid: [u8; 16],
    /// Unique partition GUID
    partition_guid: [u8; 16],
    /// First LBA
    first_lba: u64,
    /// Last LBA (inclusive)
    last_lba: u64,
    /// Attribute flags
    attributes: u64,
    /// Partition name (UTF-16LE, 36 characters)
    name: [u8; 72],
}

/// Scan the partition table for the EFI System Partition and return its
/// first LBA.
///
/// `None` for any failure along the way: unreadable header sector, missing
/// signature, undersized entries, or no ESP among the entries. All-zero
/// type GUIDs mark unused slots and are skipped.
pub fn find_esp_start<D: BlockDevice>(disk: &mut D) -> Option<u64> {
    let mut sector = [0u8; SECTOR_SIZE];
    if disk.read_block(1, &mut sector).is_err() {
        log::warn!("GPT: failed to read header sector");
        return None;
    }

    let (header, _) = GptHeader::read_from_prefix(&sector[..]).ok()?;
    if header.signature != GPT_SIGNATURE {
        log::debug!("GPT: no valid header, treating disk as unpartitioned");
        return None;
    }

    let entry_size = header.partition_entry_size as usize;
    if entry_size < core::mem::size_of::<GptPartitionEntry>() {
        log::warn!("GPT: undersized partition entries ({} bytes)", entry_size);
        return None;
    }

    let array_lba = header.partition_entry_lba;
    let num_entries = header.num_partition_entries;
    log::debug!(
        "GPT: {} entries of {} bytes at LBA {}",
        num_entries,
        entry_size,
        array_lba
    );

    // Entries are packed entry_size apart across consecutive sectors
    let mut loaded_lba = u64::MAX;
    for index in 0..num_entries as u64 {
        let byte_offset = index * entry_size as u64;
        let lba = array_lba + byte_offset / SECTOR_SIZE as u64;
        if lba != loaded_lba {
            if disk.read_block(lba, &mut sector).is_err() {
                log::warn!("GPT: failed to read partition array at LBA {}", lba);
                return None;
            }
            loaded_lba = lba;
        }

        let offset = (byte_offset % SECTOR_SIZE as u64) as usize;
        let (entry, _) = GptPartitionEntry::read_from_prefix(&sector[offset..]).ok()?;

        if entry.type_guid == [0u8; 16] {
            continue;
        }
        if entry.type_guid == ESP_TYPE_GUID {
            let first_lba = entry.first_lba;
            log::info!("GPT: ESP is partition {} at LBA {}", index, first_lba);
            return Some(first_lba);
        }
    }

    log::debug!("GPT: no EFI System Partition found");
    None
}
