//! FAT32 filesystem driver (read-only)
//!
//! Mounts a FAT32 volume at a partition offset and supports listing the
//! root directory and reading files by 8.3 name. Long file names are
//! skipped; only short names are reported and matched.

use crate::drivers::block::{BlockDevice, SECTOR_SIZE};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// 28-bit FAT32 cluster entry mask (upper 4 bits are reserved)
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;

/// Masked values at or above this mark end-of-chain
const END_OF_CHAIN: u32 = 0x0FFF_FFF8;

/// Long file name continuation entry
const ATTR_LONG_NAME: u8 = 0x0F;

/// Deleted directory entry marker
const ENTRY_DELETED: u8 = 0xE5;

/// Maximum rendered 8.3 name: 8 base + '.' + 3 extension
pub type ShortName = heapless::String<12>;

/// FAT32 boot sector fields used for mounting
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout, Unaligned)]
struct BootSector {
    /// Jump instruction (3 bytes)
    jmp: [u8; 3],
    /// OEM name (8 bytes)
    oem_name: [u8; 8],
    /// Bytes per sector
    bytes_per_sector: u16,
    /// Sectors per cluster
    sectors_per_cluster: u8,
    /// Reserved sectors (before first FAT)
    reserved_sectors: u16,
    /// Number of FATs
    num_fats: u8,
    /// Root entry count (0 for FAT32)
    root_entry_count: u16,
    /// Total sectors (16-bit, 0 if over 65535)
    total_sectors_16: u16,
    /// Media type
    media_type: u8,
    /// Sectors per FAT (FAT12/16, 0 for FAT32)
    sectors_per_fat_16: u16,
    /// Sectors per track
    sectors_per_track: u16,
    /// Number of heads
    num_heads: u16,
    /// Hidden sectors
    hidden_sectors: u32,
    /// Total sectors (32-bit)
    total_sectors_32: u32,
    /// Sectors per FAT (32-bit)
    sectors_per_fat_32: u32,
    /// Extended flags
    ext_flags: u16,
    /// Filesystem version
    fs_version: u16,
    /// Root directory cluster
    root_cluster: u32,
}

/// FAT directory entry (32 bytes)
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout, Unaligned)]
struct DirectoryEntry {
    /// Short name: 8-byte base plus 3-byte extension, space padded
    name: [u8; 11],
    /// Attributes
    attr: u8,
    /// Reserved for Windows NT
    nt_reserved: u8,
    /// Creation time tenths
    creation_time_tenths: u8,
    /// Creation time
    creation_time: u16,
    /// Creation date
    creation_date: u16,
    /// Last access date
    last_access_date: u16,
    /// First cluster high (FAT32)
    first_cluster_hi: u16,
    /// Last modification time
    modification_time: u16,
    /// Last modification date
    modification_date: u16,
    /// First cluster low
    first_cluster_lo: u16,
    /// File size
    file_size: u32,
}

impl DirectoryEntry {
    fn first_cluster(&self) -> u32 {
        ((self.first_cluster_hi as u32) << 16) | (self.first_cluster_lo as u32)
    }
}

/// Normalize a name like "readme.txt" into fixed 11-byte 8.3 form
/// ("README  TXT"). `None` if the name does not fit 8.3.
pub(crate) fn pack_short_name(name: &str) -> Option<[u8; 11]> {
    let (base, ext) = match name.split_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }

    let mut packed = [b' '; 11];
    for (i, b) in base.bytes().enumerate() {
        packed[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().enumerate() {
        packed[8 + i] = b.to_ascii_uppercase();
    }
    Some(packed)
}

/// Render an on-disk 11-byte short name as "BASE.EXT", dropping the dot
/// when the extension is blank.
pub(crate) fn unpack_short_name(packed: &[u8; 11]) -> ShortName {
    let mut name = ShortName::new();

    let base_len = packed[..8]
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |i| i + 1);
    for &b in &packed[..base_len] {
        let _ = name.push(b as char);
    }

    let ext_len = packed[8..]
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |i| i + 1);
    if ext_len > 0 {
        let _ = name.push('.');
        for &b in &packed[8..8 + ext_len] {
            let _ = name.push(b as char);
        }
    }

    name
}

/// A mounted FAT32 volume.
///
/// Holds only derived geometry, so it is `Copy`; a later mount simply
/// replaces the value. All sector numbers inside are relative to the
/// partition start except where noted.
#[derive(Clone, Copy, Debug)]
pub struct Fat32Volume {
    /// Absolute LBA of the partition start
    partition_lba: u64,
    sectors_per_cluster: u32,
    /// First FAT sector, relative to the partition
    fat_start: u32,
    /// First data sector, relative to the partition
    data_start: u32,
    root_cluster: u32,
}

impl Fat32Volume {
    /// Read and validate the boot sector at `partition_lba`.
    pub fn mount<D: BlockDevice>(disk: &mut D, partition_lba: u64) -> Option<Self> {
        let mut sector = [0u8; SECTOR_SIZE];
        if disk.read_block(partition_lba, &mut sector).is_err() {
            log::warn!("FAT32: failed to read boot sector at LBA {}", partition_lba);
            return None;
        }

        let (boot, _) = BootSector::read_from_prefix(&sector[..]).ok()?;
        let bytes_per_sector = boot.bytes_per_sector;
        let sectors_per_cluster = boot.sectors_per_cluster;
        let sectors_per_fat = boot.sectors_per_fat_32;

        if bytes_per_sector != SECTOR_SIZE as u16 {
            log::warn!("FAT32: unsupported sector size {}", bytes_per_sector);
            return None;
        }
        if sectors_per_cluster == 0 || sectors_per_fat == 0 {
            log::warn!("FAT32: invalid geometry in boot sector");
            return None;
        }

        let fat_start = boot.reserved_sectors as u32;
        let data_start = fat_start + boot.num_fats as u32 * sectors_per_fat;
        let root_cluster = boot.root_cluster;

        log::info!(
            "FAT32: mounted at LBA {} ({} sectors/cluster, root cluster {})",
            partition_lba,
            sectors_per_cluster,
            root_cluster
        );

        Some(Self {
            partition_lba,
            sectors_per_cluster: sectors_per_cluster as u32,
            fat_start,
            data_start,
            root_cluster,
        })
    }

    /// Absolute LBA of the first sector of `cluster`
    fn cluster_to_lba(&self, cluster: u32) -> u64 {
        self.partition_lba
            + self.data_start as u64
            + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// Follow the FAT chain one step. A FAT sector read failure is folded
    /// into end-of-chain.
    fn next_cluster<D: BlockDevice>(&self, disk: &mut D, cluster: u32) -> u32 {
        let byte_offset = cluster as u64 * 4;
        let lba = self.partition_lba + self.fat_start as u64 + byte_offset / SECTOR_SIZE as u64;

        let mut sector = [0u8; SECTOR_SIZE];
        if disk.read_block(lba, &mut sector).is_err() {
            log::warn!("FAT32: FAT read failed for cluster {}", cluster);
            return END_OF_CHAIN;
        }

        let offset = (byte_offset % SECTOR_SIZE as u64) as usize;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&sector[offset..offset + 4]);
        u32::from_le_bytes(raw) & FAT_ENTRY_MASK
    }

    /// Walk the root directory, reporting each short-name entry.
    ///
    /// Deleted entries and long-name continuations are skipped; a name byte
    /// of 0 ends the listing. `false` if a directory sector read fails.
    pub fn list_root<D, F>(&self, disk: &mut D, mut each: F) -> bool
    where
        D: BlockDevice,
        F: FnMut(&str),
    {
        self.scan_root(disk, |entry| {
            each(&unpack_short_name(&entry.name));
            None::<()>
        })
        .is_some()
    }

    /// Read the file named `name` (8.3 form) from the root directory into
    /// `buffer`.
    ///
    /// Returns the file's true size; if the buffer is smaller, the copy is
    /// silently truncated. `None` if the buffer is empty, the name is not
    /// found or a data sector read fails.
    pub fn read_file<D: BlockDevice>(
        &self,
        disk: &mut D,
        name: &str,
        buffer: &mut [u8],
    ) -> Option<u32> {
        if buffer.is_empty() {
            return None;
        }
        let target = pack_short_name(name)?;

        let entry = self.scan_root(disk, |entry| {
            if entry.name == target {
                Some(*entry)
            } else {
                None
            }
        })??;

        let file_size = entry.file_size;
        let to_copy = core::cmp::min(file_size as usize, buffer.len());

        let mut cluster = entry.first_cluster();
        let mut copied = 0usize;
        let mut sector = [0u8; SECTOR_SIZE];

        while copied < to_copy && (2..END_OF_CHAIN).contains(&cluster) {
            let lba = self.cluster_to_lba(cluster);
            for s in 0..self.sectors_per_cluster as u64 {
                if copied >= to_copy {
                    break;
                }
                if disk.read_block(lba + s, &mut sector).is_err() {
                    log::warn!("FAT32: data read failed for cluster {}", cluster);
                    return None;
                }
                let n = core::cmp::min(SECTOR_SIZE, to_copy - copied);
                buffer[copied..copied + n].copy_from_slice(&sector[..n]);
                copied += n;
            }
            cluster = self.next_cluster(disk, cluster);
        }

        Some(file_size)
    }

    /// Walk the root directory cluster chain entry by entry.
    ///
    /// `visit` may return `Some` to stop early with a result. The outer
    /// `Option` is `None` only on a read failure; a clean end of directory
    /// yields `Some(None)`.
    fn scan_root<D, T, F>(&self, disk: &mut D, mut visit: F) -> Option<Option<T>>
    where
        D: BlockDevice,
        F: FnMut(&DirectoryEntry) -> Option<T>,
    {
        let mut cluster = self.root_cluster;
        let mut sector = [0u8; SECTOR_SIZE];

        while (2..END_OF_CHAIN).contains(&cluster) {
            let lba = self.cluster_to_lba(cluster);
            for s in 0..self.sectors_per_cluster as u64 {
                if disk.read_block(lba + s, &mut sector).is_err() {
                    log::warn!("FAT32: directory read failed for cluster {}", cluster);
                    return None;
                }

                for raw in sector.chunks_exact(core::mem::size_of::<DirectoryEntry>()) {
                    let (entry, _) = DirectoryEntry::read_from_prefix(raw).ok()?;
                    match entry.name[0] {
                        0x00 => return Some(None),
                        ENTRY_DELETED => continue,
                        _ => {}
                    }
                    if entry.attr == ATTR_LONG_NAME {
                        continue;
                    }
                    if let Some(result) = visit(&entry) {
                        return Some(Some(result));
                    }
                }
            }
            cluster = self.next_cluster(disk, cluster);
        }

        Some(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::block::testing::RamDisk;
    use std::vec::Vec;

    const RESERVED: u32 = 32;
    const FAT_SECTORS: u32 = 8;
    // reserved + 2 FATs
    const DATA_START: u32 = RESERVED + 2 * FAT_SECTORS;

    fn boot_sector() -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[11..13].copy_from_slice(&512u16.to_le_bytes());
        sector[13] = 1; // sectors per cluster
        sector[14..16].copy_from_slice(&(RESERVED as u16).to_le_bytes());
        sector[16] = 2; // number of FATs
        sector[36..40].copy_from_slice(&FAT_SECTORS.to_le_bytes());
        sector[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        sector
    }

    fn dir_entry(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
        let mut entry = [0u8; 32];
        entry[0..11].copy_from_slice(name);
        entry[11] = attr;
        entry[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        entry[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        entry[28..32].copy_from_slice(&size.to_le_bytes());
        entry
    }

    fn fat_sector(entries: &[(u32, u32)]) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        for &(cluster, value) in entries {
            let offset = cluster as usize * 4;
            sector[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        sector
    }

    /// One-cluster root (cluster 2) with HELLO.TXT at cluster 3 and a
    /// 700-byte BIG.BIN spanning clusters 4 and 5.
    fn test_image() -> RamDisk {
        let mut disk = RamDisk::new(128);
        disk.write_at(0, &boot_sector());

        disk.write_at(
            RESERVED as u64,
            &fat_sector(&[
                (2, END_OF_CHAIN), // root directory
                (3, END_OF_CHAIN), // HELLO.TXT
                (4, 5),            // BIG.BIN, first cluster
                (5, END_OF_CHAIN), // BIG.BIN, second cluster
            ]),
        );

        let mut root = [0u8; SECTOR_SIZE];
        root[0..32].copy_from_slice(&dir_entry(b"HELLO   TXT", 0x20, 3, 11));
        // Deleted entry
        let mut deleted = dir_entry(b"OLD     TXT", 0x20, 9, 1);
        deleted[0] = ENTRY_DELETED;
        root[32..64].copy_from_slice(&deleted);
        // Long-name continuation
        root[64..96].copy_from_slice(&dir_entry(b"xxxxxxxxxxx", ATTR_LONG_NAME, 0, 0));
        root[96..128].copy_from_slice(&dir_entry(b"BIG     BIN", 0x20, 4, 700));
        disk.write_at(DATA_START as u64, &root);

        disk.write_at(DATA_START as u64 + 1, b"hello\nworld");
        disk.write_at(DATA_START as u64 + 2, &[0xA1; SECTOR_SIZE]);
        disk.write_at(DATA_START as u64 + 3, &[0xB2; 188]);

        disk
    }

    #[test]
    fn test_short_name_packing() {
        assert_eq!(pack_short_name("README.TXT"), Some(*b"README  TXT"));
        assert_eq!(pack_short_name("readme.txt"), Some(*b"README  TXT"));
        assert_eq!(pack_short_name("KERNEL8"), Some(*b"KERNEL8    "));
        assert_eq!(pack_short_name("TOOLONGNAME.TXT"), None);
        assert_eq!(pack_short_name("A.LONG"), None);
        assert_eq!(pack_short_name(""), None);
    }

    #[test]
    fn test_short_name_unpacking() {
        assert_eq!(unpack_short_name(b"README  TXT").as_str(), "README.TXT");
        // Blank extension: no trailing dot
        assert_eq!(unpack_short_name(b"KERNEL8    ").as_str(), "KERNEL8");
        assert_eq!(unpack_short_name(b"ABCDEFGHIJK").as_str(), "ABCDEFGH.IJK");
    }

    #[test]
    fn test_mount_validates_boot_sector() {
        let mut disk = test_image();
        assert!(Fat32Volume::mount(&mut disk, 0).is_some());

        // Wrong sector size
        let mut bad = boot_sector();
        bad[11..13].copy_from_slice(&4096u16.to_le_bytes());
        disk.write_at(0, &bad);
        assert!(Fat32Volume::mount(&mut disk, 0).is_none());

        // Zero sectors per cluster
        let mut bad = boot_sector();
        bad[13] = 0;
        disk.write_at(0, &bad);
        assert!(Fat32Volume::mount(&mut disk, 0).is_none());

        // Zero FAT size (not FAT32)
        let mut bad = boot_sector();
        bad[36..40].copy_from_slice(&0u32.to_le_bytes());
        disk.write_at(0, &bad);
        assert!(Fat32Volume::mount(&mut disk, 0).is_none());
    }

    #[test]
    fn test_list_root_skips_deleted_and_long_names() {
        let mut disk = test_image();
        let volume = Fat32Volume::mount(&mut disk, 0).unwrap();

        let mut names: Vec<std::string::String> = Vec::new();
        assert!(volume.list_root(&mut disk, |name| names.push(name.into())));
        assert_eq!(names, ["HELLO.TXT", "BIG.BIN"]);
    }

    #[test]
    fn test_read_file() {
        let mut disk = test_image();
        let volume = Fat32Volume::mount(&mut disk, 0).unwrap();

        let mut buffer = [0u8; 64];
        let size = volume.read_file(&mut disk, "HELLO.TXT", &mut buffer).unwrap();
        assert_eq!(size, 11);
        assert_eq!(&buffer[..11], b"hello\nworld");

        // Lookup is case-insensitive via 8.3 normalization
        assert_eq!(
            volume.read_file(&mut disk, "hello.txt", &mut buffer),
            Some(11)
        );

        assert_eq!(volume.read_file(&mut disk, "MISSING.TXT", &mut buffer), None);
    }

    #[test]
    fn test_read_file_truncates_silently() {
        let mut disk = test_image();
        let volume = Fat32Volume::mount(&mut disk, 0).unwrap();

        let mut buffer = [0u8; 4];
        // True size reported even though only 4 bytes fit
        let size = volume.read_file(&mut disk, "HELLO.TXT", &mut buffer).unwrap();
        assert_eq!(size, 11);
        assert_eq!(&buffer, b"hell");

        // An empty buffer is rejected rather than reporting a size
        assert_eq!(volume.read_file(&mut disk, "HELLO.TXT", &mut []), None);
    }

    #[test]
    fn test_read_file_follows_cluster_chain() {
        let mut disk = test_image();
        let volume = Fat32Volume::mount(&mut disk, 0).unwrap();

        let mut buffer = [0u8; 1024];
        let size = volume.read_file(&mut disk, "BIG.BIN", &mut buffer).unwrap();
        assert_eq!(size, 700);
        assert_eq!(buffer[0], 0xA1);
        assert_eq!(buffer[511], 0xA1);
        assert_eq!(buffer[512], 0xB2);
        assert_eq!(buffer[699], 0xB2);
    }

    #[test]
    fn test_fat_entries_are_masked_to_28_bits() {
        let mut disk = test_image();
        // Upper reserved nibble set on HELLO.TXT's chain entry
        disk.write_at(
            RESERVED as u64,
            &fat_sector(&[(2, END_OF_CHAIN), (3, 0xFFFF_FFFF), (4, 5), (5, END_OF_CHAIN)]),
        );
        let volume = Fat32Volume::mount(&mut disk, 0).unwrap();
        assert_eq!(volume.next_cluster(&mut disk, 3), 0x0FFF_FFFF);
    }
}
