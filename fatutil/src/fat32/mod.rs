//! Read/write FAT32 volume engine.
//!
//! Assumes the FAT32 volume starts at LBA 0 (raw image, no MBR) and uses
//! 512-byte sectors. Long filenames are decoded on read; names created by the
//! engine are 8.3 only.
//!
//! All disk I/O is abstracted behind [`BlockDev`], so the engine runs against
//! an image file or an in-memory buffer alike.
//!
//! Submodules:
//! - [`blockdev`]: sector-level device abstraction
//! - `table`: FAT cache, cluster allocation and chain management
//! - `dir`: directory entries, lookup, creation and deletion
//! - `node`: open files/directories, seek and data transfer
//! - `path`: parent/leaf splitting

pub mod blockdev;
mod dir;
mod error;
mod node;
mod path;
mod table;

use std::collections::BTreeSet;

use log::{debug, info};

pub use blockdev::{BlockDev, SECTOR_SIZE};
pub use dir::DirEntry;
pub use error::{FatError, FatResult};
pub use node::{ClusterPos, Mode, ModeGuard, Node, NodeKind, NodeStat};
pub use path::{dirname, filename, ROOT};

// ─── Constants ─────────────────────────────────────────────────────────────────

const FAT32_EOC:      u32 = 0x0FFF_FFF8;
const FAT32_EOC_MARK: u32 = 0x0FFF_FFFF;
const FAT32_MASK:     u32 = 0x0FFF_FFFF;
const ENTRIES_PER_FAT_SECTOR: u32 = (SECTOR_SIZE / 4) as u32;

const FSINFO_LEAD_SIG:   u32 = 0x4161_5252;
const FSINFO_STRUCT_SIG: u32 = 0x6141_7272;
const FSINFO_UNKNOWN:    u32 = 0xFFFF_FFFF;

// ─── BPB (BIOS Parameter Block) ───────────────────────────────────────────────

/// The boot-sector fields the engine needs, decoded little-endian.
struct Bpb {
    bytes_per_sector:  u16,
    sectors_per_clus:  u8,
    reserved_sectors:  u16,
    num_fats:          u8,
    root_entry_count:  u16,
    total_sectors_16:  u16,
    fat_size_16:       u16,
    total_sectors_32:  u32,
    // FAT32 extension
    fat_size_32:       u32,
    root_cluster:      u32,
    fs_info:           u16,
    volume_id:         u32,
}

impl Bpb {
    fn parse(sec: &[u8; SECTOR_SIZE]) -> FatResult<Self> {
        if sec[510] != 0x55 || sec[511] != 0xAA {
            return Err(FatError::NotFat32("missing boot signature"));
        }
        let u16_at = |off: usize| u16::from_le_bytes([sec[off], sec[off + 1]]);
        let u32_at = |off: usize| u32::from_le_bytes([sec[off], sec[off + 1], sec[off + 2], sec[off + 3]]);
        Ok(Self {
            bytes_per_sector: u16_at(11),
            sectors_per_clus: sec[13],
            reserved_sectors: u16_at(14),
            num_fats:         sec[16],
            root_entry_count: u16_at(17),
            total_sectors_16: u16_at(19),
            fat_size_16:      u16_at(22),
            total_sectors_32: u32_at(32),
            fat_size_32:      u32_at(36),
            root_cluster:     u32_at(44),
            fs_info:          u16_at(48),
            volume_id:        u32_at(67),
        })
    }
}

// ─── Public types ──────────────────────────────────────────────────────────────

/// Whether a volume may be modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Volume-level usage figures, in clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub volume_id:   u32,
    /// Cluster size in bytes.
    pub block_size:  u32,
    /// Total sectors of the volume expressed in clusters.
    pub blocks:      u64,
    pub free_blocks: u64,
}

/// One open FAT32 image.
///
/// Created by [`Volume::partition_init`] and consumed by [`Volume::finalize`],
/// which writes back the cached FAT and the FSInfo sector.
pub struct Volume<D> {
    disk:              D,
    access:            Access,
    volume_id:         u32,
    reserved_sectors:  u32,
    num_fats:          u32,
    fat_size:          u32,
    sectors_per_clus:  u32,
    root_cluster:      u32,
    first_data_sector: u32,
    total_sectors:     u32,
    /// Number of data clusters; valid cluster numbers are `2..total_clusters + 2`.
    total_clusters:    u32,
    fs_info_sector:    Option<u32>,
    /// Raw first-FAT contents, one entry per cluster.
    fat:               Vec<u32>,
    /// FAT sector indices (relative to the FAT start) changed since the last flush.
    dirty_fat:         BTreeSet<u32>,
    free_clusters:     u32,
    next_free:         u32,
}

// ─── Implementation ────────────────────────────────────────────────────────────

impl<D: BlockDev> Volume<D> {
    /// Mount a FAT32 volume: parse the BPB from sector 0, compute layout
    /// constants and cache the first FAT.
    pub fn partition_init(mut disk: D, access: Access) -> FatResult<Self> {
        let mut sec = [0u8; SECTOR_SIZE];
        disk.read(0, &mut sec)?;
        let bpb = Bpb::parse(&sec)?;

        if bpb.bytes_per_sector as usize != SECTOR_SIZE {
            return Err(FatError::NotFat32("unsupported sector size"));
        }
        if bpb.sectors_per_clus == 0 || !bpb.sectors_per_clus.is_power_of_two() {
            return Err(FatError::NotFat32("invalid sectors per cluster"));
        }
        // FAT12/FAT16 have fat_size_16 != 0 and a fixed root directory; only FAT32 is supported.
        if bpb.fat_size_16 != 0 || bpb.root_entry_count != 0 {
            return Err(FatError::NotFat32("FAT12/FAT16 volumes are not supported"));
        }
        if bpb.fat_size_32 == 0 || bpb.num_fats == 0 {
            return Err(FatError::NotFat32("invalid FAT size"));
        }

        let reserved_sectors  = bpb.reserved_sectors as u32;
        let num_fats          = bpb.num_fats as u32;
        let fat_size          = bpb.fat_size_32;
        let sectors_per_clus  = bpb.sectors_per_clus as u32;
        let total_sectors     = if bpb.total_sectors_16 != 0 {
            bpb.total_sectors_16 as u32
        } else {
            bpb.total_sectors_32
        };
        let first_data_sector = reserved_sectors + num_fats * fat_size;
        if total_sectors <= first_data_sector {
            return Err(FatError::NotFat32("no data region"));
        }
        let total_clusters = ((total_sectors - first_data_sector) / sectors_per_clus)
            .min(fat_size * ENTRIES_PER_FAT_SECTOR - 2);
        if bpb.root_cluster < 2 || bpb.root_cluster >= total_clusters + 2 {
            return Err(FatError::NotFat32("root cluster out of range"));
        }

        let mut fat = Vec::with_capacity((fat_size * ENTRIES_PER_FAT_SECTOR) as usize);
        for s in 0..fat_size {
            disk.read((reserved_sectors + s) as u64, &mut sec)?;
            fat.extend(sec.chunks_exact(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])));
        }
        let free_clusters = (2..total_clusters + 2)
            .filter(|&c| fat[c as usize] & FAT32_MASK == 0)
            .count() as u32;

        let fs_info_sector = match bpb.fs_info as u32 {
            0 | 0xFFFF => None,
            s if s >= reserved_sectors => None,
            s => Some(s),
        };
        let mut next_free = 2;
        if let Some(s) = fs_info_sector {
            disk.read(s as u64, &mut sec)?;
            if fsinfo_valid(&sec) {
                let hint = u32::from_le_bytes([sec[492], sec[493], sec[494], sec[495]]);
                if hint >= 2 && hint < total_clusters + 2 {
                    next_free = hint;
                }
            }
        }

        info!(
            "fat32: mounted volume {:08X}: {} clusters of {} bytes, {} free",
            bpb.volume_id, total_clusters, sectors_per_clus as usize * SECTOR_SIZE, free_clusters,
        );
        debug!(
            "fat32: reserved={} fats={}x{} data={} root_cluster={}",
            reserved_sectors, num_fats, fat_size, first_data_sector, bpb.root_cluster,
        );

        Ok(Self {
            disk, access, volume_id: bpb.volume_id, reserved_sectors, num_fats, fat_size,
            sectors_per_clus, root_cluster: bpb.root_cluster, first_data_sector, total_sectors,
            total_clusters, fs_info_sector, fat, dirty_fat: BTreeSet::new(), free_clusters, next_free,
        })
    }

    /// Write back every pending metadata change and release the volume,
    /// returning the underlying device.
    pub fn finalize(mut self) -> FatResult<D> {
        self.flush()?;
        info!("fat32: volume {:08X} finalized", self.volume_id);
        Ok(self.disk)
    }

    /// Write the dirty FAT sectors and the FSInfo sector, then flush the device.
    pub fn flush(&mut self) -> FatResult<()> {
        if self.access == Access::ReadOnly {
            return Ok(());
        }
        self.flush_fat()?;
        self.write_fs_info()?;
        self.disk.flush()?;
        Ok(())
    }

    pub fn volume_id(&self) -> u32 { self.volume_id }

    pub fn root_cluster(&self) -> u32 { self.root_cluster }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> u32 {
        self.sectors_per_clus * SECTOR_SIZE as u32
    }

    /// Free-space and capacity figures for the whole volume.
    pub fn statvfs(&self) -> VolumeStats {
        VolumeStats {
            volume_id:   self.volume_id,
            block_size:  self.cluster_size(),
            blocks:      (self.total_sectors / self.sectors_per_clus) as u64,
            free_blocks: self.free_clusters as u64,
        }
    }

    // ─── Private helpers ───────────────────────────────────────────────────────

    fn check_writable(&self) -> FatResult<()> {
        match self.access {
            Access::ReadWrite => Ok(()),
            Access::ReadOnly => Err(FatError::ReadOnly),
        }
    }

    fn cluster_to_lba(&self, cluster: u32) -> u64 {
        self.first_data_sector as u64 + (cluster as u64 - 2) * self.sectors_per_clus as u64
    }

    fn read_sector(&mut self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> FatResult<()> {
        self.disk.read(lba, buf)?;
        Ok(())
    }

    fn write_sector(&mut self, lba: u64, buf: &[u8; SECTOR_SIZE]) -> FatResult<()> {
        self.disk.write(lba, buf)?;
        Ok(())
    }

    fn write_fs_info(&mut self) -> FatResult<()> {
        let Some(s) = self.fs_info_sector else { return Ok(()) };
        let mut sec = [0u8; SECTOR_SIZE];
        self.read_sector(s as u64, &mut sec)?;
        if !fsinfo_valid(&sec) {
            return Ok(());
        }
        sec[488..492].copy_from_slice(&self.free_clusters.to_le_bytes());
        let hint = if self.free_clusters == 0 { FSINFO_UNKNOWN } else { self.next_free };
        sec[492..496].copy_from_slice(&hint.to_le_bytes());
        self.write_sector(s as u64, &sec)
    }
}

fn fsinfo_valid(sec: &[u8; SECTOR_SIZE]) -> bool {
    let u32_at = |off: usize| u32::from_le_bytes([sec[off], sec[off + 1], sec[off + 2], sec[off + 3]]);
    u32_at(0) == FSINFO_LEAD_SIG && u32_at(484) == FSINFO_STRUCT_SIG
}

// ─── Test helpers ──────────────────────────────────────────────────────────────

/// In-memory images shared by the unit tests of every layer.
#[cfg(test)]
pub(crate) mod testutil {
    use std::io::{Cursor, Read, Write};

    pub type MemDisk = Cursor<Vec<u8>>;

    /// Create an in-memory FAT32 image using the `fatfs` std crate.
    ///
    /// The disk must be large enough that `determine_fs_geometry` selects FAT32.
    /// With the `Fat32` type hint, `fatfs` uses 512 bytes/cluster. FAT32 requires
    /// ≥65 525 data clusters, so the minimum disk size is ~34 MB. We use 40 MB.
    pub fn make_disk() -> MemDisk {
        const SIZE: usize = 40 * 1024 * 1024;
        let mut cursor = Cursor::new(vec![0u8; SIZE]);
        fatfs::format_volume(
            &mut cursor,
            fatfs::FormatVolumeOptions::new().fat_type(fatfs::FatType::Fat32),
        ).expect("format_volume failed");
        cursor.set_position(0);
        cursor
    }

    /// Write a file to the disk via `fatfs` (std) and return the disk.
    pub fn disk_with_file(name: &str, content: &[u8]) -> MemDisk {
        let mut disk = make_disk();
        {
            let fs = fatfs::FileSystem::new(&mut disk, fatfs::FsOptions::new())
                .expect("FileSystem::new failed");
            let mut f = fs.root_dir().create_file(name).expect("create_file failed");
            f.truncate().unwrap();
            f.write_all(content).unwrap();
        }
        disk
    }

    /// Read a file from the disk via `fatfs` (std) and return its contents.
    pub fn read_via_fatfs(disk: &mut MemDisk, path: &str) -> Vec<u8> {
        disk.set_position(0);
        let fs = fatfs::FileSystem::new(&mut *disk, fatfs::FsOptions::new()).unwrap();
        let mut f = fs.root_dir().open_file(path).unwrap();
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).unwrap();
        buf
    }

    /// Names in a directory as `fatfs` sees them, without `.` and `..`.
    pub fn list_via_fatfs(disk: &mut MemDisk, path: &str) -> Vec<String> {
        disk.set_position(0);
        let fs = fatfs::FileSystem::new(&mut *disk, fatfs::FsOptions::new()).unwrap();
        let root = fs.root_dir();
        let dir = if path == "/" { root } else { root.open_dir(path).unwrap() };
        dir.iter()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n != "." && n != "..")
            .collect()
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
