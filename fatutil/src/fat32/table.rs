//! FAT table operations: cached entries, cluster allocation, chain management.

use log::trace;

use super::{
    BlockDev, FatError, FatResult, Volume, ENTRIES_PER_FAT_SECTOR, FAT32_EOC, FAT32_EOC_MARK,
    FAT32_MASK, SECTOR_SIZE,
};

impl<D: BlockDev> Volume<D> {
    /// True for any end-of-chain marker.
    pub fn is_eoc(&self, cluster: u32) -> bool {
        cluster & FAT32_MASK >= FAT32_EOC
    }

    /// True when `cluster` is not an allocated data cluster: either no
    /// cluster at all (`< 2`) or one whose FAT entry is free.
    pub fn is_free(&self, cluster: u32) -> bool {
        match cluster {
            c if c < 2 => true,
            c if !self.in_data_area(c) => false,
            c => self.fat[c as usize] & FAT32_MASK == 0,
        }
    }

    fn in_data_area(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.total_clusters + 2
    }

    pub(crate) fn fat_entry(&self, cluster: u32) -> FatResult<u32> {
        if !self.in_data_area(cluster) {
            return Err(FatError::BadCluster(cluster));
        }
        Ok(self.fat[cluster as usize] & FAT32_MASK)
    }

    pub(crate) fn set_fat_entry(&mut self, cluster: u32, next: u32) -> FatResult<()> {
        if !self.in_data_area(cluster) {
            return Err(FatError::BadCluster(cluster));
        }
        let slot = &mut self.fat[cluster as usize];
        let was_free = *slot & FAT32_MASK == 0;
        *slot = (*slot & !FAT32_MASK) | (next & FAT32_MASK);
        let is_free = next & FAT32_MASK == 0;
        match (was_free, is_free) {
            (true, false) => self.free_clusters -= 1,
            (false, true) => self.free_clusters += 1,
            _ => {}
        }
        self.dirty_fat.insert(cluster / ENTRIES_PER_FAT_SECTOR);
        Ok(())
    }

    /// Follow the chain one step. `None` at end-of-chain.
    pub(crate) fn next_cluster(&self, cluster: u32) -> FatResult<Option<u32>> {
        let next = self.fat_entry(cluster)?;
        if self.is_eoc(next) {
            return Ok(None);
        }
        if !self.in_data_area(next) || self.is_free(next) {
            return Err(FatError::BadCluster(cluster));
        }
        Ok(Some(next))
    }

    /// Last cluster of the chain starting at `start`.
    #[cfg(test)]
    pub(crate) fn last_cluster(&self, start: u32) -> FatResult<u32> {
        let mut cluster = start;
        let mut hops = 0u32;
        while let Some(next) = self.next_cluster(cluster)? {
            cluster = next;
            hops += 1;
            if hops > self.total_clusters {
                return Err(FatError::BadCluster(start));
            }
        }
        Ok(cluster)
    }

    /// Allocate a free cluster, mark it as end-of-chain and zero its data.
    pub(crate) fn alloc_cluster(&mut self) -> FatResult<u32> {
        self.check_writable()?;
        let first = self.total_clusters + 2;
        let start = self.next_free.clamp(2, first - 1);
        let found = (start..first)
            .chain(2..start)
            .find(|&c| self.fat[c as usize] & FAT32_MASK == 0)
            .ok_or(FatError::NoSpace)?;

        self.set_fat_entry(found, FAT32_EOC_MARK)?;
        self.next_free = if found + 1 < first { found + 1 } else { 2 };
        self.zero_cluster(found)?;
        trace!("fat32: allocated cluster {found}");
        Ok(found)
    }

    /// Append a fresh cluster after `tail`, which must end its chain.
    pub(crate) fn extend_chain(&mut self, tail: u32) -> FatResult<u32> {
        let new = self.alloc_cluster()?;
        if let Err(e) = self.set_fat_entry(tail, new) {
            self.set_fat_entry(new, 0)?;
            return Err(e);
        }
        Ok(new)
    }

    /// Free an entire cluster chain starting at `start`.
    pub(crate) fn free_chain(&mut self, start: u32) -> FatResult<()> {
        if start < 2 {
            return Ok(());
        }
        let mut cluster = start;
        let mut freed = 0u32;
        loop {
            let next = self.fat_entry(cluster)?;
            self.set_fat_entry(cluster, 0)?;
            freed += 1;
            if self.is_eoc(next) || next < 2 || freed > self.total_clusters {
                break;
            }
            cluster = next;
        }
        if start < self.next_free {
            self.next_free = start;
        }
        trace!("fat32: freed {freed} clusters from {start}");
        Ok(())
    }

    fn zero_cluster(&mut self, cluster: u32) -> FatResult<()> {
        let lba = self.cluster_to_lba(cluster);
        let zeros = [0u8; SECTOR_SIZE];
        for s in 0..self.sectors_per_clus {
            self.write_sector(lba + s as u64, &zeros)?;
        }
        Ok(())
    }

    /// Write every dirty FAT sector to all FAT copies.
    pub(crate) fn flush_fat(&mut self) -> FatResult<()> {
        self.check_writable()?;
        let dirty = std::mem::take(&mut self.dirty_fat);
        for &fat_sec in &dirty {
            let first = (fat_sec * ENTRIES_PER_FAT_SECTOR) as usize;
            let mut sec = [0u8; SECTOR_SIZE];
            for (chunk, entry) in sec.chunks_exact_mut(4).zip(&self.fat[first..]) {
                chunk.copy_from_slice(&entry.to_le_bytes());
            }
            for copy in 0..self.num_fats {
                let lba = (self.reserved_sectors + copy * self.fat_size + fat_sec) as u64;
                if let Err(e) = self.write_sector(lba, &sec) {
                    self.dirty_fat.extend(&dirty);
                    return Err(e);
                }
            }
        }
        if !dirty.is_empty() {
            trace!("fat32: wrote {} FAT sectors x{}", dirty.len(), self.num_fats);
        }
        Ok(())
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
