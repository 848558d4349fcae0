//! Open files and directories: cursors, seek and data transfer.

use std::ops::{Deref, DerefMut};

use log::trace;

use super::dir::{Located, RawDirEntry, SlotRef, ATTR_DIRECTORY};
use super::{BlockDev, FatError, FatResult, Volume, SECTOR_SIZE};

// ─── Public types ──────────────────────────────────────────────────────────────

/// Access mode of an open node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Regular,
    Directory,
}

/// Position inside a cluster chain.
///
/// `offset` is a byte offset within `cluster`, in `0..=cluster_size`. The
/// value `cluster_size` only occurs on the last cluster of a chain, when the
/// cursor sits exactly at its end. `cluster < 2` means no cluster is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClusterPos {
    pub cluster: u32,
    pub offset:  u32,
}

/// Directory-entry metadata as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub size:          u32,
    pub kind:          NodeKind,
    pub attributes:    u8,
    pub first_cluster: u32,
}

/// In-memory copy of a node's directory entry.
#[derive(Debug, Clone)]
pub(crate) struct NodeEntry {
    pub name:          String,
    pub attr:          u8,
    pub first_cluster: u32,
    pub size:          u32,
    /// `None` for the root directory, which has no entry.
    pub slot:          Option<SlotRef>,
    pub lfn_slots:     Vec<SlotRef>,
}

impl NodeEntry {
    fn root(cluster: u32) -> Self {
        Self {
            name: "/".to_string(),
            attr: ATTR_DIRECTORY,
            first_cluster: cluster,
            size: 0,
            slot: None,
            lfn_slots: Vec::new(),
        }
    }
}

impl From<Located> for NodeEntry {
    fn from(loc: Located) -> Self {
        Self {
            name:          loc.name,
            attr:          loc.raw.attr(),
            first_cluster: loc.raw.cluster(),
            size:          loc.raw.size(),
            slot:          Some(loc.slot),
            lfn_slots:     loc.lfn_slots,
        }
    }
}

/// One open file or directory.
///
/// A node does not borrow its volume; every operation takes the volume
/// explicitly, so a node must only be used with the volume that opened it.
#[derive(Debug)]
pub struct Node {
    pub(crate) mode:       Mode,
    pub(crate) pos:        ClusterPos,
    pub(crate) abs_offset: u64,
    pub(crate) entry:      NodeEntry,
    /// First cluster or size changed since the last `update_file`.
    pub(crate) dirty:      bool,
}

impl Node {
    fn new(entry: NodeEntry, mode: Mode) -> Self {
        Self {
            mode,
            pos: ClusterPos { cluster: entry.first_cluster, offset: 0 },
            abs_offset: 0,
            entry,
            dirty: false,
        }
    }

    pub fn name(&self) -> &str { &self.entry.name }

    pub fn mode(&self) -> Mode { self.mode }

    /// Logical size in bytes, including unpersisted writes.
    pub fn size(&self) -> u32 { self.entry.size }

    pub fn first_cluster(&self) -> u32 { self.entry.first_cluster }

    pub fn is_dir(&self) -> bool { self.entry.attr & ATTR_DIRECTORY != 0 }

    pub fn kind(&self) -> NodeKind {
        if self.is_dir() { NodeKind::Directory } else { NodeKind::Regular }
    }

    /// Byte offset from the start of the file where the next transfer happens.
    pub fn offset(&self) -> u64 { self.abs_offset }

    /// Record `n` bytes consumed through [`Node::cluster_pos_mut`].
    pub fn advance(&mut self, n: u64) { self.abs_offset += n; }

    pub fn cluster_pos(&self) -> ClusterPos { self.pos }

    pub fn cluster_pos_mut(&mut self) -> &mut ClusterPos { &mut self.pos }

    /// Switch to `mode` until the returned guard is dropped.
    pub fn override_mode(&mut self, mode: Mode) -> ModeGuard<'_> {
        let saved = self.mode;
        self.mode = mode;
        ModeGuard { node: self, saved }
    }
}

/// Restores a node's previous mode when dropped. See [`Node::override_mode`].
pub struct ModeGuard<'a> {
    node:  &'a mut Node,
    saved: Mode,
}

impl Deref for ModeGuard<'_> {
    type Target = Node;
    fn deref(&self) -> &Node { &*self.node }
}

impl DerefMut for ModeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Node { &mut *self.node }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.node.mode = self.saved;
    }
}

// ─── Implementation ────────────────────────────────────────────────────────────

impl<D: BlockDev> Volume<D> {
    /// Open the file or directory at `path`, positioned at offset 0.
    pub fn open(&mut self, path: &str, mode: Mode) -> FatResult<Node> {
        if mode == Mode::ReadWrite {
            self.check_writable()?;
        }
        let entry = match self.resolve(path)? {
            None => NodeEntry::root(self.root_cluster),
            Some(loc) => NodeEntry::from(loc),
        };
        trace!("fat32: open {path:?} -> cluster {} size {}", entry.first_cluster, entry.size);
        Ok(Node::new(entry, mode))
    }

    /// Re-read the node's directory entry from disk.
    pub fn stat(&mut self, node: &Node) -> FatResult<NodeStat> {
        let Some(slot) = node.entry.slot else {
            return Ok(NodeStat {
                size: 0,
                kind: NodeKind::Directory,
                attributes: ATTR_DIRECTORY,
                first_cluster: self.root_cluster,
            });
        };
        let raw = RawDirEntry::parse(&self.read_slot(slot)?);
        if raw.is_deleted() {
            return Err(FatError::not_found(node.name()));
        }
        Ok(NodeStat {
            size: raw.size(),
            kind: if raw.is_dir() { NodeKind::Directory } else { NodeKind::Regular },
            attributes: raw.attr(),
            first_cluster: raw.cluster(),
        })
    }

    /// Move the cursor to `offset`, clamped to the file size.
    ///
    /// Returns the offset actually reached; callers that need an exact
    /// position compare it against the request.
    ///
    /// A forward seek continues from the cursor, so `advance` must have
    /// accounted for any bytes moved through [`Node::cluster_pos_mut`].
    pub fn seek(&mut self, node: &mut Node, offset: u64) -> FatResult<u64> {
        let target = offset.min(node.size() as u64);
        let cs = self.cluster_size() as u64;
        let first = node.first_cluster();
        if first < 2 {
            if target > 0 {
                return Err(FatError::BadCluster(first));
            }
            node.pos = ClusterPos::default();
            node.abs_offset = 0;
            return Ok(0);
        }

        // Walk forward from the cursor when it is at or before the target.
        let (mut pos, mut remaining) = if node.pos.cluster >= 2 && node.abs_offset <= target {
            let base = node.pos.offset as u64;
            (ClusterPos { cluster: node.pos.cluster, offset: 0 }, target - node.abs_offset + base)
        } else {
            (ClusterPos { cluster: first, offset: 0 }, target)
        };
        while remaining >= cs {
            match self.next_cluster(pos.cluster)? {
                Some(next) => pos.cluster = next,
                None if remaining == cs => pos.offset = cs as u32,
                None => return Err(FatError::BadCluster(pos.cluster)),
            }
            remaining -= cs;
        }
        pos.offset += remaining as u32;

        node.pos = pos;
        node.abs_offset = target;
        Ok(target)
    }

    /// Read from the chain at `pos` until `buf` is full or the chain ends.
    ///
    /// Not bounded by any file size, and only `pos` moves; callers clamp
    /// the request and account for the transferred bytes.
    pub fn read_data(&mut self, pos: &mut ClusterPos, buf: &mut [u8]) -> FatResult<usize> {
        let cs = self.cluster_size();
        let mut done = 0;
        while done < buf.len() && pos.cluster >= 2 {
            if pos.offset >= cs {
                match self.next_cluster(pos.cluster)? {
                    Some(next) => *pos = ClusterPos { cluster: next, offset: 0 },
                    None => break,
                }
            }
            let lba = self.cluster_to_lba(pos.cluster) + (pos.offset as usize / SECTOR_SIZE) as u64;
            let in_sec = pos.offset as usize % SECTOR_SIZE;
            let n = (SECTOR_SIZE - in_sec).min(buf.len() - done);

            let mut sec = [0u8; SECTOR_SIZE];
            self.read_sector(lba, &mut sec)?;
            buf[done..done + n].copy_from_slice(&sec[in_sec..in_sec + n]);
            done += n;
            pos.offset += n as u32;
        }
        Ok(done)
    }

    /// Write `buf` at the node's cursor, allocating clusters as needed.
    ///
    /// Advances the cursor and grows the in-memory size; nothing reaches the
    /// directory entry until [`Volume::update_file`]. Returns a short count
    /// when the volume fills up.
    pub fn write_data(&mut self, node: &mut Node, buf: &[u8]) -> FatResult<usize> {
        self.check_writable()?;
        if node.mode != Mode::ReadWrite {
            return Err(FatError::NotWritable(node.name().to_string()));
        }
        if node.is_dir() {
            return Err(FatError::IsADirectory(node.name().to_string()));
        }
        if node.abs_offset + buf.len() as u64 > u32::MAX as u64 {
            return Err(FatError::FileTooLarge);
        }

        let cs = self.cluster_size();
        let mut done = 0;
        while done < buf.len() {
            if node.pos.cluster < 2 {
                let cluster = match self.alloc_cluster() {
                    Ok(c) => c,
                    Err(FatError::NoSpace) => break,
                    Err(e) => return Err(e),
                };
                node.entry.first_cluster = cluster;
                node.pos = ClusterPos { cluster, offset: 0 };
                node.dirty = true;
            } else if node.pos.offset >= cs {
                let next = match self.next_cluster(node.pos.cluster)? {
                    Some(next) => next,
                    None => match self.extend_chain(node.pos.cluster) {
                        Ok(c) => c,
                        Err(FatError::NoSpace) => break,
                        Err(e) => return Err(e),
                    },
                };
                node.pos = ClusterPos { cluster: next, offset: 0 };
            }

            let lba = self.cluster_to_lba(node.pos.cluster) + (node.pos.offset as usize / SECTOR_SIZE) as u64;
            let in_sec = node.pos.offset as usize % SECTOR_SIZE;
            let n = (SECTOR_SIZE - in_sec).min(buf.len() - done);

            let mut sec = [0u8; SECTOR_SIZE];
            if n < SECTOR_SIZE {
                self.read_sector(lba, &mut sec)?;
            }
            sec[in_sec..in_sec + n].copy_from_slice(&buf[done..done + n]);
            self.write_sector(lba, &sec)?;

            done += n;
            node.pos.offset += n as u32;
            node.abs_offset += n as u64;
            if node.abs_offset > node.entry.size as u64 {
                node.entry.size = node.abs_offset as u32;
                node.dirty = true;
            }
        }
        if done < buf.len() {
            trace!("fat32: volume full after {done} of {} bytes", buf.len());
        }
        Ok(done)
    }

    /// Persist the node's first cluster and size, then the dirty FAT sectors.
    pub fn update_file(&mut self, node: &mut Node) -> FatResult<()> {
        self.check_writable()?;
        if let (Some(slot), true) = (node.entry.slot, node.dirty) {
            let mut bytes = self.read_slot(slot)?;
            let cluster = node.entry.first_cluster;
            bytes[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
            bytes[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
            bytes[28..32].copy_from_slice(&node.entry.size.to_le_bytes());
            self.write_slot(slot, &bytes)?;
            node.dirty = false;
        }
        self.flush_fat()
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
