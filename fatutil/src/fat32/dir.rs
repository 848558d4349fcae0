//! Directory operations: entry decoding, lookup, iteration, creation and deletion.

use log::debug;

use super::node::{ClusterPos, Mode, Node, NodeEntry, NodeKind};
use super::path::components;
use super::{BlockDev, FatError, FatResult, Volume, SECTOR_SIZE};

// ─── Constants ─────────────────────────────────────────────────────────────────

const ATTR_VOLUME_ID: u8 = 0x08;
pub(crate) const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_ARCHIVE:   u8 = 0x20;
const ATTR_LFN:       u8 = 0x0F;

const SLOT_END:  u8 = 0x00;
const SLOT_FREE: u8 = 0xE5;

/// NT case flags: base / extension stored upper-case but displayed lower-case.
const CASE_LOWER_BASE: u8 = 0x08;
const CASE_LOWER_EXT:  u8 = 0x10;

/// 1980-01-01, the earliest FAT date.
const FAT_EPOCH_DATE: u16 = (1 << 5) | 1;

pub(crate) const DIR_ENTRY_SIZE: usize = 32;

const SHORT_NAME_SPECIALS: &[u8] = b"!#$%&'()-@^_`{}~";

// ─── Raw directory entry (32 bytes) ────────────────────────────────────────────

/// Where one 32-byte slot lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotRef {
    pub lba:    u64,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RawDirEntry {
    name:       [u8; 11],
    attr:       u8,
    nt_case:    u8,
    cluster_hi: u16,
    cluster_lo: u16,
    size:       u32,
}

impl RawDirEntry {
    pub(crate) fn parse(b: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&b[..11]);
        Self {
            name,
            attr:       b[11],
            nt_case:    b[12],
            cluster_hi: u16::from_le_bytes([b[20], b[21]]),
            cluster_lo: u16::from_le_bytes([b[26], b[27]]),
            size:       u32::from_le_bytes([b[28], b[29], b[30], b[31]]),
        }
    }

    fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut b = [0u8; DIR_ENTRY_SIZE];
        b[..11].copy_from_slice(&self.name);
        b[11] = self.attr;
        b[12] = self.nt_case;
        // creation, access and write dates
        b[16..18].copy_from_slice(&FAT_EPOCH_DATE.to_le_bytes());
        b[18..20].copy_from_slice(&FAT_EPOCH_DATE.to_le_bytes());
        b[24..26].copy_from_slice(&FAT_EPOCH_DATE.to_le_bytes());
        b[20..22].copy_from_slice(&self.cluster_hi.to_le_bytes());
        b[26..28].copy_from_slice(&self.cluster_lo.to_le_bytes());
        b[28..32].copy_from_slice(&self.size.to_le_bytes());
        b
    }

    fn new(name: [u8; 11], nt_case: u8, attr: u8, cluster: u32) -> Self {
        Self {
            name, attr, nt_case,
            cluster_hi: (cluster >> 16) as u16,
            cluster_lo: cluster as u16,
            size: 0,
        }
    }

    fn is_lfn(&self) -> bool       { self.attr & ATTR_LFN == ATTR_LFN }
    fn is_volume_id(&self) -> bool { self.attr & ATTR_VOLUME_ID != 0 && !self.is_lfn() }
    fn is_dot(&self) -> bool       { self.name[0] == b'.' }
    pub fn is_deleted(&self) -> bool { self.name[0] == SLOT_FREE || self.name[0] == SLOT_END }
    pub fn is_dir(&self) -> bool   { self.attr & ATTR_DIRECTORY != 0 }
    pub fn attr(&self) -> u8       { self.attr }
    pub fn size(&self) -> u32      { self.size }

    pub fn cluster(&self) -> u32 {
        ((self.cluster_hi as u32) << 16) | self.cluster_lo as u32
    }

    /// The 8.3 name as displayed, e.g. `"HELLO   TXT"` → `"HELLO.TXT"`,
    /// honouring the NT lower-case flags.
    fn short_name(&self) -> String {
        let mut s = String::with_capacity(12);
        let base_end = self.name[..8].iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        let ext_end = self.name[8..].iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        let push = |s: &mut String, bytes: &[u8], lower: bool| {
            for (i, &b) in bytes.iter().enumerate() {
                // 0x05 stands in for a leading 0xE5 byte
                let b = if i == 0 && b == 0x05 { SLOT_FREE } else { b };
                let c = char::from(b);
                s.push(if lower { c.to_ascii_lowercase() } else { c });
            }
        };
        push(&mut s, &self.name[..base_end], self.nt_case & CASE_LOWER_BASE != 0);
        if ext_end > 0 {
            s.push('.');
            push(&mut s, &self.name[8..8 + ext_end], self.nt_case & CASE_LOWER_EXT != 0);
        }
        s
    }
}

// ─── Long filename (VFAT) decoding ─────────────────────────────────────────────

/// Checksum of an 8.3 name, stored in each of its LFN entries.
fn lfn_checksum(name83: &[u8; 11]) -> u8 {
    name83.iter().fold(0u8, |sum, &b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b))
}

/// Accumulates LFN slots, which precede their 8.3 entry in reverse order.
#[derive(Default)]
struct LfnBuilder {
    chars:    Vec<u16>,
    checksum: u8,
    expected: u8,
    slots:    Vec<SlotRef>,
    valid:    bool,
}

impl LfnBuilder {
    fn reset(&mut self) {
        self.valid = false;
        self.slots.clear();
    }

    fn push(&mut self, b: &[u8; DIR_ENTRY_SIZE], slot: SlotRef) {
        let seq = b[0] & 0x1F;
        let checksum = b[13];
        if b[0] & 0x40 != 0 {
            self.reset();
            self.chars = vec![0xFFFF; seq as usize * 13];
            self.checksum = checksum;
            self.expected = seq;
            self.valid = seq > 0;
        }
        if !self.valid || seq != self.expected || checksum != self.checksum {
            self.reset();
            return;
        }
        let start = (seq as usize - 1) * 13;
        let offsets = (1..11).step_by(2).chain((14..26).step_by(2)).chain((28..32).step_by(2));
        for (i, off) in offsets.enumerate() {
            self.chars[start + i] = u16::from_le_bytes([b[off], b[off + 1]]);
        }
        self.slots.push(slot);
        self.expected -= 1;
    }

    /// The long name belonging to `name83`, with the slots that hold it.
    fn take(&mut self, name83: &[u8; 11]) -> Option<(String, Vec<SlotRef>)> {
        let complete = self.valid && self.expected == 0 && lfn_checksum(name83) == self.checksum;
        self.valid = false;
        if !complete {
            self.slots.clear();
            return None;
        }
        let len = self.chars.iter().position(|&c| c == 0x0000 || c == 0xFFFF).unwrap_or(self.chars.len());
        let name = char::decode_utf16(self.chars[..len].iter().copied())
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        Some((name, std::mem::take(&mut self.slots)))
    }
}

// ─── Short names ───────────────────────────────────────────────────────────────

/// Encode `name` as an 8.3 short name plus NT case flags.
///
/// Base and extension must each be single-case; lower-case parts are stored
/// upper-case with the matching case flag.
pub(crate) fn encode_short_name(name: &str) -> FatResult<([u8; 11], u8)> {
    let invalid = || FatError::invalid_name(name);
    if name.is_empty() || name.starts_with('.') || !name.bytes().all(is_short_name_byte) {
        return Err(invalid());
    }
    let (base, ext) = match name.split_once('.') {
        Some((b, e)) if !e.contains('.') => (b, e),
        Some(_) => return Err(invalid()),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(invalid());
    }

    let case_flag = |part: &str, flag: u8| -> FatResult<u8> {
        let lower = part.bytes().any(|b| b.is_ascii_lowercase());
        let upper = part.bytes().any(|b| b.is_ascii_uppercase());
        match (lower, upper) {
            (true, true) => Err(invalid()),
            (true, false) => Ok(flag),
            _ => Ok(0),
        }
    };
    let nt_case = case_flag(base, CASE_LOWER_BASE)? | case_flag(ext, CASE_LOWER_EXT)?;

    let mut raw = [b' '; 11];
    for (i, b) in base.bytes().enumerate() { raw[i]     = b.to_ascii_uppercase(); }
    for (i, b) in ext.bytes().enumerate()  { raw[8 + i] = b.to_ascii_uppercase(); }
    Ok((raw, nt_case))
}

fn is_short_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || SHORT_NAME_SPECIALS.contains(&b)
}

pub fn names_match(stored: &str, query: &str) -> bool {
    stored.eq_ignore_ascii_case(query)
}

// ─── Public types ──────────────────────────────────────────────────────────────

/// One entry produced by directory iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub size: u32,
}

/// A directory entry together with its on-disk location.
pub(crate) struct Located {
    pub name:      String,
    pub raw:       RawDirEntry,
    pub slot:      SlotRef,
    pub lfn_slots: Vec<SlotRef>,
}

impl Located {
    fn matches(&self, query: &str) -> bool {
        names_match(&self.name, query) || names_match(&self.raw.short_name(), query)
    }
}

// ─── Implementation ────────────────────────────────────────────────────────────

impl<D: BlockDev> Volume<D> {
    /// Resolve `path` from the root. `None` means the root itself.
    pub(crate) fn resolve(&mut self, path: &str) -> FatResult<Option<Located>> {
        let mut found: Option<Located> = None;
        for part in components(path) {
            let dir = match &found {
                None => self.root_cluster,
                Some(loc) if loc.raw.is_dir() => self.dir_cluster(loc.raw.cluster()),
                Some(_) => return Err(FatError::not_found(path)),
            };
            let loc = self.find_in_dir(dir, part)?.ok_or_else(|| FatError::not_found(path))?;
            found = Some(loc);
        }
        Ok(found)
    }

    /// Read the next live entry at `pos`, skipping free slots, LFN slots,
    /// volume labels and `.`/`..`. `None` at the end of the directory;
    /// the cursor then stays on the end marker.
    pub(crate) fn next_located(&mut self, pos: &mut ClusterPos, abs: &mut u64) -> FatResult<Option<Located>> {
        let cs = self.cluster_size();
        let mut lfn = LfnBuilder::default();
        loop {
            if pos.cluster < 2 {
                return Ok(None);
            }
            if pos.offset >= cs {
                match self.next_cluster(pos.cluster)? {
                    Some(next) => *pos = ClusterPos { cluster: next, offset: 0 },
                    None => return Ok(None),
                }
            }
            let slot = self.slot_ref(*pos);
            let bytes = self.read_slot(slot)?;
            if bytes[0] == SLOT_END {
                return Ok(None);
            }
            pos.offset += DIR_ENTRY_SIZE as u32;
            *abs += DIR_ENTRY_SIZE as u64;

            if bytes[0] == SLOT_FREE {
                lfn.reset();
                continue;
            }
            let raw = RawDirEntry::parse(&bytes);
            if raw.is_lfn() {
                lfn.push(&bytes, slot);
                continue;
            }
            if raw.is_volume_id() || raw.is_dot() {
                lfn.reset();
                continue;
            }
            let (name, lfn_slots) = lfn.take(&raw.name).unwrap_or_else(|| (raw.short_name(), Vec::new()));
            return Ok(Some(Located { name, raw, slot, lfn_slots }));
        }
    }

    fn find_in_dir(&mut self, dir_cluster: u32, name: &str) -> FatResult<Option<Located>> {
        let mut pos = ClusterPos { cluster: dir_cluster, offset: 0 };
        let mut abs = 0;
        while let Some(loc) = self.next_located(&mut pos, &mut abs)? {
            if loc.matches(name) {
                return Ok(Some(loc));
            }
        }
        Ok(None)
    }

    fn dir_is_empty(&mut self, dir_cluster: u32) -> FatResult<bool> {
        let mut pos = ClusterPos { cluster: dir_cluster, offset: 0 };
        let mut abs = 0;
        Ok(self.next_located(&mut pos, &mut abs)?.is_none())
    }

    /// `..` entries of top-level directories store cluster 0 for the root.
    fn dir_cluster(&self, cluster: u32) -> u32 {
        if cluster < 2 { self.root_cluster } else { cluster }
    }

    pub(crate) fn slot_ref(&self, pos: ClusterPos) -> SlotRef {
        SlotRef {
            lba:    self.cluster_to_lba(pos.cluster) + (pos.offset as usize / SECTOR_SIZE) as u64,
            offset: pos.offset as usize % SECTOR_SIZE,
        }
    }

    pub(crate) fn read_slot(&mut self, slot: SlotRef) -> FatResult<[u8; DIR_ENTRY_SIZE]> {
        let mut sec = [0u8; SECTOR_SIZE];
        self.read_sector(slot.lba, &mut sec)?;
        let mut out = [0u8; DIR_ENTRY_SIZE];
        out.copy_from_slice(&sec[slot.offset..slot.offset + DIR_ENTRY_SIZE]);
        Ok(out)
    }

    pub(crate) fn write_slot(&mut self, slot: SlotRef, bytes: &[u8; DIR_ENTRY_SIZE]) -> FatResult<()> {
        let mut sec = [0u8; SECTOR_SIZE];
        self.read_sector(slot.lba, &mut sec)?;
        sec[slot.offset..slot.offset + DIR_ENTRY_SIZE].copy_from_slice(bytes);
        self.write_sector(slot.lba, &sec)
    }

    /// First free or end-of-directory slot, growing the directory by one
    /// cluster when every slot is taken.
    fn find_free_slot(&mut self, dir_cluster: u32) -> FatResult<SlotRef> {
        let mut cluster = dir_cluster;
        loop {
            let lba = self.cluster_to_lba(cluster);
            for s in 0..self.sectors_per_clus as u64 {
                let mut sec = [0u8; SECTOR_SIZE];
                self.read_sector(lba + s, &mut sec)?;
                let free = sec.chunks_exact(DIR_ENTRY_SIZE)
                    .position(|e| e[0] == SLOT_END || e[0] == SLOT_FREE);
                if let Some(i) = free {
                    return Ok(SlotRef { lba: lba + s, offset: i * DIR_ENTRY_SIZE });
                }
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => {
                    let new = self.extend_chain(cluster)?;
                    debug!("fat32: directory {dir_cluster} grew by cluster {new}");
                    return Ok(SlotRef { lba: self.cluster_to_lba(new), offset: 0 });
                }
            }
        }
    }

    fn check_new_name(&mut self, dir_cluster: u32, name: &str) -> FatResult<([u8; 11], u8)> {
        let encoded = encode_short_name(name)?;
        if self.find_in_dir(dir_cluster, name)?.is_some() {
            return Err(FatError::AlreadyExists(name.to_string()));
        }
        Ok(encoded)
    }

    fn insert_entry(&mut self, dir_cluster: u32, raw: RawDirEntry) -> FatResult<()> {
        let slot = self.find_free_slot(dir_cluster)?;
        self.write_slot(slot, &raw.encode())
    }

    // ─── Public API ────────────────────────────────────────────────────────────

    /// Next entry of an open directory, or `None` once the directory is exhausted.
    ///
    /// Iteration continues from the node's cursor; reopen the directory to
    /// start over.
    pub fn readdir(&mut self, dir: &mut Node) -> FatResult<Option<DirEntry>> {
        if !dir.is_dir() {
            return Err(FatError::NotADirectory(dir.name().to_string()));
        }
        let loc = self.next_located(&mut dir.pos, &mut dir.abs_offset)?;
        Ok(loc.map(|l| DirEntry {
            kind: if l.raw.is_dir() { NodeKind::Directory } else { NodeKind::Regular },
            size: l.raw.size(),
            name: l.name,
        }))
    }

    /// Create `name` inside the open directory `parent`.
    ///
    /// Not idempotent: an existing entry with the same name is an error.
    pub fn create(&mut self, parent: &mut Node, name: &str, kind: NodeKind) -> FatResult<()> {
        self.check_writable()?;
        if !parent.is_dir() {
            return Err(FatError::NotADirectory(parent.name().to_string()));
        }
        if parent.mode() != Mode::ReadWrite {
            return Err(FatError::NotWritable(parent.name().to_string()));
        }
        let parent_cluster = self.dir_cluster(parent.first_cluster());
        let (name83, nt_case) = self.check_new_name(parent_cluster, name)?;

        match kind {
            NodeKind::Regular => {
                self.insert_entry(parent_cluster, RawDirEntry::new(name83, nt_case, ATTR_ARCHIVE, 0))?;
            }
            NodeKind::Directory => {
                let cluster = self.alloc_cluster()?;
                let result = self.init_dir_cluster(cluster, parent_cluster).and_then(|_| {
                    self.insert_entry(parent_cluster, RawDirEntry::new(name83, nt_case, ATTR_DIRECTORY, cluster))
                });
                if let Err(e) = result {
                    self.free_chain(cluster)?;
                    return Err(e);
                }
            }
        }
        debug!("fat32: created {kind:?} {name:?} in cluster {parent_cluster}");
        Ok(())
    }

    /// Write `.` and `..` into a freshly zeroed directory cluster.
    fn init_dir_cluster(&mut self, cluster: u32, parent_cluster: u32) -> FatResult<()> {
        let parent = if parent_cluster == self.root_cluster { 0 } else { parent_cluster };
        let mut dot = [b' '; 11];
        dot[0] = b'.';
        let mut dotdot = dot;
        dotdot[1] = b'.';

        let mut sec = [0u8; SECTOR_SIZE];
        sec[..DIR_ENTRY_SIZE].copy_from_slice(&RawDirEntry::new(dot, 0, ATTR_DIRECTORY, cluster).encode());
        sec[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]
            .copy_from_slice(&RawDirEntry::new(dotdot, 0, ATTR_DIRECTORY, parent).encode());
        self.write_sector(self.cluster_to_lba(cluster), &sec)
    }

    /// Remove a regular file or an empty directory and release its clusters.
    pub fn delete(&mut self, node: &Node) -> FatResult<()> {
        self.check_writable()?;
        if node.mode() != Mode::ReadWrite {
            return Err(FatError::NotWritable(node.name().to_string()));
        }
        let NodeEntry { slot: Some(slot), lfn_slots, .. } = &node.entry else {
            return Err(FatError::RootDirectory);
        };
        if node.is_dir() && !self.dir_is_empty(self.dir_cluster(node.first_cluster()))? {
            return Err(FatError::DirectoryNotEmpty(node.name().to_string()));
        }

        for &s in lfn_slots.iter().chain(std::iter::once(slot)) {
            let mut bytes = self.read_slot(s)?;
            bytes[0] = SLOT_FREE;
            self.write_slot(s, &bytes)?;
        }
        self.free_chain(node.first_cluster())?;
        debug!("fat32: deleted {:?}", node.name());
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, node: &Node) -> FatResult<()> {
        if !node.is_dir() {
            return Err(FatError::NotADirectory(node.name().to_string()));
        }
        self.delete(node)
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
