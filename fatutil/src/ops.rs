//! POSIX-style adapters over the volume engine.
//!
//! Every adapter takes the volume explicitly and opens the nodes it needs for
//! the duration of the call. Engine errors collapse into two kinds:
//! [`OpError::NotFound`] when a path does not resolve, and
//! [`OpError::OperationFailed`] for everything else.

use std::fmt;

use log::{debug, warn};
use thiserror::Error;

use crate::fat32::{dirname, filename, BlockDev, FatError, Mode, Node, NodeKind, Volume, ROOT};
use crate::human::human_size;

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// The engine has no per-file permissions; everything is `rwxrwxrwx`.
pub const DEFAULT_PERM: u32 = 0o777;

// ─── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum OpError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("{op} {path}: {reason}")]
    OperationFailed {
        op:     &'static str,
        path:   String,
        reason: String,
    },
}

impl OpError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn failed(op: &'static str, path: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::OperationFailed { op, path: path.into(), reason: reason.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type OpResult<T> = Result<T, OpError>;

fn engine_error<'a>(op: &'static str, path: &'a str) -> impl FnOnce(FatError) -> OpError + 'a {
    move |e| {
        debug!("{op} {path}: {e}");
        OpError::failed(op, path, e)
    }
}

// ─── Records ───────────────────────────────────────────────────────────────────

/// `stat(2)`-style view of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatRecord {
    pub size: u64,
    pub kind: NodeKind,
    pub perm: u32,
}

impl StatRecord {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// File type bits plus permissions, as in `st_mode`.
    pub fn mode(&self) -> u32 {
        let ty = if self.is_dir() { S_IFDIR } else { S_IFREG };
        ty | self.perm
    }

    /// `ls -l` style permission string, e.g. `drwxrwxrwx`.
    pub fn mode_string(&self) -> String {
        let mut s = String::with_capacity(10);
        s.push(if self.is_dir() { 'd' } else { '-' });
        for shift in [6, 3, 0] {
            let bits = self.perm >> shift;
            s.push(if bits & 4 != 0 { 'r' } else { '-' });
            s.push(if bits & 2 != 0 { 'w' } else { '-' });
            s.push(if bits & 1 != 0 { 'x' } else { '-' });
        }
        s
    }
}

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub stat: StatRecord,
}

impl fmt::Display for ListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.stat.mode_string(), human_size(self.stat.size), self.name)
    }
}

/// Capacity of a volume, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUsage {
    pub id:    u32,
    pub total: u64,
    pub free:  u64,
}

// ─── Adapters ──────────────────────────────────────────────────────────────────

/// Open `path`, reporting an unresolved path as [`OpError::NotFound`].
pub fn open<D: BlockDev>(vol: &mut Volume<D>, path: &str, mode: Mode) -> OpResult<Node> {
    vol.open(path, mode).map_err(|e| {
        if e.is_not_found() {
            OpError::not_found(path)
        } else {
            engine_error("open", path)(e)
        }
    })
}

pub fn getattr<D: BlockDev>(vol: &mut Volume<D>, path: &str) -> OpResult<StatRecord> {
    let node = open(vol, path, Mode::ReadOnly)?;
    let st = vol.stat(&node).map_err(engine_error("stat", path))?;
    Ok(StatRecord { size: st.size as u64, kind: st.kind, perm: DEFAULT_PERM })
}

/// Entries of the directory at `path` in on-disk order.
pub fn list_dir<D: BlockDev>(vol: &mut Volume<D>, path: &str) -> OpResult<Vec<ListEntry>> {
    let mut dir = open(vol, path, Mode::ReadOnly)?;
    let mut out = Vec::new();
    while let Some(entry) = vol.readdir(&mut dir).map_err(engine_error("readdir", path))? {
        let child = child_path(path, &entry.name);
        let stat = getattr(vol, &child).map_err(|e| {
            debug!("readdir {path}: {e}");
            OpError::not_found(&child)
        })?;
        out.push(ListEntry { name: entry.name, stat });
    }
    Ok(out)
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub fn mkdir<D: BlockDev>(vol: &mut Volume<D>, path: &str) -> OpResult<()> {
    create(vol, path, NodeKind::Directory, "mkdir")
}

pub fn mknod<D: BlockDev>(vol: &mut Volume<D>, path: &str) -> OpResult<()> {
    create(vol, path, NodeKind::Regular, "mknod")
}

fn create<D: BlockDev>(vol: &mut Volume<D>, path: &str, kind: NodeKind, op: &'static str) -> OpResult<()> {
    let name = filename(path);
    if name.is_empty() {
        return Err(OpError::failed(op, ROOT, FatError::RootDirectory));
    }
    let mut dir = open(vol, dirname(path), Mode::ReadWrite)?;
    vol.create(&mut dir, name, kind).map_err(engine_error(op, path))
}

pub fn unlink<D: BlockDev>(vol: &mut Volume<D>, path: &str) -> OpResult<()> {
    let node = open(vol, path, Mode::ReadWrite)?;
    vol.delete(&node).map_err(engine_error("unlink", path))
}

pub fn rmdir<D: BlockDev>(vol: &mut Volume<D>, path: &str) -> OpResult<()> {
    let node = open(vol, path, Mode::ReadWrite)?;
    vol.rmdir(&node).map_err(engine_error("rmdir", path))
}

/// Read up to `buf.len()` bytes at `offset`, never past the end of the file.
///
/// Returns the number of bytes read, which is short only when the request
/// extends past the end of the file.
pub fn read<D: BlockDev>(vol: &mut Volume<D>, node: &mut Node, buf: &mut [u8], offset: u64) -> OpResult<usize> {
    let size = node.size() as u64;
    let len = (buf.len() as u64).min(size.saturating_sub(offset)) as usize;
    let mut node = node.override_mode(Mode::ReadOnly);

    let landed = vol.seek(&mut node, offset).map_err(|e| engine_error("read", node.name())(e))?;
    if landed != offset {
        return Err(OpError::failed("read", node.name(), format!("seek to {offset} landed at {landed}")));
    }
    let cluster = node.cluster_pos().cluster;
    if vol.is_eoc(cluster) || vol.is_free(cluster) {
        return Err(OpError::failed("read", node.name(), format!("no data cluster at offset {offset}")));
    }
    let n = vol
        .read_data(node.cluster_pos_mut(), &mut buf[..len])
        .map_err(|e| engine_error("read", node.name())(e))?;
    node.advance(n as u64);
    if n == 0 || n != len {
        return Err(OpError::failed("read", node.name(), format!("transferred {n} of {len} bytes")));
    }
    Ok(n)
}

/// Write `buf` at `offset` and persist the node's size and cluster chain.
///
/// `offset` may be at most the current size. Metadata is persisted even when
/// the transfer fails part-way.
pub fn write<D: BlockDev>(vol: &mut Volume<D>, node: &mut Node, buf: &[u8], offset: u64) -> OpResult<usize> {
    let landed = match vol.seek(node, offset) {
        Ok(landed) => landed,
        Err(e) => return Err(persist_and_fail(vol, node, e.to_string())),
    };
    if landed != offset {
        return Err(persist_and_fail(vol, node, format!("seek to {offset} landed at {landed}")));
    }
    let written = match vol.write_data(node, buf) {
        Ok(n) => n,
        Err(e) => return Err(persist_and_fail(vol, node, e.to_string())),
    };
    if written != buf.len() {
        return Err(persist_and_fail(vol, node, format!("short write: {written} of {} bytes", buf.len())));
    }
    vol.update_file(node).map_err(|e| engine_error("write", node.name())(e))?;
    Ok(written)
}

/// Persist what a failed write managed to transfer, then report `reason`.
fn persist_and_fail<D: BlockDev>(vol: &mut Volume<D>, node: &mut Node, reason: String) -> OpError {
    if let Err(e) = vol.update_file(node) {
        warn!("write {}: could not persist metadata: {e}", node.name());
    }
    OpError::failed("write", node.name(), reason)
}

pub fn statvfs<D: BlockDev>(vol: &Volume<D>) -> VolumeUsage {
    let st = vol.statvfs();
    VolumeUsage {
        id:    st.volume_id,
        total: st.blocks * st.block_size as u64,
        free:  st.free_blocks * st.block_size as u64,
    }
}

// ─── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat32::testutil::*;
    use crate::fat32::Access;

    fn rw_volume() -> Volume<MemDisk> {
        Volume::partition_init(make_disk(), Access::ReadWrite).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    // ── getattr / list_dir ───────────────────────────────────────────────────

    #[test]
    fn getattr_file_and_root() {
        let disk = disk_with_file("DATA.BIN", &[1u8; 2048]);
        let mut vol = Volume::partition_init(disk, Access::ReadOnly).unwrap();
        let st = getattr(&mut vol, "/DATA.BIN").unwrap();
        assert_eq!(st, StatRecord { size: 2048, kind: NodeKind::Regular, perm: 0o777 });
        assert_eq!(st.mode(), 0o100777);

        let root = getattr(&mut vol, "/").unwrap();
        assert!(root.is_dir());
        assert_eq!(root.mode(), 0o040777);
    }

    #[test]
    fn getattr_missing_is_not_found() {
        let mut vol = rw_volume();
        assert!(getattr(&mut vol, "/nope").unwrap_err().is_not_found());
    }

    #[test]
    fn mode_strings() {
        let dir = StatRecord { size: 0, kind: NodeKind::Directory, perm: DEFAULT_PERM };
        let file = StatRecord { kind: NodeKind::Regular, perm: 0o640, ..dir };
        assert_eq!(dir.mode_string(), "drwxrwxrwx");
        assert_eq!(file.mode_string(), "-rw-r-----");
    }

    #[test]
    fn list_root_renders_lines() {
        let mut vol = rw_volume();
        mkdir(&mut vol, "/sub").unwrap();
        mknod(&mut vol, "/f.bin").unwrap();
        let mut f = open(&mut vol, "/f.bin", Mode::ReadWrite).unwrap();
        write(&mut vol, &mut f, &[0u8; 2048], 0).unwrap();

        let lines: Vec<String> = list_dir(&mut vol, "/").unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(lines, ["drwxrwxrwx 0 sub", "-rwxrwxrwx 2K f.bin"]);
    }

    #[test]
    fn list_nested_directory_stats_children() {
        let mut vol = rw_volume();
        mkdir(&mut vol, "/a").unwrap();
        mkdir(&mut vol, "/a/b").unwrap();
        mknod(&mut vol, "/a/c").unwrap();
        let entries = list_dir(&mut vol, "/a").unwrap();
        let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.stat.is_dir())).collect();
        assert_eq!(names, [("b", true), ("c", false)]);
        assert_eq!(list_dir(&mut vol, "/a/").unwrap().len(), 2);
    }

    #[test]
    fn list_missing_dir_is_not_found() {
        let mut vol = rw_volume();
        assert!(list_dir(&mut vol, "/nope").unwrap_err().is_not_found());
    }

    // ── create / delete ──────────────────────────────────────────────────────

    #[test]
    fn create_with_missing_parent_is_not_found() {
        let mut vol = rw_volume();
        assert!(mkdir(&mut vol, "/no/such").unwrap_err().is_not_found());
        assert!(mknod(&mut vol, "/no/file").unwrap_err().is_not_found());
    }

    #[test]
    fn create_twice_fails() {
        let mut vol = rw_volume();
        mknod(&mut vol, "/f").unwrap();
        let err = mknod(&mut vol, "/f").unwrap_err();
        assert!(matches!(err, OpError::OperationFailed { op: "mknod", .. }));
        mkdir(&mut vol, "/d").unwrap();
        assert!(!mkdir(&mut vol, "/d").unwrap_err().is_not_found());
    }

    #[test]
    fn create_root_fails() {
        let mut vol = rw_volume();
        assert!(matches!(mkdir(&mut vol, "/"), Err(OpError::OperationFailed { .. })));
    }

    #[test]
    fn rmdir_non_empty_fails_and_keeps_directory() {
        let mut vol = rw_volume();
        mkdir(&mut vol, "/d").unwrap();
        mknod(&mut vol, "/d/f").unwrap();
        assert!(matches!(rmdir(&mut vol, "/d"), Err(OpError::OperationFailed { op: "rmdir", .. })));
        assert!(getattr(&mut vol, "/d").unwrap().is_dir());

        unlink(&mut vol, "/d/f").unwrap();
        rmdir(&mut vol, "/d").unwrap();
        assert!(getattr(&mut vol, "/d").unwrap_err().is_not_found());
    }

    #[test]
    fn unlink_missing_is_not_found() {
        let mut vol = rw_volume();
        assert!(unlink(&mut vol, "/ghost").unwrap_err().is_not_found());
        assert!(rmdir(&mut vol, "/ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn mutations_on_read_only_volume_fail() {
        let mut vol = Volume::partition_init(make_disk(), Access::ReadOnly).unwrap();
        assert!(mkdir(&mut vol, "/x").is_err());
        assert!(getattr(&mut vol, "/").is_ok());
    }

    // ── read / write ─────────────────────────────────────────────────────────

    #[test]
    fn read_is_clamped_to_file_size() {
        let content = pattern(1500);
        let disk = disk_with_file("DATA.BIN", &content);
        let mut vol = Volume::partition_init(disk, Access::ReadOnly).unwrap();
        let mut node = open(&mut vol, "/DATA.BIN", Mode::ReadOnly).unwrap();
        let mut buf = [0u8; 1024];
        assert_eq!(read(&mut vol, &mut node, &mut buf, 1000).unwrap(), 500);
        assert_eq!(buf[..500], content[1000..]);
        assert_eq!(node.offset(), 1500);
    }

    #[test]
    fn read_at_end_of_file_fails() {
        let disk = disk_with_file("DATA.BIN", &pattern(100));
        let mut vol = Volume::partition_init(disk, Access::ReadOnly).unwrap();
        let mut node = open(&mut vol, "/DATA.BIN", Mode::ReadOnly).unwrap();
        let mut buf = [0u8; 16];
        assert!(read(&mut vol, &mut node, &mut buf, 100).is_err());
        assert!(read(&mut vol, &mut node, &mut buf, 200).is_err());
    }

    #[test]
    fn read_restores_node_mode() {
        let mut vol = rw_volume();
        mknod(&mut vol, "/f").unwrap();
        let mut node = open(&mut vol, "/f", Mode::ReadWrite).unwrap();
        write(&mut vol, &mut node, b"hello", 0).unwrap();
        let mut buf = [0u8; 5];
        read(&mut vol, &mut node, &mut buf, 0).unwrap();
        assert_eq!(node.mode(), Mode::ReadWrite);
        // Error paths restore the mode as well.
        assert!(read(&mut vol, &mut node, &mut buf, 99).is_err());
        assert_eq!(node.mode(), Mode::ReadWrite);
    }

    #[test]
    fn write_then_read_round_trip_at_offsets() {
        let mut vol = rw_volume();
        mknod(&mut vol, "/rt.bin").unwrap();
        let mut node = open(&mut vol, "/rt.bin", Mode::ReadWrite).unwrap();
        let data = pattern(3000);
        assert_eq!(write(&mut vol, &mut node, &data[..1000], 0).unwrap(), 1000);
        assert_eq!(write(&mut vol, &mut node, &data[1000..], 1000).unwrap(), 2000);
        assert_eq!(getattr(&mut vol, "/rt.bin").unwrap().size, 3000);

        let mut node = open(&mut vol, "/rt.bin", Mode::ReadOnly).unwrap();
        let mut buf = vec![0u8; 777];
        assert_eq!(read(&mut vol, &mut node, &mut buf, 1111).unwrap(), 777);
        assert_eq!(buf, data[1111..1888]);

        let mut disk = vol.finalize().unwrap();
        assert_eq!(read_via_fatfs(&mut disk, "rt.bin"), data);
    }

    #[test]
    fn write_past_end_fails() {
        let mut vol = rw_volume();
        mknod(&mut vol, "/f").unwrap();
        let mut node = open(&mut vol, "/f", Mode::ReadWrite).unwrap();
        assert!(matches!(write(&mut vol, &mut node, b"x", 10), Err(OpError::OperationFailed { op: "write", .. })));
        assert_eq!(getattr(&mut vol, "/f").unwrap().size, 0);
    }

    #[test]
    fn short_write_persists_transferred_bytes() {
        let mut vol = rw_volume();
        mknod(&mut vol, "/full.bin").unwrap();
        let mut node = open(&mut vol, "/full.bin", Mode::ReadWrite).unwrap();

        // Fill the volume, then give back two clusters.
        let mut taken = Vec::new();
        while let Ok(c) = vol.alloc_cluster() {
            taken.push(c);
        }
        for c in taken.split_off(taken.len() - 2) {
            vol.set_fat_entry(c, 0).unwrap();
        }
        assert_eq!(vol.statvfs().free_blocks, 2);

        let data = pattern(2048);
        let err = write(&mut vol, &mut node, &data, 0).unwrap_err();
        assert!(matches!(err, OpError::OperationFailed { op: "write", .. }), "{err}");
        assert_eq!(getattr(&mut vol, "/full.bin").unwrap().size, 1024);

        let mut disk = vol.finalize().unwrap();
        assert_eq!(read_via_fatfs(&mut disk, "full.bin"), data[..1024]);
    }

    #[test]
    fn write_to_read_only_node_fails() {
        let mut vol = rw_volume();
        mknod(&mut vol, "/f").unwrap();
        let mut node = open(&mut vol, "/f", Mode::ReadOnly).unwrap();
        assert!(write(&mut vol, &mut node, b"x", 0).is_err());
    }

    // ── statvfs ──────────────────────────────────────────────────────────────

    #[test]
    fn statvfs_reports_bytes() {
        let mut vol = rw_volume();
        let before = statvfs(&vol);
        assert_eq!(before.total, 40 * 1024 * 1024);
        assert!(before.free > 0 && before.free < before.total);
        assert_eq!(before.id, vol.volume_id());

        mkdir(&mut vol, "/d").unwrap();
        assert_eq!(statvfs(&vol).free, before.free - vol.cluster_size() as u64);
    }
}
