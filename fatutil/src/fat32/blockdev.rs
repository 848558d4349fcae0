use std::io::{self, Read, Seek, SeekFrom, Write};

pub const SECTOR_SIZE: usize = 512;

/// Sector-granular access to the storage backing a volume.
///
/// Every `Read + Write + Seek` type is a block device, so a host `File` and an
/// in-memory `Cursor<Vec<u8>>` can both back a [`Volume`](super::Volume).
pub trait BlockDev {
    fn read(&mut self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> io::Result<()>;
    fn write(&mut self, lba: u64, buf: &[u8; SECTOR_SIZE]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

impl<T: Read + Write + Seek> BlockDev for T {
    fn read(&mut self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> io::Result<()> {
        self.seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))?;
        self.read_exact(buf)
    }

    fn write(&mut self, lba: u64, buf: &[u8; SECTOR_SIZE]) -> io::Result<()> {
        self.seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))?;
        self.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }
}
