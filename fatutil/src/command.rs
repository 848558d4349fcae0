//! Command-line surface and dispatcher.
//!
//! One command runs per invocation against one image. `write` and `read`
//! stream data between the host and the image in [`CHUNK_SIZE`] chunks
//! through the bounded I/O adapters in [`crate::ops`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{debug, info};
use thiserror::Error;

use crate::fat32::{Access, BlockDev, FatError, Mode, Node, Volume};
use crate::human::human_size;
use crate::ops::{self, OpError};

/// Bytes moved per adapter call by `write` and `read`.
pub const CHUNK_SIZE: usize = 1024;

/// Host path standing for stdin (`write`) or stdout (`read`).
pub const STDIO: &str = "-";

// ─── Command line ──────────────────────────────────────────────────────────────

/// Inspect and modify FAT32 disk images.
#[derive(Parser, Debug)]
#[command(name = "fatutil", version)]
#[command(about = "Inspect and modify FAT32 disk images")]
#[command(after_help = "SOURCE_FILE and DEST_FILE can be - for stdin and stdout respectively.")]
pub struct Cli {
    /// FAT32 image file
    #[arg(value_name = "FATIMG")]
    pub image: PathBuf,

    /// Open the image without write access
    #[arg(long, global = true)]
    pub read_only: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the volume id, size and free space
    Stat,
    /// List a directory
    Ls {
        #[arg(value_name = "DIR")]
        dir: String,
    },
    /// Remove an empty directory
    Rmdir {
        #[arg(value_name = "DIR")]
        dir: String,
    },
    /// Remove a file
    Unlink {
        #[arg(value_name = "FILE")]
        file: String,
    },
    /// Create a directory
    Mkdir {
        #[arg(value_name = "DIR")]
        dir: String,
    },
    /// Copy a host file into the image
    Write {
        #[arg(value_name = "SOURCE_FILE")]
        source: PathBuf,
        #[arg(value_name = "FAT_DEST_FILE")]
        dest: String,
    },
    /// Copy a file out of the image
    Read {
        #[arg(value_name = "FAT_SOURCE_FILE")]
        source: String,
        #[arg(value_name = "DEST_FILE")]
        dest: PathBuf,
    },
}

impl Command {
    /// True for commands that change the image.
    pub fn modifies_image(&self) -> bool {
        !matches!(self, Self::Stat | Self::Ls { .. } | Self::Read { .. })
    }
}

// ─── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("could not initialize fat image {}", .path.display())]
    Init {
        path: PathBuf,
        #[source]
        source: FatError,
    },

    #[error("could not finalize fat image {}", .path.display())]
    Finalize {
        path: PathBuf,
        #[source]
        source: FatError,
    },

    #[error("could not open {path}")]
    OpenHost {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("could not open {path}")]
    OpenVolume {
        path: String,
        #[source]
        source: OpError,
    },

    #[error("could not read from {path}")]
    HostRead {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("could not write to {path}")]
    HostWrite {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("could not read from {path}")]
    ReadFrom {
        path: String,
        #[source]
        source: OpError,
    },

    #[error("could not write to {path}")]
    WriteTo {
        path: String,
        #[source]
        source: OpError,
    },

    #[error("short transfer on {path}: {got} of {want} bytes")]
    ShortTransfer {
        path: String,
        want: usize,
        got:  usize,
    },

    #[error("could not stat {path}")]
    Stat {
        path: String,
        #[source]
        source: OpError,
    },

    #[error("mkdir failed")]
    Mkdir(#[source] OpError),

    #[error("unlink failed")]
    Unlink(#[source] OpError),

    #[error("rmdir failed")]
    Rmdir(#[source] OpError),

    #[error("readdir failed")]
    Readdir(#[source] OpError),
}

pub type CommandResult<T> = Result<T, CommandError>;

// ─── Dispatch ──────────────────────────────────────────────────────────────────

/// Summary of one `write` or `read` copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub bytes:  u64,
    pub chunks: u64,
}

/// Mount the image named on the command line, run the command, and finalize
/// the volume whether or not the command succeeded.
pub fn run(cli: &Cli) -> CommandResult<()> {
    let access = if cli.read_only || !cli.command.modifies_image() {
        Access::ReadOnly
    } else {
        Access::ReadWrite
    };
    let init_error = |source: FatError| CommandError::Init { path: cli.image.clone(), source };

    let image = OpenOptions::new()
        .read(true)
        .write(access == Access::ReadWrite)
        .open(&cli.image)
        .map_err(|e| init_error(e.into()))?;
    let mut vol = Volume::partition_init(image, access).map_err(init_error)?;

    let result = execute(&mut vol, &cli.command, &mut io::stdin().lock(), &mut io::stdout().lock());
    let finalized = vol
        .finalize()
        .map(drop)
        .map_err(|source| CommandError::Finalize { path: cli.image.clone(), source });
    result.and(finalized)
}

/// Run one command. `stdin` and `stdout` stand in for the `-` host path.
pub fn execute<D: BlockDev>(
    vol: &mut Volume<D>,
    command: &Command,
    stdin: &mut dyn Read,
    stdout: &mut dyn Write,
) -> CommandResult<()> {
    let console = |source: io::Error| CommandError::HostWrite { path: STDIO.to_string(), source };
    match command {
        Command::Stat => {
            let usage = ops::statvfs(vol);
            writeln!(stdout, "ID: {}", usage.id).map_err(console)?;
            writeln!(stdout, "size: {}", human_size(usage.total)).map_err(console)?;
            writeln!(stdout, "free: {}", human_size(usage.free)).map_err(console)?;
        }
        Command::Ls { dir } => {
            for entry in ops::list_dir(vol, dir).map_err(CommandError::Readdir)? {
                writeln!(stdout, "{entry}").map_err(console)?;
            }
        }
        Command::Mkdir { dir } => ops::mkdir(vol, dir).map_err(CommandError::Mkdir)?,
        Command::Unlink { file } => ops::unlink(vol, file).map_err(CommandError::Unlink)?,
        Command::Rmdir { dir } => ops::rmdir(vol, dir).map_err(CommandError::Rmdir)?,
        Command::Write { source, dest } => {
            let source_name = source.display().to_string();
            let mut file;
            let input: &mut dyn Read = if is_stdio(source) {
                stdin
            } else {
                file = File::open(source)
                    .map_err(|e| CommandError::OpenHost { path: source_name.clone(), source: e })?;
                &mut file
            };
            let t = copy_in(vol, input, &source_name, dest)?;
            info!("write {source_name} -> {dest}: {} bytes in {} chunks", t.bytes, t.chunks);
        }
        Command::Read { source, dest } => {
            // The image side first, so a bad source leaves no host file behind.
            let mut node = ops::open(vol, source, Mode::ReadOnly)
                .map_err(|e| CommandError::OpenVolume { path: source.clone(), source: e })?;
            let dest_name = dest.display().to_string();
            let mut file;
            let output: &mut dyn Write = if is_stdio(dest) {
                stdout
            } else {
                file = File::create(dest)
                    .map_err(|e| CommandError::OpenHost { path: dest_name.clone(), source: e })?;
                &mut file
            };
            let t = copy_out(vol, &mut node, source, output, &dest_name)?;
            info!("read {source} -> {dest_name}: {} bytes in {} chunks", t.bytes, t.chunks);
        }
    }
    Ok(())
}

fn is_stdio(path: &Path) -> bool {
    path == Path::new(STDIO)
}

// ─── Streaming copy ────────────────────────────────────────────────────────────

/// Copy `input` into the image file `dest`, creating it when missing.
///
/// An existing file is overwritten from offset 0 but not truncated.
pub fn copy_in<D: BlockDev>(
    vol: &mut Volume<D>,
    input: &mut dyn Read,
    source: &str,
    dest: &str,
) -> CommandResult<Transfer> {
    // A failed create is fine as long as the open below succeeds.
    if let Err(e) = ops::mknod(vol, dest) {
        debug!("write: mknod {dest}: {e}");
    }
    let mut node = ops::open(vol, dest, Mode::ReadWrite)
        .map_err(|e| CommandError::OpenVolume { path: dest.to_string(), source: e })?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut t = Transfer::default();
    loop {
        let n = fill_chunk(input, &mut buf)
            .map_err(|e| CommandError::HostRead { path: source.to_string(), source: e })?;
        if n > 0 {
            let written = ops::write(vol, &mut node, &buf[..n], t.bytes)
                .map_err(|e| CommandError::WriteTo { path: dest.to_string(), source: e })?;
            confirm(dest, n, written)?;
            t.bytes += written as u64;
            t.chunks += 1;
            debug!("write: chunk {} of {n} bytes at {}", t.chunks, t.bytes - n as u64);
        }
        if n < CHUNK_SIZE {
            break;
        }
    }
    Ok(t)
}

/// Copy the open image file `node` (at path `source`) to `output`.
pub fn copy_out<D: BlockDev>(
    vol: &mut Volume<D>,
    node: &mut Node,
    source: &str,
    output: &mut dyn Write,
    dest: &str,
) -> CommandResult<Transfer> {
    let size = ops::getattr(vol, source)
        .map_err(|e| CommandError::Stat { path: source.to_string(), source: e })?
        .size;
    let host_error = |e| CommandError::HostWrite { path: dest.to_string(), source: e };

    let mut buf = [0u8; CHUNK_SIZE];
    let mut t = Transfer::default();
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let got = ops::read(vol, node, &mut buf[..want], t.bytes)
            .map_err(|e| CommandError::ReadFrom { path: source.to_string(), source: e })?;
        confirm(source, want, got)?;
        output.write_all(&buf[..got]).map_err(host_error)?;
        t.bytes += got as u64;
        t.chunks += 1;
        remaining -= got as u64;
    }
    output.flush().map_err(host_error)?;
    Ok(t)
}

fn confirm(path: &str, want: usize, got: usize) -> CommandResult<()> {
    if want != got {
        return Err(CommandError::ShortTransfer { path: path.to_string(), want, got });
    }
    Ok(())
}

/// Fill `buf` like C `fread`: keep reading until it is full or the input ends.
fn fill_chunk(input: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
