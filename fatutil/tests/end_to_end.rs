//! End-to-end tests: the `fatutil` binary against FAT32 image files on the host.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::{NamedTempFile, TempDir};

use fatutil::command::{self, Cli};

const IMAGE_SIZE: u64 = 40 * 1024 * 1024;

// ── helpers ──────────────────────────────────────────────────────────────────

/// A freshly formatted FAT32 image in a temporary file.
fn image() -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(IMAGE_SIZE).unwrap();
    let mut disk = file.reopen().unwrap();
    fatfs::format_volume(
        &mut disk,
        fatfs::FormatVolumeOptions::new().fat_type(fatfs::FatType::Fat32),
    ).unwrap();
    file
}

fn run_tool(img: &Path, args: &[&str], stdin: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_fatutil"))
        .arg(img)
        .args(args)
        .env_remove(fatutil::logger::LOG_ENV)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    // A command that fails early may close stdin before reading it.
    let _ = child.stdin.take().unwrap().write_all(stdin);
    child.wait_with_output().unwrap()
}

/// Run a command that must succeed and return its stdout.
fn ok(img: &Path, args: &[&str]) -> Vec<u8> {
    let out = run_tool(img, args, b"");
    assert!(out.status.success(), "{args:?}: {}", String::from_utf8_lossy(&out.stderr));
    out.stdout
}

/// Run a command that must fail and return its stderr.
fn fails(img: &Path, args: &[&str]) -> String {
    let out = run_tool(img, args, b"");
    assert!(!out.status.success(), "{args:?} unexpectedly succeeded");
    #[cfg(unix)]
    assert_eq!(out.status.code(), Some(255));
    String::from_utf8(out.stderr).unwrap()
}

fn ls(img: &Path, dir: &str) -> String {
    String::from_utf8(ok(img, &["ls", dir])).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn read_via_fatfs(img: &Path, path: &str) -> Vec<u8> {
    let disk = OpenOptions::new().read(true).write(true).open(img).unwrap();
    let fs = fatfs::FileSystem::new(disk, fatfs::FsOptions::new()).unwrap();
    let mut buf = Vec::new();
    fs.root_dir().open_file(path).unwrap().read_to_end(&mut buf).unwrap();
    buf
}

// ── copy ─────────────────────────────────────────────────────────────────────

#[test]
fn five_thousand_bytes_through_stdio() {
    let img = image();
    let data = pattern(5000);

    let out = run_tool(img.path(), &["-v", "write", "-", "/a.txt"], &data);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let log = String::from_utf8(out.stderr).unwrap();
    assert!(log.contains("5000 bytes in 5 chunks"), "{log}");

    let out = run_tool(img.path(), &["-v", "read", "/a.txt", "-"], b"");
    assert!(out.status.success());
    assert_eq!(out.stdout, data);
    assert!(String::from_utf8(out.stderr).unwrap().contains("5000 bytes in 5 chunks"));

    assert_eq!(read_via_fatfs(img.path(), "a.txt"), data);
}

#[test]
fn host_file_round_trip() {
    let img = image();
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("in.bin");
    let dst = dir.path().join("out.bin");
    let data = pattern(70_000);
    fs::write(&src, &data).unwrap();

    ok(img.path(), &["mkdir", "/data"]);
    ok(img.path(), &["write", src.to_str().unwrap(), "/data/big.bin"]);
    ok(img.path(), &["read", "/data/big.bin", dst.to_str().unwrap()]);
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn read_missing_source_leaves_no_host_file() {
    let img = image();
    let dir = TempDir::new().unwrap();
    let dst = dir.path().join("never.bin");

    let cli = Cli {
        image: img.path().to_path_buf(),
        read_only: false,
        verbose: 0,
        command: command::Command::Read { source: "/ghost".into(), dest: dst.clone() },
    };
    let err = command::run(&cli).unwrap_err();
    assert_eq!(err.to_string(), "could not open /ghost");
    assert!(!dst.exists());
}

#[test]
fn write_missing_host_source_fails() {
    let img = image();
    let stderr = fails(img.path(), &["write", "/definitely/not/here", "/x"]);
    assert!(stderr.starts_with("error: could not open /definitely/not/here"), "{stderr}");
}

// ── listing and stat ─────────────────────────────────────────────────────────

#[test]
fn ls_root_shows_directory_and_file() {
    let img = image();
    ok(img.path(), &["mkdir", "/sub"]);
    let out = run_tool(img.path(), &["write", "-", "/f.bin"], &pattern(2048));
    assert!(out.status.success());

    assert_eq!(ls(img.path(), "/"), "drwxrwxrwx 0 sub\n-rwxrwxrwx 2K f.bin\n");
}

#[test]
fn ls_nested_directory() {
    let img = image();
    ok(img.path(), &["mkdir", "/a"]);
    ok(img.path(), &["mkdir", "/a/b"]);
    run_tool(img.path(), &["write", "-", "/a/c.txt"], b"hello");
    assert_eq!(ls(img.path(), "/a"), "drwxrwxrwx 0 b\n-rwxrwxrwx 5 c.txt\n");
}

#[test]
fn stat_free_is_below_size() {
    let img = image();
    let out = String::from_utf8(ok(img.path(), &["stat"])).unwrap();
    let field = |name: &str| -> u64 {
        let line = out.lines().find(|l| l.starts_with(name)).unwrap();
        line[name.len()..].trim().trim_end_matches('M').parse().unwrap()
    };
    assert!(out.starts_with("ID: "));
    let (size, free) = (field("size:"), field("free:"));
    assert_eq!(size, 40);
    assert!(free > 0 && free < size, "free {free}M of {size}M");
}

// ── failures ─────────────────────────────────────────────────────────────────

#[test]
fn mkdir_missing_parent_fails() {
    let img = image();
    let stderr = fails(img.path(), &["mkdir", "/no/such"]);
    assert!(stderr.starts_with("error: mkdir failed"), "{stderr}");
    assert!(stderr.contains("no such file or directory"), "{stderr}");
}

#[test]
fn mkdir_twice_fails() {
    let img = image();
    ok(img.path(), &["mkdir", "/d"]);
    let stderr = fails(img.path(), &["mkdir", "/d"]);
    assert!(stderr.contains("already exists"), "{stderr}");
}

#[test]
fn rmdir_non_empty_fails() {
    let img = image();
    ok(img.path(), &["mkdir", "/d"]);
    run_tool(img.path(), &["write", "-", "/d/f"], b"x");

    let stderr = fails(img.path(), &["rmdir", "/d"]);
    assert!(stderr.starts_with("error: rmdir failed"), "{stderr}");
    assert!(ls(img.path(), "/").contains(" d\n"));

    ok(img.path(), &["unlink", "/d/f"]);
    ok(img.path(), &["rmdir", "/d"]);
    assert_eq!(ls(img.path(), "/"), "");
}

#[test]
fn read_only_flag_refuses_changes() {
    let img = image();
    let before = fs::read(img.path()).unwrap();
    fails(img.path(), &["--read-only", "mkdir", "/d"]);
    ok(img.path(), &["--read-only", "ls", "/"]);
    assert!(fs::read(img.path()).unwrap() == before, "image modified");
}

#[test]
fn not_an_image() {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(1024 * 1024).unwrap();
    let stderr = fails(file.path(), &["stat"]);
    assert!(stderr.starts_with("error: could not initialize fat image"), "{stderr}");
}

#[test]
fn usage_errors() {
    let img = image();
    let stderr = fails(img.path(), &["write", "-"]);
    assert!(stderr.contains("FAT_DEST_FILE"), "{stderr}");
    fails(img.path(), &["frobnicate"]);

    let out = Command::new(env!("CARGO_BIN_EXE_fatutil")).arg("--help").output().unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8(out.stdout).unwrap().contains("read"));
}
