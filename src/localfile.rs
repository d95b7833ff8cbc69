//! Local file helpers: streaming digests, checked copies and tolerant
//! directory removal.

use crate::error::{NetError, Result};
use crate::settings::{self, COPY_BUFFER_SIZE, PARTIAL_SUFFIX, SLEEP_ON_DISK_FULL_MS};
use crate::status;
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Read until `buf` is full or EOF; returns the bytes actually read.
pub(crate) fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Hex SHA-1 digest and size of a local file.
pub fn file_checksum(path: &Path) -> Result<(String, u64)> {
    let fail = || NetError::LocalFile { path: path.into() };
    let mut file = File::open(path).map_err(|_| fail())?;
    let size = file.metadata().map_err(|_| fail())?.len();
    let mut ctx = Sha1::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
        let got = read_full(&mut file, &mut buf[..want]).map_err(|_| fail())?;
        if got == 0 {
            return Err(fail());
        }
        ctx.update(&buf[..got]);
        remaining -= got as u64;
    }
    Ok((hex::encode(ctx.finalize()), size))
}

#[cfg(unix)]
fn is_disk_full(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
}

#[cfg(not(unix))]
fn is_disk_full(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Other
}

/// Write all of `buf`, maintaining the process-wide disk-full flag: a
/// failed write with `ENOSPC`/`EDQUOT` raises it and backs off before
/// reporting the error, a completed write clears it.
pub fn write_all_check_overquota(file: &mut File, buf: &[u8]) -> io::Result<()> {
    let mut rest = buf;
    while !rest.is_empty() {
        match file.write(rest) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => rest = &rest[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if is_disk_full(&e) {
                    status::set_local_disk_full(true);
                    thread::sleep(Duration::from_millis(SLEEP_ON_DISK_FULL_MS));
                }
                return Err(e);
            }
        }
    }
    status::set_local_disk_full(false);
    Ok(())
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut os = destination.as_os_str().to_os_string();
    os.push(PARTIAL_SUFFIX);
    PathBuf::from(os)
}

/// Copy `source` to `destination` if and only if the source still has
/// the expected size and SHA-1. The copy streams through a `.part`
/// file that is fsynced, verified and atomically renamed into place;
/// any drift deletes the partial and fails permanently.
pub fn copy_if_checksum_matches(
    source: &Path,
    destination: &Path,
    expected_hex: &str,
    expected_size: u64,
) -> Result<()> {
    let fail_src = || NetError::LocalFile { path: source.into() };
    let mut src = File::open(source).map_err(|_| fail_src())?;
    if src.metadata().map_err(|_| fail_src())?.len() != expected_size {
        return Err(fail_src());
    }
    let tmp = partial_path(destination);
    let cleanup = |tmp: &Path| {
        if let Err(e) = fs::remove_file(tmp) {
            tracing::debug!("cannot remove partial {}: {}", tmp.display(), e);
        }
    };
    let mut dst = File::create(&tmp).map_err(|_| NetError::LocalFile {
        path: destination.into(),
    })?;
    let mut ctx = Sha1::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut remaining = expected_size;
    while remaining > 0 {
        let want = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
        let got = match read_full(&mut src, &mut buf[..want]) {
            Ok(0) | Err(_) => {
                cleanup(&tmp);
                return Err(fail_src());
            }
            Ok(n) => n,
        };
        if write_all_check_overquota(&mut dst, &buf[..got]).is_err() {
            cleanup(&tmp);
            return Err(NetError::LocalFile {
                path: destination.into(),
            });
        }
        ctx.update(&buf[..got]);
        remaining -= got as u64;
    }
    let digest = hex::encode(ctx.finalize());
    if digest != expected_hex {
        cleanup(&tmp);
        return Err(NetError::ChecksumMismatch {
            path: source.into(),
        });
    }
    if dst.sync_all().is_err() {
        cleanup(&tmp);
        return Err(NetError::LocalFile {
            path: destination.into(),
        });
    }
    drop(dst);
    fs::rename(&tmp, destination).map_err(|_| {
        cleanup(&tmp);
        NetError::LocalFile {
            path: destination.into(),
        }
    })?;
    Ok(())
}

/// Delete everything inside `path`, ignoring entries that refuse to go.
fn rm_all_children(path: &Path) -> io::Result<()> {
    for entry in fs::read_dir(path)? {
        let Ok(entry) = entry else { continue };
        let child = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            let _ = rm_all_children(&child);
            let _ = fs::remove_dir(&child);
        } else {
            let _ = fs::remove_file(&child);
        }
    }
    Ok(())
}

/// Remove a directory tree, tolerating undeletable entries; the final
/// rmdir reports whether the tree is really gone.
pub fn rmdir_recursive(path: &Path) -> io::Result<()> {
    rm_all_children(path)?;
    fs::remove_dir(path)
}

#[cfg(unix)]
fn not_empty(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == libc::ENOTEMPTY || code == libc::EEXIST)
}

#[cfg(not(unix))]
fn not_empty(_e: &io::Error) -> bool {
    true
}

/// Remove a directory that may still hold OS litter: try the plain
/// rmdir, and when the directory is not empty, delete only the entries
/// matching the ignore patterns before trying again. An ignored entry
/// that is itself a directory is removed with the predicate-free
/// recursive walk; non-ignored directories are not descended into.
pub fn rmdir_with_trashes(path: &Path) -> io::Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => return Ok(()),
        Err(e) if not_empty(&e) => {}
        Err(e) => return Err(e),
    }
    for entry in fs::read_dir(path)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !settings::is_name_ignored(name) {
            continue;
        }
        let child = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            let _ = rm_all_children(&child);
            let _ = fs::remove_dir(&child);
        } else {
            let _ = fs::remove_file(&child);
        }
    }
    fs::remove_dir(path)
}
