//! The local binary/symbol cache.
//!
//! Binaries and `.dSYM` bundles live on a server share; the debugger wants
//! to memory-map them, so they are copied into a local cache first. Several
//! reader processes may populate the same entry at the same time: each one
//! copies into a uniquely named sibling and publishes it with an exclusive
//! rename, so a cache path either does not exist yet or is complete.

use crate::errors::Error;
use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::Command,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Makes `target` present in the cache.
///
/// - already cached: returns `target`;
/// - `source` exists: copies it (recursively, it may be a `.dSYM` bundle)
///   next to `target` and publishes it with an exclusive rename, returning
///   `target` whether this process or a racing one won;
/// - `source` is gone too (a stale index entry): returns `None`.
///
/// The copy is delegated to `/bin/cp -R`; in-process copy routines have
/// silently truncated files coming off SMBv2 shares. If `cp` itself fails
/// the uncached source path is returned so the caller can still use it.
pub fn cache_file(source: &Path, target: &Path) -> Result<Option<PathBuf>, Error> {
    if target.exists() {
        return Ok(Some(target.to_owned()));
    }
    if !source.exists() {
        return Ok(None);
    }

    let parent = target
        .parent()
        .ok_or(Error::LoadFailed("cache target has no parent directory"))?;
    std::fs::create_dir_all(parent)?;
    let staging = staging_name(parent);

    let status = Command::new("/bin/cp")
        .arg("-R")
        .arg(source)
        .arg(&staging)
        .status()?;
    if !status.success() {
        log::warn!(
            "cp -R {} failed ({status}); using the uncached copy",
            source.display()
        );
        remove_entry(&staging);
        return Ok(Some(source.to_owned()));
    }

    // An incomplete copy must never be published; a truncated cache entry
    // would poison every later session.
    let copied = entry_size(&staging)?;
    let original = entry_size(source)?;
    assert!(
        copied == original,
        "cache copy of {} is {copied} bytes instead of {original}",
        source.display()
    );

    match exclusive_rename(&staging, target) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            // another process published first; ours is redundant
            remove_entry(&staging);
        }
        Err(err) => {
            remove_entry(&staging);
            return Err(err.into());
        }
    }

    Ok(Some(target.to_owned()))
}

/// A sibling name no concurrent caller will pick: pid plus an in-process
/// counter.
fn staging_name(parent: &Path) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    parent.join(format!(".staging-{}-{n}", std::process::id()))
}

/// The size of a regular file, or the recursive sum of file sizes for a
/// directory bundle.
fn entry_size(path: &Path) -> Result<u64, Error> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        total += entry_size(&entry.path())?;
    }
    Ok(total)
}

fn remove_entry(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(err) = result {
        log::warn!("failed to clean up {}: {err}", path.display());
    }
}

/// Renames `from` to `to`, failing with `AlreadyExists` if `to` is there,
/// atomically. This is the serialization point between racing cachers.
fn exclusive_rename(from: &Path, to: &Path) -> io::Result<()> {
    let from_c = path_to_cstring(from)?;
    let to_c = path_to_cstring(to)?;

    if rename_excl(&from_c, &to_c) == 0 {
        Ok(())
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            Err(io::Error::new(io::ErrorKind::AlreadyExists, err))
        } else {
            Err(err)
        }
    }
}

/// `renamex_np(RENAME_EXCL)`, the exclusive rename Darwin exposes.
#[cfg(target_os = "macos")]
#[allow(unsafe_code)]
fn rename_excl(from: &std::ffi::CStr, to: &std::ffi::CStr) -> libc::c_int {
    // SAFETY: syscall over valid C strings
    unsafe { libc::renamex_np(from.as_ptr(), to.as_ptr(), libc::RENAME_EXCL) }
}

/// The same semantics via `renameat2(RENAME_NOREPLACE)`, so the cache (and
/// its tests) behave identically on non-mac hosts.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn rename_excl(from: &std::ffi::CStr, to: &std::ffi::CStr) -> libc::c_int {
    // SAFETY: syscall over valid C strings
    unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            from.as_ptr(),
            libc::AT_FDCWD,
            to.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    }
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_err| io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul byte"))
}
