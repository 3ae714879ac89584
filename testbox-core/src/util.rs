//! Small shared helpers: poison-tolerant locking and directory walking.

use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use walkdir::WalkDir;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its data consistent before any
/// call that could panic, so the poisoned value is still valid.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

/// Total size in bytes of all regular files below `root`.
pub(crate) fn dir_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Recursively copy `src` into `dst`, creating `dst` if needed.
pub(crate) fn copy_dir(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut copied = 0;
    std::fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            copied += std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

/// Replace the contents of `dst` with a copy of `src`.
pub(crate) fn replace_dir(src: &Path, dst: &Path) -> io::Result<u64> {
    if dst.exists() {
        std::fs::remove_dir_all(dst)?;
    }
    copy_dir(src, dst)
}
