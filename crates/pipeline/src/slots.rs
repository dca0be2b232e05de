//! Whole-directory moves between instance slots.
//!
//! Slots are only ever moved, copied or cleared as a unit. Renames fall back
//! to copy-and-delete when a slot override puts two slots on different
//! filesystems.

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use rotor_core::{Error, Layout, Result, Slot};

/// What a carry-over pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CarryOverStats {
    pub copied: usize,
    pub skipped: usize,
}

/// Delete `old`, rotate `previous` into `old`, snapshot `current`
/// into `previous` and leave `upcoming` empty.
///
/// # Errors
///
/// Returns a filesystem error naming the path that could not be changed.
pub fn purge(layout: &Layout) -> Result<()> {
    let old = layout.slot(Slot::Old);
    let previous = layout.slot(Slot::Previous);
    let current = layout.slot(Slot::Current);
    let upcoming = layout.slot(Slot::Upcoming);

    remove_dir(old)?;
    if previous.exists() {
        move_dir(previous, old)?;
    }
    if current.exists() {
        copy_tree(current, previous)?;
    }
    clear_dir(upcoming)?;

    info!(root = %layout.root().display(), "slots rotated");
    Ok(())
}

/// Remove everything under `path`, leaving it as an empty directory.
///
/// # Errors
///
/// Returns a filesystem error.
pub fn clear_dir(path: &Path) -> Result<()> {
    remove_dir(path)?;
    create_dir(path)
}

/// Move a tree prepared elsewhere into the `upcoming` slot.
///
/// # Errors
///
/// Returns `DirectoryNotFound` if `staged` is missing, or a filesystem error.
pub fn adopt_upcoming(layout: &Layout, staged: &Path) -> Result<()> {
    let upcoming = layout.slot(Slot::Upcoming);
    if staged == upcoming {
        return Ok(());
    }
    if !staged.is_dir() {
        return Err(Error::DirectoryNotFound {
            path: staged.to_path_buf(),
        });
    }
    remove_dir(upcoming)?;
    move_dir(staged, upcoming)
}

/// Park `current` as the retired instance and move `upcoming` into its place.
///
/// # Errors
///
/// Returns a filesystem error; a failure after `current` was parked is
/// undone before returning.
pub fn promote(layout: &Layout) -> Result<()> {
    let current = layout.slot(Slot::Current);
    let upcoming = layout.slot(Slot::Upcoming);
    let retired = layout.retired();

    if !upcoming.is_dir() {
        return Err(Error::DirectoryNotFound {
            path: upcoming.to_path_buf(),
        });
    }
    remove_dir(&retired)?;
    if current.exists() {
        move_dir(current, &retired)?;
    }
    if let Err(e) = move_dir(upcoming, current) {
        if retired.exists() {
            move_dir(&retired, current)?;
        }
        return Err(e);
    }
    debug!(current = %current.display(), "upcoming promoted");
    Ok(())
}

/// Undo [`promote`]: the promoted tree goes back to `upcoming` and the
/// retired instance becomes `current` again.
///
/// # Errors
///
/// Returns a filesystem error.
pub fn rollback(layout: &Layout) -> Result<()> {
    let current = layout.slot(Slot::Current);
    let upcoming = layout.slot(Slot::Upcoming);
    let retired = layout.retired();

    if !retired.exists() {
        return Ok(());
    }
    if current.exists() {
        remove_dir(upcoming)?;
        move_dir(current, upcoming)?;
    }
    move_dir(&retired, current)?;
    info!(current = %current.display(), "swap rolled back");
    Ok(())
}

/// Drop the retired instance once the new child runs. Its content already
/// lives in `previous`.
///
/// # Errors
///
/// Returns a filesystem error.
pub fn discard_retired(layout: &Layout) -> Result<()> {
    remove_dir(&layout.retired())
}

/// Copy `patterns` (globs relative to `from`) into `to`, skipping
/// files that are already byte-identical.
///
/// # Errors
///
/// Returns `InvalidConfig` for a malformed pattern or a filesystem error.
pub fn carry_over(from: &Path, to: &Path, patterns: &[String]) -> Result<CarryOverStats> {
    let mut stats = CarryOverStats::default();
    if !from.is_dir() {
        return Ok(stats);
    }

    for pattern in patterns {
        let full = from.join(pattern);
        let matches = glob::glob(&full.to_string_lossy())
            .map_err(|e| Error::invalid_config("carry_over", format!("{pattern:?}: {e}")))?;

        for entry in matches {
            let path = entry.map_err(|e| Error::file_read_failed(e.path(), e.to_string()))?;
            for source in walk(&path)? {
                let Ok(relative) = source.strip_prefix(from) else {
                    continue;
                };
                let target = to.join(relative);
                if source.is_dir() && !source.is_symlink() {
                    create_dir(&target)?;
                } else if same_file(&source, &target)? {
                    stats.skipped += 1;
                } else {
                    copy_entry(&source, &target)?;
                    stats.copied += 1;
                }
            }
        }
    }

    debug!(copied = stats.copied, skipped = stats.skipped, "carry-over done");
    Ok(stats)
}

/// Byte-for-byte comparison. Two missing files are identical; a missing and
/// a present file are not. Symlinks compare by target.
///
/// # Errors
///
/// Returns `FileReadFailed` when either side exists but cannot be read.
pub fn same_file(a: &Path, b: &Path) -> Result<bool> {
    let (meta_a, meta_b) = match (fs::symlink_metadata(a), fs::symlink_metadata(b)) {
        (Err(ea), Err(eb)) if ea.kind() == ErrorKind::NotFound && eb.kind() == ErrorKind::NotFound => {
            return Ok(true);
        }
        (Err(e), _) | (_, Err(e)) if e.kind() == ErrorKind::NotFound => return Ok(false),
        (Err(e), _) => return Err(Error::file_read_failed(a, e.to_string())),
        (_, Err(e)) => return Err(Error::file_read_failed(b, e.to_string())),
        (Ok(ma), Ok(mb)) => (ma, mb),
    };

    if meta_a.file_type().is_symlink() || meta_b.file_type().is_symlink() {
        return Ok(meta_a.file_type().is_symlink()
            && meta_b.file_type().is_symlink()
            && fs::read_link(a).ok() == fs::read_link(b).ok());
    }
    if meta_a.is_dir() || meta_b.is_dir() || meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut file_a = fs::File::open(a).map_err(|e| Error::file_read_failed(a, e.to_string()))?;
    let mut file_b = fs::File::open(b).map_err(|e| Error::file_read_failed(b, e.to_string()))?;
    let mut buf_a = [0_u8; 8192];
    let mut buf_b = [0_u8; 8192];
    loop {
        let n = file_a
            .read(&mut buf_a)
            .map_err(|e| Error::file_read_failed(a, e.to_string()))?;
        if n == 0 {
            return Ok(true);
        }
        let (Some(chunk_a), Some(chunk_b)) = (buf_a.get(..n), buf_b.get_mut(..n)) else {
            return Ok(false);
        };
        file_b
            .read_exact(chunk_b)
            .map_err(|e| Error::file_read_failed(b, e.to_string()))?;
        if chunk_a != chunk_b {
            return Ok(false);
        }
    }
}

/// A missing directory counts as empty.
///
/// # Errors
///
/// Returns `FileReadFailed` if the directory exists but cannot be listed.
pub fn is_empty_dir(path: &Path) -> Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(Error::file_read_failed(path, e.to_string())),
    }
}

/// Recursive copy of `from` into `to`, preserving symlinks.
///
/// # Errors
///
/// Returns a filesystem error naming the failing path.
pub fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map_or_else(|| from.to_path_buf(), Path::to_path_buf);
            Error::file_read_failed(path, e.to_string())
        })?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            create_dir(&target)?;
        } else {
            copy_entry(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rename, or copy and delete when the rename crosses filesystems.
fn move_dir(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        create_dir(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            copy_tree(from, to)?;
            remove_dir(from)
        }
        Err(e) => Err(Error::file_write_failed(to, format!("rename from {}: {e}", from.display()))),
    }
}

fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::file_write_failed(path, format!("remove: {e}"))),
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::directory_creation_failed(path, e.to_string()))
}

fn walk(root: &Path) -> Result<Vec<PathBuf>> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .map(|entry| {
            entry.map(walkdir::DirEntry::into_path).map_err(|e| {
                let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                Error::file_read_failed(path, e.to_string())
            })
        })
        .collect()
}

fn copy_entry(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        create_dir(parent)?;
    }
    let meta = fs::symlink_metadata(source).map_err(|e| Error::file_read_failed(source, e.to_string()))?;
    if meta.file_type().is_symlink() {
        return copy_symlink(source, target);
    }
    if fs::symlink_metadata(target).is_ok_and(|m| m.file_type().is_symlink()) {
        fs::remove_file(target).map_err(|e| Error::file_write_failed(target, e.to_string()))?;
    }
    fs::copy(source, target)
        .map(drop)
        .map_err(|e| Error::file_write_failed(target, format!("copy from {}: {e}", source.display())))
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> Result<()> {
    let link = fs::read_link(source).map_err(|e| Error::file_read_failed(source, e.to_string()))?;
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(Error::file_write_failed(target, e.to_string())),
    }
    std::os::unix::fs::symlink(&link, target).map_err(|e| Error::file_write_failed(target, e.to_string()))
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> Result<()> {
    fs::copy(source, target)
        .map(drop)
        .map_err(|e| Error::file_write_failed(target, e.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn layout() -> (tempfile::TempDir, Layout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        (dir, layout)
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_purge_rotates_every_slot() {
        let (_dir, layout) = layout();
        write(&layout.slot(Slot::Old).join("v.txt"), "v0");
        write(&layout.slot(Slot::Previous).join("v.txt"), "v1");
        write(&layout.slot(Slot::Current).join("v.txt"), "v2");
        write(&layout.slot(Slot::Upcoming).join("half.txt"), "junk");

        purge(&layout).unwrap();

        assert_eq!(read(&layout.slot(Slot::Old).join("v.txt")), "v1");
        assert_eq!(read(&layout.slot(Slot::Previous).join("v.txt")), "v2");
        assert_eq!(read(&layout.slot(Slot::Current).join("v.txt")), "v2");
        assert!(is_empty_dir(layout.slot(Slot::Upcoming)).unwrap());
        assert!(layout.slot(Slot::Upcoming).is_dir());
    }

    #[test]
    fn test_purge_on_fresh_root_creates_empty_upcoming() {
        let (_dir, layout) = layout();

        purge(&layout).unwrap();

        assert!(!layout.slot(Slot::Old).exists());
        assert!(!layout.slot(Slot::Previous).exists());
        assert!(is_empty_dir(layout.slot(Slot::Upcoming)).unwrap());
    }

    #[test]
    fn test_promote_then_rollback_restores_both_slots() {
        let (_dir, layout) = layout();
        write(&layout.slot(Slot::Current).join("v.txt"), "live");
        write(&layout.slot(Slot::Upcoming).join("v.txt"), "next");

        promote(&layout).unwrap();
        assert_eq!(read(&layout.slot(Slot::Current).join("v.txt")), "next");
        assert_eq!(read(&layout.retired().join("v.txt")), "live");
        assert!(!layout.slot(Slot::Upcoming).exists());

        rollback(&layout).unwrap();
        assert_eq!(read(&layout.slot(Slot::Current).join("v.txt")), "live");
        assert_eq!(read(&layout.slot(Slot::Upcoming).join("v.txt")), "next");
        assert!(!layout.retired().exists());
    }

    #[test]
    fn test_promote_without_upcoming_is_rejected() {
        let (_dir, layout) = layout();
        write(&layout.slot(Slot::Current).join("v.txt"), "live");

        assert!(promote(&layout).is_err());
        assert_eq!(read(&layout.slot(Slot::Current).join("v.txt")), "live");
    }

    #[test]
    fn test_carry_over_copies_changed_and_skips_identical() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        write(&from.join(".env"), "SECRET=1");
        write(&from.join("node_modules/a/index.js"), "a");
        write(&from.join("node_modules/b/index.js"), "b");
        write(&from.join("src/app.js"), "not carried");
        write(&to.join("node_modules/a/index.js"), "a");

        let patterns = vec![".env".to_string(), "node_modules".to_string()];
        let stats = carry_over(&from, &to, &patterns).unwrap();

        assert_eq!(stats, CarryOverStats { copied: 2, skipped: 1 });
        assert_eq!(read(&to.join(".env")), "SECRET=1");
        assert_eq!(read(&to.join("node_modules/b/index.js")), "b");
        assert!(!to.join("src/app.js").exists());
    }

    #[test]
    fn test_carry_over_from_missing_current_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let stats = carry_over(&dir.path().join("nope"), dir.path(), &[".env".to_string()]).unwrap();
        assert_eq!(stats, CarryOverStats::default());
    }

    #[test]
    fn test_same_file_rules() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        assert!(same_file(&a, &b).unwrap(), "both missing");

        write(&a, "x");
        assert!(!same_file(&a, &b).unwrap(), "one missing");

        write(&b, "x");
        assert!(same_file(&a, &b).unwrap());

        write(&b, "y");
        assert!(!same_file(&a, &b).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_keeps_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        write(&from.join("bin/tool.js"), "tool");
        std::os::unix::fs::symlink("../bin/tool.js", from.join("bin/link")).unwrap();

        let to = dir.path().join("to");
        copy_tree(&from, &to).unwrap();

        let link = to.join("bin/link");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("../bin/tool.js"));
    }
}
