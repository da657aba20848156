use std::{
    fs::{copy, create_dir, exists, read_dir, read_link, remove_dir, remove_file, set_permissions, symlink_metadata, write, File, OpenOptions},
    io,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs2::FileExt;
use log::warn;
use walkdir::WalkDir;

/// Mirrors `lib_path_make`: recursively creates all missing parent
/// directories, tolerating an already-existing target.
pub fn make_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if exists(path)? {
        return Ok(());
    }
    std::fs::create_dir_all(path).with_context(|| format!("Failed to create directory `{}`", path.display()))
}

/// Recursively removes a file or directory tree, fixing up permissions on
/// anything not already writable so removal can't fail on a read-only
/// build output (mirrors `lib_path_delete`'s chmod-then-remove walk).
pub fn remove_recursive(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let meta = match symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat `{}`", path.display())),
    };

    if meta.is_dir() {
        let entries = read_dir(path).with_context(|| format!("Failed to read directory `{}`", path.display()))?;
        for entry in entries {
            remove_recursive(entry?.path())?;
        }
        remove_dir(path).with_context(|| format!("Failed to remove directory `{}`", path.display()))?;
        return Ok(());
    }

    if !meta.is_symlink() {
        let writable = PermissionsExt::from_mode(0o777);
        if meta.permissions() != writable {
            set_permissions(path, writable).with_context(|| format!("Failed to chmod `{}`", path.display()))?;
        }
    }

    remove_file(path).with_context(|| format!("Failed to remove `{}`", path.display()))
}

/// Deletes `path` if present and recreates it empty. Matches `lib_path_clean`.
pub fn clean(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    remove_recursive(path)?;
    make_dir(path)
}

/// Writes `data` to `path`, truncating any existing file. Matches
/// `lib_path_write`'s `"w"` mode.
pub fn write_file(path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Result<()> {
    write(path.as_ref(), data).with_context(|| format!("Failed to write `{}`", path.as_ref().display()))
}

/// Recursively copies `src`'s contents into `dest`, preserving symlinks and
/// the low 12 mode bits of regular files. A destination path that already
/// exists is left untouched and a warning is logged - conflicts do not fail
/// the copy. Matches `lib_path_copy`.
pub fn copy_recursive(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let meta = entry.metadata().context("Failed to stat source entry")?;
        let relative = entry.path().strip_prefix(src).context("Failed to compute relative path")?;
        let dest_path = dest.join(relative);

        if meta.is_dir() {
            if !exists(&dest_path)? {
                create_dir(&dest_path).with_context(|| format!("Failed to create directory `{}`", dest_path.display()))?;
            }
            continue;
        }

        if exists(&dest_path)? {
            warn!("Copy conflict on `{}`, skipping", dest_path.display());
            continue;
        }

        if meta.file_type().is_symlink() {
            let target = read_link(entry.path())?;
            symlink(target, &dest_path).with_context(|| format!("Failed to symlink `{}`", dest_path.display()))?;
            continue;
        }

        copy(entry.path(), &dest_path).with_context(|| format!("Failed to copy `{}` to `{}`", entry.path().display(), dest_path.display()))?;
        let mode = meta.permissions().mode() & 0o7777;
        set_permissions(&dest_path, PermissionsExt::from_mode(mode)).with_context(|| format!("Failed to chmod `{}`", dest_path.display()))?;
    }

    Ok(())
}

/// Acquires an exclusive, process-held lock on `path`, creating the file if
/// needed. Used to guard the whole cache for the lifetime of the process.
pub fn acquire_lockfile(path: impl AsRef<Path>) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path.as_ref())
        .with_context(|| format!("Failed to open lockfile `{}`", path.as_ref().display()))?;
    file.try_lock_exclusive().context("Another chariot process is already using this cache")?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn clean_creates_empty_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        clean(&target).unwrap();
        assert!(target.is_dir());
        assert_eq!(read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn copy_recursive_skips_conflicts() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        make_dir(&src).unwrap();
        make_dir(&dest).unwrap();

        write_file(src.join("file.txt"), b"new").unwrap();
        write_file(dest.join("file.txt"), b"old").unwrap();

        copy_recursive(&src, &dest).unwrap();

        assert_eq!(std::fs::read(dest.join("file.txt")).unwrap(), b"old");
    }

    #[test]
    fn copy_recursive_preserves_mode() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        make_dir(&src).unwrap();
        make_dir(&dest).unwrap();

        let file = src.join("run.sh");
        write_file(&file, b"#!/bin/sh\n").unwrap();
        set_permissions(&file, PermissionsExt::from_mode(0o755)).unwrap();

        copy_recursive(&src, &dest).unwrap();

        let mode = std::fs::metadata(dest.join("run.sh")).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn remove_recursive_handles_missing_path() {
        let dir = tempdir().unwrap();
        remove_recursive(dir.path().join("does-not-exist")).unwrap();
    }
}
