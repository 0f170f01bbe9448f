//! Filesystem primitives: atomic rename, fsync discipline, and path validation.
//!
//! Every mutating operation in the engine funnels its durability-sensitive writes
//! through these helpers so that the crash-safety invariants in the snapshot publish
//! protocol hold regardless of which component is writing.

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Write `contents` to `final_path` via a temp-file-then-rename sequence, fsyncing
/// both the file and the containing directory before returning.
pub fn atomic_write(final_path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = tmp_path_for(final_path);
    {
        let mut f = File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?;
        use std::io::Write;
        f.write_all(contents).map_err(|e| Error::io(&tmp_path, e))?;
        f.sync_all().map_err(|e| Error::io(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, final_path).map_err(|e| Error::io(final_path, e))?;
    fsync_dir(parent_of(final_path))?;
    Ok(())
}

/// Rename `from` to `to` and fsync `to`'s parent directory.
pub fn atomic_rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| Error::io(to, e))?;
    fsync_dir(parent_of(to))?;
    Ok(())
}

/// fsync the given directory (durability of a prior rename/create within it).
pub fn fsync_dir(dir: &Path) -> Result<()> {
    let f = File::open(dir).map_err(|e| Error::io(dir, e))?;
    f.sync_all().map_err(|e| Error::io(dir, e))?;
    Ok(())
}

/// Create a zero-byte file at `path`, fsyncing the file and its parent directory.
pub fn touch_fsync(path: &Path) -> Result<()> {
    File::create(path).map_err(|e| Error::io(path, e))?.sync_all().map_err(|e| Error::io(path, e))?;
    fsync_dir(parent_of(path))?;
    Ok(())
}

/// The conventional temp-file path for a final artifact path: `<path>.tmp`.
pub fn tmp_path_for(final_path: &Path) -> PathBuf {
    let mut s = final_path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

/// Remove a path (file or directory tree) if present; absence is not an error.
/// Used by GC commit and doctor cleanup, where "already gone" and "removed now"
/// must be indistinguishable outcomes.
pub fn remove_if_present(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(|e| Error::io(path, e)),
        Ok(_) => fs::remove_file(path).map_err(|e| Error::io(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Validate that `name` is a conservative ASCII identifier: letters, digits, `-`,
/// `_`, `.`, 1-64 characters. Used for worktree names, tags, and ref names
/// (spec.md invariant 6, Open Question: worktree name grammar).
pub fn valid_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

/// Validate a partial-snapshot path: relative, non-empty, no `..` component, no
/// absolute root, no empty components (spec.md invariant 7).
pub fn valid_partial_path(rel: &str) -> bool {
    if rel.is_empty() {
        return false;
    }
    let path = Path::new(rel);
    if path.is_absolute() {
        return false;
    }
    path.components().all(|c| matches!(c, std::path::Component::Normal(_)))
}

/// Join `root` with a validated relative path, erroring rather than allowing escape
/// if validation somehow slipped through (defense at the single call site that
/// touches the filesystem with a caller-supplied path).
pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    if !valid_partial_path(rel) {
        return Err(Error::invalid_input(format!("unsafe relative path: {rel}")));
    }
    Ok(root.join(rel))
}
