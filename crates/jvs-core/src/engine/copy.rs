//! Byte-copy engine: a recursive walk that preserves mode bits, modification time,
//! and symlink targets. Always available (spec.md §4.1).

use super::{Engine, EngineKind};
use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

#[derive(Default)]
pub struct CopyEngine;

impl CopyEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for CopyEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Copy
    }

    fn clone_dir(&self, src: &Path, dst: &Path) -> Result<u64> {
        let mut bytes_moved = 0u64;
        copy_tree(src, dst, &mut bytes_moved)?;
        Ok(bytes_moved)
    }
}

fn copy_tree(src: &Path, dst: &Path, bytes_moved: &mut u64) -> Result<()> {
    let meta = fs::symlink_metadata(src).map_err(|e| Error::io(src, e))?;
    fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
    set_mode(dst, meta.permissions().mode())?;

    let mut entries: Vec<_> = fs::read_dir(src)
        .map_err(|e| Error::io(src, e))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::io(src, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| Error::io(&src_path, e))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path).map_err(|e| Error::io(&src_path, e))?;
            symlink(&target, &dst_path).map_err(|e| Error::io(&dst_path, e))?;
        } else if file_type.is_dir() {
            copy_tree(&src_path, &dst_path, bytes_moved)?;
        } else {
            let contents = fs::read(&src_path).map_err(|e| Error::io(&src_path, e))?;
            fs::write(&dst_path, &contents).map_err(|e| Error::io(&dst_path, e))?;
            *bytes_moved += contents.len() as u64;

            let src_meta = fs::metadata(&src_path).map_err(|e| Error::io(&src_path, e))?;
            set_mode(&dst_path, src_meta.permissions().mode())?;
            set_mtime(&dst_path, src_meta.mtime(), src_meta.mtime_nsec())?;
        }
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path).map_err(|e| Error::io(path, e))?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms).map_err(|e| Error::io(path, e))
}

fn set_mtime(path: &Path, secs: i64, nanos: i64) -> Result<()> {
    let time = UNIX_EPOCH + Duration::new(secs.max(0) as u64, nanos.max(0) as u32);
    let file = fs::File::options().write(true).open(path).map_err(|e| Error::io(path, e))?;
    file.set_modified(time).map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::payload_root_hash;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn copy_preserves_hash() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::File::create(src.path().join("sub/a.txt")).unwrap().write_all(b"hi").unwrap();
        symlink("a.txt", src.path().join("sub/link")).unwrap();

        let dst = TempDir::new().unwrap().path().join("clone");
        CopyEngine::new().clone_dir(src.path(), &dst).unwrap();

        assert_eq!(
            payload_root_hash(src.path()).unwrap(),
            payload_root_hash(&dst).unwrap()
        );
    }
}
