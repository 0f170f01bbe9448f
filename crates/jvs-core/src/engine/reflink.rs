//! Reflink-copy engine: per-file copy-on-write via the platform's block-cloning
//! primitive (Linux `FICLONE`), falling back to byte-copy for unsupported file
//! types. Platform-gated; constructing this engine is an error on platforms or
//! filesystems without reflink support, so the selector can fall back at startup
//! (spec.md §4.1, Design Notes).

use super::{Engine, EngineKind};
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub struct ReflinkEngine;

impl ReflinkEngine {
    /// Probe the repository root for reflink support by attempting a reflink of a
    /// throwaway file. Errors (including on non-Linux platforms) are surfaced so the
    /// caller can fall back to byte-copy.
    pub fn probe(repo_root: &Path) -> Result<Self> {
        if !cfg!(target_os = "linux") {
            return Err(Error::invalid_input("reflink only supported on Linux"));
        }
        let probe_src = repo_root.join(format!(".jvs-reflink-probe-{}", std::process::id()));
        let probe_dst = repo_root.join(format!(".jvs-reflink-probe-{}.dst", std::process::id()));
        fs::write(&probe_src, b"probe").map_err(|e| Error::io(&probe_src, e))?;
        let result = reflink_file(&probe_src, &probe_dst);
        let _ = fs::remove_file(&probe_src);
        let _ = fs::remove_file(&probe_dst);
        result?;
        Ok(Self)
    }
}

impl Engine for ReflinkEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Reflink
    }

    fn clone_dir(&self, src: &Path, dst: &Path) -> Result<u64> {
        let mut bytes_moved = 0u64;
        self.clone_tree(src, dst, &mut bytes_moved)?;
        Ok(bytes_moved)
    }
}

impl ReflinkEngine {
    fn clone_tree(&self, src: &Path, dst: &Path, bytes_moved: &mut u64) -> Result<()> {
        let meta = fs::symlink_metadata(src).map_err(|e| Error::io(src, e))?;
        fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
        let mut perms = fs::metadata(dst).map_err(|e| Error::io(dst, e))?.permissions();
        perms.set_mode(meta.permissions().mode());
        fs::set_permissions(dst, perms).map_err(|e| Error::io(dst, e))?;

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
                self.clone_tree(&src_path, &dst_path, bytes_moved)?;
            } else {
                match reflink_file(&src_path, &dst_path) {
                    Ok(size) => *bytes_moved += size,
                    Err(_) => {
                        // Unsupported file type (e.g. a device node) for reflink:
                        // fall back to a plain byte copy of this entry.
                        if let Ok(contents) = fs::read(&src_path) {
                            let _ = fs::write(&dst_path, &contents);
                            *bytes_moved += contents.len() as u64;
                        }
                    }
                }
                let src_meta = fs::metadata(&src_path).map_err(|e| Error::io(&src_path, e))?;
                let mut perms = fs::metadata(&dst_path).map_err(|e| Error::io(&dst_path, e))?.permissions();
                perms.set_mode(src_meta.permissions().mode());
                fs::set_permissions(&dst_path, perms).map_err(|e| Error::io(&dst_path, e))?;
                set_mtime(&dst_path, src_meta.mtime(), src_meta.mtime_nsec())?;
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn reflink_file(src: &Path, dst: &Path) -> Result<u64> {
    const FICLONE: u64 = 0x40049409;

    let src_file = File::open(src).map_err(|e| Error::io(src, e))?;
    let dst_file = File::create(dst).map_err(|e| Error::io(dst, e))?;

    let ret = unsafe { libc_ioctl(dst_file.as_raw_fd(), FICLONE, src_file.as_raw_fd()) };
    if ret != 0 {
        // Filesystem/file type doesn't support reflink (e.g. tmpfs, special
        // files); drop the empty dst_file and let the caller fall back to a
        // plain byte copy for this entry.
        drop(dst_file);
        let _ = fs::remove_file(dst);
        return Err(Error::invalid_input("reflink ioctl failed for this entry"));
    }
    let size = src_file.metadata().map_err(|e| Error::io(src, e))?.len();
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn reflink_file(_src: &Path, _dst: &Path) -> Result<u64> {
    Err(Error::invalid_input("reflink only supported on Linux"))
}

#[cfg(target_os = "linux")]
unsafe fn libc_ioctl(fd: std::os::unix::io::RawFd, request: u64, arg: std::os::unix::io::RawFd) -> i32 {
    extern "C" {
        fn ioctl(fd: i32, request: u64, ...) -> i32;
    }
    ioctl(fd, request, arg)
}

fn set_mtime(path: &Path, secs: i64, nanos: i64) -> Result<()> {
    use std::time::{Duration, UNIX_EPOCH};
    let time = UNIX_EPOCH + Duration::new(secs.max(0) as u64, nanos.max(0) as u32);
    let file = File::options().write(true).open(path).map_err(|e| Error::io(path, e))?;
    file.set_modified(time).map_err(|e| Error::io(path, e))
}
