//! Restore: replace a worktree's payload with a prior snapshot's payload, in
//! full or in part (spec.md §4.5).

use crate::audit::AuditLog;
use crate::descriptor::Descriptor;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::repo::Repository;
use crate::snapshot::{decompress_file, decompress_tree, SnapshotEngine};
use crate::verify::verify_snapshot;

pub struct RestoreEngine {
    repo: Repository,
}

impl RestoreEngine {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Restore `worktree`'s payload to `snapshot_id`. Verifies integrity
    /// first. A full snapshot replaces the entire payload directory; a
    /// partial snapshot (published with `partial_paths`) replaces only those
    /// recorded relative paths, leaving every sibling path in the worktree
    /// untouched (spec.md §4.5).
    pub fn restore(&self, worktree: &str, snapshot_id: &str, engine: &dyn Engine) -> Result<()> {
        let snaps = SnapshotEngine::new(self.repo.clone());
        let outcome = verify_snapshot(&self.repo, snapshot_id, false)?;
        if !outcome.ok {
            return Err(Error::IntegrityTamper {
                snapshot_id: snapshot_id.to_string(),
                detail: outcome.detail,
            });
        }
        let descriptor = snaps.get(snapshot_id)?;

        let wt_mgr = self.repo.worktree_manager();
        let _ = wt_mgr.get(worktree)?;

        match &descriptor.partial_paths {
            Some(paths) => self.restore_partial(worktree, snapshot_id, paths, &descriptor)?,
            None => self.restore_full(worktree, snapshot_id, &descriptor, engine)?,
        }

        let wt = wt_mgr.get(worktree)?;
        let latest = wt.latest.clone();
        wt_mgr.update_pointers(worktree, Some(snapshot_id), latest.as_deref())?;

        AuditLog::new(&self.repo.jvs_dir()).append(
            "worktree.restore",
            Some(worktree),
            Some(snapshot_id),
            "restored payload from snapshot",
        )?;
        Ok(())
    }

    /// Full-payload restore: clone into a temp directory, decompress if
    /// needed, then atomically swap it in, keeping a `.bak` of the prior
    /// payload until the swap is confirmed so a failure partway through
    /// never leaves the worktree without a payload at all.
    fn restore_full(&self, worktree: &str, snapshot_id: &str, descriptor: &Descriptor, engine: &dyn Engine) -> Result<()> {
        let snaps = SnapshotEngine::new(self.repo.clone());
        let payload_src = snaps.payload_path(snapshot_id);
        let payload_dst = self.repo.worktree_payload_path(worktree);
        let tmp_dst = payload_dst.with_extension("restore-tmp");
        let backup_dst = payload_dst.with_extension("restore-bak");

        fsutil::remove_if_present(&tmp_dst)?;
        engine.clone_dir(&payload_src, &tmp_dst)?;
        if descriptor.compression.is_some() {
            decompress_tree(&tmp_dst)?;
        }

        fsutil::remove_if_present(&backup_dst)?;
        if payload_dst.exists() {
            fsutil::atomic_rename(&payload_dst, &backup_dst)?;
        }
        if let Err(e) = fsutil::atomic_rename(&tmp_dst, &payload_dst) {
            // Roll back: put the original payload back where it was.
            if backup_dst.exists() {
                let _ = fsutil::atomic_rename(&backup_dst, &payload_dst);
            }
            return Err(e);
        }
        fsutil::remove_if_present(&backup_dst)?;
        Ok(())
    }

    /// Partial-payload restore: for each recorded relative path, stage the
    /// corresponding subtree from the snapshot's payload (decompressing it if
    /// the snapshot was compressed), then atomically swap only that path into
    /// the worktree payload. Every path outside `paths` is left exactly as it
    /// was (spec.md §4.5).
    fn restore_partial(&self, worktree: &str, snapshot_id: &str, paths: &[String], descriptor: &Descriptor) -> Result<()> {
        let snaps = SnapshotEngine::new(self.repo.clone());
        let snapshot_payload = snaps.payload_path(snapshot_id);
        let worktree_payload = self.repo.worktree_payload_path(worktree);

        for rel in paths {
            let dst = fsutil::safe_join(&worktree_payload, rel)?;
            let tmp = dst.with_extension("restore-tmp");
            fsutil::remove_if_present(&tmp)?;
            if let Some(parent) = tmp.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }

            let src = fsutil::safe_join(&snapshot_payload, rel)?;
            let gz_src = snapshot_payload.join(format!("{rel}.gz"));
            if src.is_dir() {
                copy_dir_recursive(&src, &tmp)?;
                if descriptor.compression.is_some() {
                    decompress_tree(&tmp)?;
                }
            } else if gz_src.is_file() {
                decompress_file(&gz_src, &tmp)?;
            } else {
                std::fs::copy(&src, &tmp).map_err(|e| Error::io(&tmp, e))?;
            }

            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            fsutil::remove_if_present(&dst)?;
            fsutil::atomic_rename(&tmp, &dst)?;
        }
        Ok(())
    }

    /// Restore `worktree` to its own `latest` pointer, exiting the detached
    /// state without forking (spec.md §4.3).
    pub fn restore_to_latest(&self, worktree: &str, engine: &dyn Engine) -> Result<()> {
        let wt = self.repo.worktree_manager().get(worktree)?;
        let latest = wt
            .latest
            .ok_or_else(|| Error::precondition_failed(format!("worktree '{worktree}' has no snapshots yet")))?;
        self.restore(worktree, &latest, engine)
    }
}

fn copy_dir_recursive(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
    for entry in std::fs::read_dir(src).map_err(|e| Error::io(src, e))? {
        let entry = entry.map_err(|e| Error::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| Error::io(&from, e))?;
        if file_type.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| Error::io(&to, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CopyEngine;
    use crate::snapshot::PublishOptions;
    use tempfile::TempDir;

    #[test]
    fn restore_replaces_payload_and_sets_head() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let snaps = SnapshotEngine::new(repo.clone());
        let d1 = snaps
            .publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() })
            .unwrap();

        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v2-changed").unwrap();
        snaps
            .publish("main", &engine, PublishOptions { note: "v2".into(), ..Default::default() })
            .unwrap();

        let restorer = RestoreEngine::new(repo.clone());
        restorer.restore("main", &d1.snapshot_id, &engine).unwrap();

        let contents = std::fs::read(repo.worktree_payload_path("main").join("a.txt")).unwrap();
        assert_eq!(contents, b"v1");
        let wt = repo.worktree_manager().get("main").unwrap();
        assert_eq!(wt.head.as_deref(), Some(d1.snapshot_id.as_str()));
        assert!(wt.is_detached());
    }

    #[test]
    fn restore_to_latest_clears_detached_state() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let snaps = SnapshotEngine::new(repo.clone());
        snaps
            .publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() })
            .unwrap();
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v2-changed").unwrap();
        let d2 = snaps
            .publish("main", &engine, PublishOptions { note: "v2".into(), ..Default::default() })
            .unwrap();

        let restorer = RestoreEngine::new(repo.clone());
        let wt = repo.worktree_manager().get("main").unwrap();
        repo.worktree_manager()
            .update_pointers("main", Some(&wt.head.clone().unwrap()), Some(&d2.snapshot_id))
            .ok();
        restorer.restore_to_latest("main", &engine).unwrap();
        assert!(!repo.worktree_manager().get("main").unwrap().is_detached());
    }

    #[test]
    fn partial_restore_leaves_sibling_paths_untouched() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        let payload = repo.worktree_payload_path("main");
        std::fs::write(payload.join("tracked.txt"), b"v1").unwrap();
        std::fs::write(payload.join("sibling.txt"), b"untouched").unwrap();
        let snaps = SnapshotEngine::new(repo.clone());
        let d1 = snaps
            .publish(
                "main",
                &engine,
                PublishOptions {
                    note: "partial".into(),
                    partial_paths: Some(vec!["tracked.txt".into()]),
                    ..Default::default()
                },
            )
            .unwrap();

        std::fs::write(payload.join("tracked.txt"), b"v2").unwrap();
        std::fs::write(payload.join("sibling.txt"), b"changed-after").unwrap();

        let restorer = RestoreEngine::new(repo.clone());
        restorer.restore("main", &d1.snapshot_id, &engine).unwrap();

        assert_eq!(std::fs::read(payload.join("tracked.txt")).unwrap(), b"v1");
        assert_eq!(std::fs::read(payload.join("sibling.txt")).unwrap(), b"changed-after");
    }

    #[test]
    fn restore_decompresses_compressed_payload() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"hello world").unwrap();
        let snaps = SnapshotEngine::new(repo.clone());
        let d1 = snaps
            .publish(
                "main",
                &engine,
                PublishOptions {
                    note: "compressed".into(),
                    gzip_level: Some(6),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(d1.compression.is_some());

        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"overwritten").unwrap();
        let restorer = RestoreEngine::new(repo.clone());
        restorer.restore("main", &d1.snapshot_id, &engine).unwrap();

        let contents = std::fs::read(repo.worktree_payload_path("main").join("a.txt")).unwrap();
        assert_eq!(contents, b"hello world");
        assert!(!repo.worktree_payload_path("main").join("a.txt.gz").exists());
    }
}
