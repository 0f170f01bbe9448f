//! Worktree lifecycle: head/latest pointers, detached state, fork/restore
//! (spec.md §3 "Worktree", §4.2, §4.3).

use crate::error::{Error, Result};
use crate::fsutil;
use crate::repo::Repository;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorktreeConfig {
    pub name: String,
    pub created_at: String,
    /// Snapshot the payload currently reflects. `None` until the first snapshot.
    pub head: Option<String>,
    /// Most recently published snapshot for this worktree. `None` until the first
    /// snapshot.
    pub latest: Option<String>,
}

impl WorktreeConfig {
    /// A worktree is detached when its payload has been restored to an older
    /// snapshot than the newest one published against it: new snapshots are
    /// forbidden until it is forked or restored back to latest (spec.md §4.3).
    pub fn is_detached(&self) -> bool {
        match (&self.head, &self.latest) {
            (Some(h), Some(l)) => h != l,
            _ => false,
        }
    }
}

pub struct WorktreeManager {
    repo: Repository,
}

impl WorktreeManager {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.repo.jvs_dir().join("worktrees").join(name).join("config.json")
    }

    /// Register a new worktree named `name`. `head`/`latest` start unset unless
    /// `forked_from` supplies a starting snapshot (used by [`Self::fork`]).
    pub fn create(&self, name: &str, forked_from: Option<&str>) -> Result<WorktreeConfig> {
        if !fsutil::valid_identifier(name) {
            return Err(Error::invalid_input(format!("invalid worktree name: {name}")));
        }
        let config_path = self.config_path(name);
        if config_path.exists() {
            return Err(Error::precondition_failed(format!("worktree already exists: {name}")));
        }
        let payload_path = self.repo.worktree_payload_path(name);
        if name != crate::repo::MAIN_WORKTREE {
            std::fs::create_dir_all(&payload_path).map_err(|e| Error::io(&payload_path, e))?;
        }

        let config = WorktreeConfig {
            name: name.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            head: forked_from.map(str::to_string),
            latest: forked_from.map(str::to_string),
        };
        std::fs::create_dir_all(config_path.parent().unwrap()).map_err(|e| Error::io(&config_path, e))?;
        fsutil::atomic_write(&config_path, serde_json::to_vec_pretty(&config)?.as_slice())?;
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Result<WorktreeConfig> {
        let path = self.config_path(name);
        let contents = std::fs::read_to_string(&path).map_err(|_| Error::not_found("worktree", name.to_string()))?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn list(&self) -> Result<Vec<WorktreeConfig>> {
        let dir = self.repo.jvs_dir().join("worktrees");
        let mut out = Vec::new();
        if !dir.is_dir() {
            return Ok(out);
        }
        let mut names: Vec<_> = std::fs::read_dir(&dir)
            .map_err(|e| Error::io(&dir, e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        for name in names {
            out.push(self.get(&name)?);
        }
        Ok(out)
    }

    /// Create a new worktree whose payload starts as a clone of `snapshot_id`'s
    /// payload, with head and latest both set to that snapshot. The standard way
    /// out of a detached main/worktree state without disturbing its history
    /// (spec.md §4.3).
    pub fn fork(
        &self,
        new_name: &str,
        from_worktree: &str,
        snapshot_id: &str,
        engine: &dyn crate::engine::Engine,
    ) -> Result<WorktreeConfig> {
        let _ = self.get(from_worktree)?;
        let config = self.create(new_name, Some(snapshot_id))?;
        let snapshot_payload = self.repo.jvs_dir().join("snapshots").join(snapshot_id).join("payload");
        let dst_payload = self.repo.worktree_payload_path(new_name);
        fsutil::remove_if_present(&dst_payload)?;
        engine.clone_dir(&snapshot_payload, &dst_payload)?;
        Ok(config)
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        if old_name == crate::repo::MAIN_WORKTREE {
            return Err(Error::precondition_failed("cannot rename the main worktree"));
        }
        if !fsutil::valid_identifier(new_name) {
            return Err(Error::invalid_input(format!("invalid worktree name: {new_name}")));
        }
        let mut config = self.get(old_name)?;
        if self.config_path(new_name).exists() {
            return Err(Error::precondition_failed(format!("worktree already exists: {new_name}")));
        }
        config.name = new_name.to_string();

        let old_payload = self.repo.worktree_payload_path(old_name);
        let new_payload = self.repo.worktree_payload_path(new_name);
        fsutil::atomic_rename(&old_payload, &new_payload)?;

        let new_config_dir = self.repo.jvs_dir().join("worktrees").join(new_name);
        std::fs::create_dir_all(&new_config_dir).map_err(|e| Error::io(&new_config_dir, e))?;
        fsutil::atomic_write(&self.config_path(new_name), serde_json::to_vec_pretty(&config)?.as_slice())?;
        fsutil::remove_if_present(&self.repo.jvs_dir().join("worktrees").join(old_name))?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        if name == crate::repo::MAIN_WORKTREE {
            return Err(Error::precondition_failed("cannot remove the main worktree"));
        }
        let _ = self.get(name)?;
        fsutil::remove_if_present(&self.repo.worktree_payload_path(name))?;
        fsutil::remove_if_present(&self.repo.jvs_dir().join("worktrees").join(name))?;
        Ok(())
    }

    pub fn update_pointers(&self, name: &str, head: Option<&str>, latest: Option<&str>) -> Result<WorktreeConfig> {
        let mut config = self.get(name)?;
        if let Some(h) = head {
            config.head = Some(h.to_string());
        }
        if let Some(l) = latest {
            config.latest = Some(l.to_string());
        }
        fsutil::atomic_write(&self.config_path(name), serde_json::to_vec_pretty(&config)?.as_slice())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CopyEngine;
    use tempfile::TempDir;

    #[test]
    fn create_and_get_roundtrips() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let mgr = repo.worktree_manager();
        mgr.create("feature", None).unwrap();
        let wt = mgr.get("feature").unwrap();
        assert_eq!(wt.name, "feature");
        assert!(!wt.is_detached());
    }

    #[test]
    fn detached_when_head_behind_latest() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let mgr = repo.worktree_manager();
        mgr.update_pointers("main", Some("snap-a"), Some("snap-a")).unwrap();
        mgr.update_pointers("main", Some("snap-a"), Some("snap-b")).unwrap();
        assert!(mgr.get("main").unwrap().is_detached());
    }

    #[test]
    fn fork_clones_payload_and_sets_pointers() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let mgr = repo.worktree_manager();

        let snap_dir = repo.jvs_dir().join("snapshots/snap-a/payload");
        std::fs::create_dir_all(&snap_dir).unwrap();
        std::fs::write(snap_dir.join("f.txt"), b"hi").unwrap();

        let engine = CopyEngine;
        let wt = mgr.fork("feature", "main", "snap-a", &engine).unwrap();
        assert_eq!(wt.head.as_deref(), Some("snap-a"));
        assert!(repo.worktree_payload_path("feature").join("f.txt").is_file());
    }

    #[test]
    fn cannot_rename_or_remove_main() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let mgr = repo.worktree_manager();
        assert!(mgr.rename("main", "other").is_err());
        assert!(mgr.remove("main").is_err());
    }
}
