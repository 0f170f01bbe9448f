//! Named refs: stable aliases to a snapshot id, independent of worktree
//! head/latest pointers (spec.md §3 "Ref"). Ref targets are part of the GC
//! protection set.

use crate::error::{Error, Result};
use crate::fsutil;
use crate::repo::Repository;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefRecord {
    pub name: String,
    pub snapshot_id: String,
    pub created_at: String,
}

pub struct RefManager {
    repo: Repository,
}

impl RefManager {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.repo.jvs_dir().join("refs").join(format!("{name}.json"))
    }

    pub fn create(&self, name: &str, snapshot_id: &str) -> Result<RefRecord> {
        if !fsutil::valid_identifier(name) {
            return Err(Error::invalid_input(format!("invalid ref name: {name}")));
        }
        let path = self.path(name);
        if path.exists() {
            return Err(Error::precondition_failed(format!("ref already exists: {name}")));
        }
        let record = RefRecord {
            name: name.to_string(),
            snapshot_id: snapshot_id.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        fsutil::atomic_write(&path, serde_json::to_vec_pretty(&record)?.as_slice())?;
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Result<RefRecord> {
        let path = self.path(name);
        let contents = std::fs::read_to_string(&path).map_err(|_| Error::not_found("ref", name.to_string()))?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn list(&self) -> Result<Vec<RefRecord>> {
        let dir = self.repo.jvs_dir().join("refs");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names: Vec<_> = std::fs::read_dir(&dir)
            .map_err(|e| Error::io(&dir, e))?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect();
        names.sort();
        names.into_iter().map(|name| self.get(&name)).collect()
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        if !path.exists() {
            return Err(Error::not_found("ref", name.to_string()));
        }
        fsutil::remove_if_present(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_get_list_delete() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let mgr = RefManager::new(repo);
        mgr.create("release", "snap-a").unwrap();
        assert_eq!(mgr.get("release").unwrap().snapshot_id, "snap-a");
        assert_eq!(mgr.list().unwrap().len(), 1);
        mgr.delete("release").unwrap();
        assert!(mgr.get("release").is_err());
    }

    #[test]
    fn duplicate_name_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let mgr = RefManager::new(repo);
        mgr.create("release", "snap-a").unwrap();
        assert!(mgr.create("release", "snap-b").is_err());
    }
}
