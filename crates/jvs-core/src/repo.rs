//! Repository layout: `.jvs/` on-disk topology, format version, repo identity
//! (spec.md §3, §6).

use crate::config::RepoConfig;
use crate::error::{Error, Result};
use crate::fsutil;
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;
pub const MAIN_WORKTREE: &str = "main";

/// A handle to an on-disk JVS repository. Every engine operation takes a
/// `&Repository` (or its root path) rather than going through a process-wide
/// singleton (Design Notes: "no singleton repository handle").
#[derive(Clone, Debug)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Initialize a brand-new repository at `root/name`: creates `main/`, `.jvs/`
    /// and its subdirectories, a repo id, and the format version marker.
    pub fn init(root: &Path, name: &str) -> Result<Self> {
        if !fsutil::valid_identifier(name) {
            return Err(Error::invalid_input(format!("invalid repository name: {name}")));
        }
        let repo_root = root.join(name);
        if repo_root.exists() {
            return Err(Error::precondition_failed(format!(
                "destination already exists: {}",
                repo_root.display()
            )));
        }
        std::fs::create_dir_all(repo_root.join(MAIN_WORKTREE)).map_err(|e| Error::io(&repo_root, e))?;

        let jvs_dir = repo_root.join(".jvs");
        for sub in [
            "worktrees",
            "snapshots",
            "descriptors",
            "refs",
            "intents",
            "audit",
            "gc/plans",
            "gc/tombstones",
        ] {
            std::fs::create_dir_all(jvs_dir.join(sub)).map_err(|e| Error::io(&jvs_dir, e))?;
        }

        fsutil::atomic_write(&jvs_dir.join("format_version"), FORMAT_VERSION.to_string().as_bytes())?;
        fsutil::atomic_write(&jvs_dir.join("repo_id"), generate_repo_id().as_bytes())?;

        let repo = Self { root: repo_root };
        repo.worktree_manager().create(MAIN_WORKTREE, None)?;
        Ok(repo)
    }

    /// Open an existing repository rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let jvs_dir = root.join(".jvs");
        if !jvs_dir.is_dir() {
            return Err(Error::not_found("repository", root.display().to_string()));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jvs_dir(&self) -> PathBuf {
        self.root.join(".jvs")
    }

    pub fn format_version(&self) -> Result<u32> {
        let path = self.jvs_dir().join("format_version");
        let raw = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::invalid_input("format_version is not an integer"))
    }

    pub fn repo_id(&self) -> Result<String> {
        let path = self.jvs_dir().join("repo_id");
        Ok(std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?.trim().to_string())
    }

    pub fn config(&self) -> Result<RepoConfig> {
        RepoConfig::load(&self.jvs_dir())
    }

    pub fn worktree_manager(&self) -> crate::worktree::WorktreeManager {
        crate::worktree::WorktreeManager::new(self.clone())
    }

    pub fn worktree_payload_path(&self, name: &str) -> PathBuf {
        if name == MAIN_WORKTREE {
            self.root.join(MAIN_WORKTREE)
        } else {
            self.root.join("worktrees").join(name)
        }
    }
}

fn generate_repo_id() -> String {
    format!("jvs_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_creates_expected_layout() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();

        assert!(repo.root().join("main").is_dir());
        assert!(repo.jvs_dir().join("worktrees/main/config.json").is_file());
        assert_eq!(repo.format_version().unwrap(), FORMAT_VERSION);
        assert!(!repo.repo_id().unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_name() {
        let dir = TempDir::new().unwrap();
        assert!(Repository::init(dir.path(), "../evil").is_err());
    }

    #[test]
    fn rejects_existing_destination() {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path(), "r1").unwrap();
        assert!(Repository::init(dir.path(), "r1").is_err());
    }
}
