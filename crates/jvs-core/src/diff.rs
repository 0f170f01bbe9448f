//! Entry-level comparison between two snapshots' payload trees (spec.md §4.11).

use crate::error::{Error, Result};
use crate::repo::Repository;
use crate::snapshot::SnapshotEngine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffKind {
    Added,
    Removed,
    Modified,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
    Symlink,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
    pub entry_type: EntryType,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffResult {
    pub from_snapshot: String,
    pub to_snapshot: String,
    pub entries: Vec<DiffEntry>,
    pub summary: DiffSummary,
}

/// Compare two snapshots' payload trees entry by entry, classifying each
/// relative path (file, directory, or symlink) as added, removed, or
/// modified. A path that changes entry type between the two snapshots (e.g.
/// a file replaced by a directory of the same name) is reported as a
/// removal of the old type plus an addition of the new one, since the two
/// can't meaningfully be diffed as "the same entry changed".
pub fn diff_snapshots(repo: &Repository, from_id: &str, to_id: &str) -> Result<DiffResult> {
    let snaps = SnapshotEngine::new(repo.clone());
    if !snaps.ready(from_id) {
        return Err(Error::not_found("snapshot", from_id.to_string()));
    }
    if !snaps.ready(to_id) {
        return Err(Error::not_found("snapshot", to_id.to_string()));
    }

    let from_entries = index_tree(&snaps.payload_path(from_id))?;
    let to_entries = index_tree(&snaps.payload_path(to_id))?;

    let mut entries = Vec::new();
    let mut summary = DiffSummary::default();

    for (rel, from_meta) in &from_entries {
        match to_entries.get(rel) {
            None => {
                entries.push(DiffEntry {
                    path: rel.clone(),
                    kind: DiffKind::Removed,
                    entry_type: from_meta.entry_type,
                });
                summary.removed += 1;
            }
            Some(to_meta) if to_meta.entry_type != from_meta.entry_type => {
                entries.push(DiffEntry {
                    path: rel.clone(),
                    kind: DiffKind::Removed,
                    entry_type: from_meta.entry_type,
                });
                entries.push(DiffEntry {
                    path: rel.clone(),
                    kind: DiffKind::Added,
                    entry_type: to_meta.entry_type,
                });
                summary.removed += 1;
                summary.added += 1;
            }
            Some(to_meta) if to_meta != from_meta => {
                entries.push(DiffEntry {
                    path: rel.clone(),
                    kind: DiffKind::Modified,
                    entry_type: from_meta.entry_type,
                });
                summary.modified += 1;
            }
            Some(_) => {}
        }
    }
    for (rel, to_meta) in &to_entries {
        if !from_entries.contains_key(rel) {
            entries.push(DiffEntry {
                path: rel.clone(),
                kind: DiffKind::Added,
                entry_type: to_meta.entry_type,
            });
            summary.added += 1;
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path).then(a.kind.cmp_order().cmp(&b.kind.cmp_order())));

    Ok(DiffResult {
        from_snapshot: from_id.to_string(),
        to_snapshot: to_id.to_string(),
        entries,
        summary,
    })
}

impl DiffKind {
    fn cmp_order(&self) -> u8 {
        match self {
            DiffKind::Removed => 0,
            DiffKind::Added => 1,
            DiffKind::Modified => 2,
        }
    }
}

#[derive(PartialEq, Eq)]
struct EntryMeta {
    entry_type: EntryType,
    size: u64,
    content_hash: String,
    symlink_target: Option<String>,
}

fn index_tree(root: &Path) -> Result<BTreeMap<String, EntryMeta>> {
    let mut out = BTreeMap::new();
    walk(root, root, &mut out)?;
    Ok(out)
}

fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, EntryMeta>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;
        let rel = rel_path(root, &path);

        if file_type.is_symlink() {
            let target = std::fs::read_link(&path).map_err(|e| Error::io(&path, e))?;
            out.insert(
                rel,
                EntryMeta {
                    entry_type: EntryType::Symlink,
                    size: 0,
                    content_hash: String::new(),
                    symlink_target: Some(target.to_string_lossy().replace('\\', "/")),
                },
            );
        } else if file_type.is_dir() {
            out.insert(
                rel.clone(),
                EntryMeta {
                    entry_type: EntryType::Dir,
                    size: 0,
                    content_hash: String::new(),
                    symlink_target: None,
                },
            );
            walk(root, &path, out)?;
        } else {
            let contents = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
            out.insert(
                rel,
                EntryMeta {
                    entry_type: EntryType::File,
                    size: contents.len() as u64,
                    content_hash: crate::hashing::sha256_hex(&contents),
                    symlink_target: None,
                },
            );
        }
    }
    Ok(())
}

fn rel_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CopyEngine;
    use crate::snapshot::PublishOptions;
    use tempfile::TempDir;

    #[test]
    fn diff_detects_added_removed_modified() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());

        std::fs::write(repo.worktree_payload_path("main").join("keep.txt"), b"same").unwrap();
        std::fs::write(repo.worktree_payload_path("main").join("change.txt"), b"v1").unwrap();
        let d1 = snaps.publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() }).unwrap();

        std::fs::write(repo.worktree_payload_path("main").join("change.txt"), b"v2").unwrap();
        std::fs::remove_file(repo.worktree_payload_path("main").join("keep.txt")).unwrap();
        std::fs::write(repo.worktree_payload_path("main").join("new.txt"), b"new").unwrap();
        let d2 = snaps.publish("main", &engine, PublishOptions { note: "v2".into(), ..Default::default() }).unwrap();

        let result = diff_snapshots(&repo, &d1.snapshot_id, &d2.snapshot_id).unwrap();
        assert_eq!(result.summary.added, 1);
        assert_eq!(result.summary.removed, 1);
        assert_eq!(result.summary.modified, 1);
    }

    #[test]
    fn diff_detects_added_directory_and_symlink() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());

        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let d1 = snaps.publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() }).unwrap();

        let payload = repo.worktree_payload_path("main");
        std::fs::create_dir(payload.join("subdir")).unwrap();
        std::fs::write(payload.join("subdir/b.txt"), b"nested").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a.txt", payload.join("link")).unwrap();
        let d2 = snaps.publish("main", &engine, PublishOptions { note: "v2".into(), ..Default::default() }).unwrap();

        let result = diff_snapshots(&repo, &d1.snapshot_id, &d2.snapshot_id).unwrap();
        assert!(result
            .entries
            .iter()
            .any(|e| e.path == "subdir" && e.kind == DiffKind::Added && e.entry_type == EntryType::Dir));
        assert!(result
            .entries
            .iter()
            .any(|e| e.path == "subdir/b.txt" && e.kind == DiffKind::Added && e.entry_type == EntryType::File));
        #[cfg(unix)]
        assert!(result
            .entries
            .iter()
            .any(|e| e.path == "link" && e.kind == DiffKind::Added && e.entry_type == EntryType::Symlink));
    }
}
