//! Snapshot publish and resolution: the 12-step atomic publish protocol
//! (spec.md §4.4) and the snapshot id/tag/note resolver (spec.md §4.7).

use crate::audit::AuditLog;
use crate::descriptor::{CompressionInfo, Descriptor, IntegrityState};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::hashing::payload_root_hash;
use crate::id::generate_snapshot_id;
use crate::repo::Repository;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    pub note: String,
    pub tags: Vec<String>,
    pub partial_paths: Option<Vec<String>>,
    pub gzip_level: Option<u32>,
}

pub struct SnapshotEngine {
    repo: Repository,
}

impl SnapshotEngine {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    fn descriptors_dir(&self) -> PathBuf {
        self.repo.jvs_dir().join("descriptors")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.repo.jvs_dir().join("snapshots")
    }

    fn intents_dir(&self) -> PathBuf {
        self.repo.jvs_dir().join("intents")
    }

    fn descriptor_exists(&self, id: &str) -> bool {
        Descriptor::path(&self.repo.jvs_dir(), id).exists()
    }

    /// Publish a new snapshot of `worktree`'s current payload. Implements the
    /// twelve-step atomic protocol: an intent record is written before any
    /// irreversible step, and every later step can be resumed or rolled back
    /// from the intent alone, so a crash at any point leaves the repository
    /// either pre- or post-publish but never in between (spec.md §4.4).
    pub fn publish(
        &self,
        worktree: &str,
        engine: &dyn Engine,
        options: PublishOptions,
    ) -> Result<Descriptor> {
        let wt_mgr = self.repo.worktree_manager();
        let wt = wt_mgr.get(worktree)?;
        if wt.is_detached() {
            return Err(Error::precondition_failed(format!(
                "worktree '{worktree}' is detached; fork or restore to HEAD before snapshotting"
            )));
        }
        if let Some(paths) = &options.partial_paths {
            let mut seen = std::collections::BTreeSet::new();
            for p in paths {
                if !fsutil::valid_partial_path(p) {
                    return Err(Error::invalid_input(format!("invalid partial path: {p}")));
                }
                if !seen.insert(p.clone()) {
                    return Err(Error::invalid_input(format!("duplicate partial path: {p}")));
                }
            }
        }

        // Merge the repository's configured default tags in with the
        // caller-supplied ones before validating (spec.md §6: default_tags
        // are merged into every snapshot's tag list in addition to
        // caller-supplied tags).
        let mut tags = self.repo.config()?.default_tags;
        for t in &options.tags {
            if !tags.contains(t) {
                tags.push(t.clone());
            }
        }
        for tag in &tags {
            if !fsutil::valid_identifier(tag) {
                return Err(Error::invalid_input(format!("invalid tag: {tag}")));
            }
        }
        let options = PublishOptions {
            tags,
            ..options
        };

        // Step 1: generate a collision-free snapshot id.
        let snapshot_id = generate_snapshot_id(|candidate| self.descriptor_exists(candidate));

        // Step 2: write an intent record naming the id and worktree before any
        // other on-disk state changes, so an interrupted publish is detectable.
        let intent_path = self.intents_dir().join(format!("{snapshot_id}.json"));
        let intent = serde_json::json!({
            "snapshot_id": snapshot_id,
            "worktree": worktree,
            "started_at": chrono::Utc::now().to_rfc3339(),
        });
        fsutil::atomic_write(&intent_path, serde_json::to_vec_pretty(&intent)?.as_slice())?;

        let result = self.publish_inner(&snapshot_id, &wt, worktree, engine, &options);

        match &result {
            // Step 12: remove the intent only once the snapshot is durably
            // published; on failure the intent is left for doctor to find.
            Ok(_) => {
                fsutil::remove_if_present(&intent_path)?;
            }
            Err(_) => {
                tracing::warn!(snapshot_id = %snapshot_id, "publish failed, leaving intent for doctor");
            }
        }
        result
    }

    fn publish_inner(
        &self,
        snapshot_id: &str,
        wt: &crate::worktree::WorktreeConfig,
        worktree: &str,
        engine: &dyn Engine,
        options: &PublishOptions,
    ) -> Result<Descriptor> {
        let source_payload = self.repo.worktree_payload_path(worktree);
        let staging_dir = self.snapshots_dir().join(format!(".{snapshot_id}.staging"));
        fsutil::remove_if_present(&staging_dir)?;
        std::fs::create_dir_all(staging_dir.parent().unwrap()).map_err(|e| Error::io(&staging_dir, e))?;

        // Step 3: clone the payload into a staging directory via the selected
        // engine; nothing under .jvs/snapshots/<id>/ exists yet so a crash here
        // leaves only an orphan staging dir doctor can clean up.
        let staging_payload = staging_dir.join("payload");
        if let Some(paths) = &options.partial_paths {
            self.clone_partial(&source_payload, &staging_payload, paths, engine)?;
        } else {
            engine.clone_dir(&source_payload, &staging_payload)?;
        }

        // Step 4: optionally gzip-compress the staged payload in place before
        // hashing, so payload_root_hash covers exactly the bytes that will be
        // read back on restore (Design Notes: compress-before-hash).
        // Compression failure is non-fatal: the tree falls back to
        // uncompressed and the descriptor records `compression: null`
        // (spec.md §4.4).
        let compression = match options.gzip_level {
            Some(level) => match self.compress_tree(&staging_payload, level) {
                Ok(()) => Some(CompressionInfo {
                    kind: "gzip".to_string(),
                    level,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "compression failed, publishing payload uncompressed");
                    None
                }
            },
            None => None,
        };

        // Step 5: compute the payload root hash over the staged, final-form tree.
        let payload_root_hash = payload_root_hash(&staging_payload)?;

        // Step 6: build the descriptor with a placeholder checksum.
        let mut descriptor = Descriptor {
            snapshot_id: snapshot_id.to_string(),
            parent_snapshot_id: wt.latest.clone(),
            worktree_name: worktree.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            note: options.note.clone(),
            tags: options.tags.clone(),
            engine: engine.kind(),
            partial_paths: options.partial_paths.clone(),
            compression,
            payload_root_hash,
            descriptor_checksum: String::new(),
            integrity_state: IntegrityState::Verified,
        };
        descriptor.descriptor_checksum = descriptor.compute_checksum()?;

        // Step 7: write the descriptor under a temp name, fsync, then rename
        // into place — the descriptor is visible atomically or not at all.
        let descriptor_path = Descriptor::path(&self.repo.jvs_dir(), snapshot_id);
        fsutil::atomic_write(&descriptor_path, descriptor.to_json_bytes()?.as_slice())?;

        // Step 8: rename the staging directory into its final snapshot location.
        let final_dir = self.snapshots_dir().join(snapshot_id);
        fsutil::atomic_rename(&staging_dir, &final_dir)?;

        // Step 9: write the `.READY` marker — this is the sole publish gate
        // (spec.md §4.4): a snapshot directory without `.READY` is treated as
        // never having happened by every other operation.
        fsutil::touch_fsync(&final_dir.join(".READY"))?;
        fsutil::fsync_dir(&self.snapshots_dir())?;

        // Step 10: advance the worktree's head and latest pointers together.
        self.repo
            .worktree_manager()
            .update_pointers(worktree, Some(snapshot_id), Some(snapshot_id))?;

        // Step 11: append an audit record for the publish.
        AuditLog::new(&self.repo.jvs_dir()).append(
            "snapshot.publish",
            Some(worktree),
            Some(snapshot_id),
            &options.note,
        )?;

        Ok(descriptor)
    }

    fn clone_partial(
        &self,
        source_root: &Path,
        staging_payload: &Path,
        paths: &[String],
        engine: &dyn Engine,
    ) -> Result<()> {
        std::fs::create_dir_all(staging_payload).map_err(|e| Error::io(staging_payload, e))?;
        for rel in paths {
            let src = fsutil::safe_join(source_root, rel)?;
            if !src.exists() {
                return Err(Error::invalid_input(format!("partial path does not exist: {rel}")));
            }
            let dst = fsutil::safe_join(staging_payload, rel)?;
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            if src.is_dir() {
                engine.clone_dir(&src, &dst)?;
            } else {
                std::fs::copy(&src, &dst).map_err(|e| Error::io(&dst, e))?;
            }
        }
        Ok(())
    }

    /// Gzip every regular file in `root` to a sibling `<name>.gz` and remove
    /// the original, leaving directory structure and symlinks untouched. The
    /// whole tree is compressed atomically from the caller's point of view:
    /// if any file fails, every `.gz` file created by this call is removed
    /// and the error propagates so the caller can fall back to uncompressed.
    fn compress_tree(&self, root: &Path, level: u32) -> Result<()> {
        let mut files = Vec::new();
        collect_files(root, &mut files)?;
        let mut created = Vec::new();
        let result = (|| -> Result<()> {
            for file in &files {
                let contents = std::fs::read(file).map_err(|e| Error::io(file, e))?;
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
                encoder.write_all(&contents).map_err(|e| Error::io(file, e))?;
                let compressed = encoder.finish().map_err(|e| Error::io(file, e))?;
                let gz_path = append_gz_ext(file);
                std::fs::write(&gz_path, &compressed).map_err(|e| Error::io(&gz_path, e))?;
                created.push(gz_path);
            }
            for file in &files {
                std::fs::remove_file(file).map_err(|e| Error::io(file, e))?;
            }
            Ok(())
        })();
        if result.is_err() {
            for gz in &created {
                let _ = std::fs::remove_file(gz);
            }
        }
        result
    }

    /// Resolve a user-supplied reference to a snapshot id, trying in order:
    /// the `HEAD` literal, an exact snapshot id, an exact tag (newest wins on
    /// collision), a unique id prefix of at least 4 characters, and finally a
    /// unique note prefix (spec.md §4.7).
    pub fn resolve(&self, worktree: &str, reference: &str) -> Result<String> {
        if reference.eq_ignore_ascii_case("head") {
            let wt = self.repo.worktree_manager().get(worktree)?;
            return wt.head.ok_or_else(|| Error::not_found("snapshot", "HEAD".to_string()));
        }

        if self.descriptor_exists(reference) {
            return Ok(reference.to_string());
        }

        let all = self.list_all()?;

        let mut tag_matches: Vec<&Descriptor> = all.iter().filter(|d| d.tags.iter().any(|t| t == reference)).collect();
        if !tag_matches.is_empty() {
            tag_matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            return Ok(tag_matches.last().unwrap().snapshot_id.clone());
        }

        if reference.len() >= 4 {
            let id_matches: Vec<&Descriptor> = all
                .iter()
                .filter(|d| d.snapshot_id.starts_with(reference))
                .collect();
            match id_matches.len() {
                0 => {}
                1 => return Ok(id_matches[0].snapshot_id.clone()),
                _ => {
                    return Err(Error::ambiguous(
                        "snapshot",
                        reference,
                        id_matches.iter().map(|d| d.snapshot_id.clone()).collect(),
                    ))
                }
            }
        }

        let note_matches: Vec<&Descriptor> = all.iter().filter(|d| d.note.starts_with(reference)).collect();
        match note_matches.len() {
            0 => Err(Error::not_found("snapshot", reference.to_string())),
            1 => Ok(note_matches[0].snapshot_id.clone()),
            _ => Err(Error::ambiguous(
                "snapshot",
                reference,
                note_matches.iter().map(|d| d.snapshot_id.clone()).collect(),
            )),
        }
    }

    pub fn get(&self, snapshot_id: &str) -> Result<Descriptor> {
        let path = Descriptor::path(&self.repo.jvs_dir(), snapshot_id);
        if !self.ready(snapshot_id) {
            return Err(Error::not_found("snapshot", snapshot_id.to_string()));
        }
        Descriptor::load(&path)
    }

    pub fn ready(&self, snapshot_id: &str) -> bool {
        self.snapshots_dir().join(snapshot_id).join(".READY").is_file()
    }

    pub fn list_all(&self) -> Result<Vec<Descriptor>> {
        let dir = self.descriptors_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(&dir)
            .map_err(|e| Error::io(&dir, e))?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let id = entry.path().file_stem().unwrap().to_string_lossy().to_string();
            if self.ready(&id) {
                out.push(Descriptor::load(&entry.path())?);
            }
        }
        Ok(out)
    }

    pub fn payload_path(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir().join(snapshot_id).join("payload")
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn append_gz_ext(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".gz");
    PathBuf::from(s)
}

fn is_gz_file(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

/// Gunzip `gz_path` and write its contents to `dst_plain` (which must not
/// itself carry a `.gz` suffix), creating parent directories as needed.
pub(crate) fn decompress_file(gz_path: &Path, dst_plain: &Path) -> Result<()> {
    let compressed = std::fs::read(gz_path).map_err(|e| Error::io(gz_path, e))?;
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| Error::io(dst_plain, e))?;
    if let Some(parent) = dst_plain.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    std::fs::write(dst_plain, &out).map_err(|e| Error::io(dst_plain, e))
}

/// Recursively gunzip every `.gz` file under `root` back to its original
/// name, removing the `.gz` file. Used by restore to undo [`compress_tree`].
pub(crate) fn decompress_tree(root: &Path) -> Result<()> {
    let mut gz_files = Vec::new();
    collect_gz_files(root, &mut gz_files)?;
    for gz in gz_files {
        let plain = gz.with_extension("");
        decompress_file(&gz, &plain)?;
        std::fs::remove_file(&gz).map_err(|e| Error::io(&gz, e))?;
    }
    Ok(())
}

fn collect_gz_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;
        if file_type.is_dir() {
            collect_gz_files(&path, out)?;
        } else if file_type.is_file() && is_gz_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CopyEngine;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository, SnapshotEngine) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"hello").unwrap();
        let snaps = SnapshotEngine::new(repo.clone());
        (dir, repo, snaps)
    }

    #[test]
    fn publish_creates_ready_marker_and_updates_head() {
        let (_dir, repo, snaps) = setup();
        let engine = CopyEngine;
        let opts = PublishOptions {
            note: "first snapshot".into(),
            ..Default::default()
        };
        let descriptor = snaps.publish("main", &engine, opts).unwrap();
        assert!(snaps.ready(&descriptor.snapshot_id));
        let wt = repo.worktree_manager().get("main").unwrap();
        assert_eq!(wt.head.as_deref(), Some(descriptor.snapshot_id.as_str()));
    }

    #[test]
    fn detached_worktree_rejects_publish() {
        let (_dir, repo, snaps) = setup();
        let engine = CopyEngine;
        repo.worktree_manager()
            .update_pointers("main", Some("a"), Some("b"))
            .unwrap();
        let err = snaps.publish("main", &engine, PublishOptions::default()).unwrap_err();
        assert_eq!(err.error_code(), "precondition-failed");
    }

    #[test]
    fn resolve_head_exact_tag_and_prefix() {
        let (_dir, _repo, snaps) = setup();
        let engine = CopyEngine;
        let d1 = snaps
            .publish(
                "main",
                &engine,
                PublishOptions {
                    note: "alpha".into(),
                    tags: vec!["release".into()],
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(snaps.resolve("main", "HEAD").unwrap(), d1.snapshot_id);
        assert_eq!(snaps.resolve("main", &d1.snapshot_id).unwrap(), d1.snapshot_id);
        assert_eq!(snaps.resolve("main", "release").unwrap(), d1.snapshot_id);
        let prefix = &d1.snapshot_id[..6];
        assert_eq!(snaps.resolve("main", prefix).unwrap(), d1.snapshot_id);
    }

    #[test]
    fn resolve_unknown_is_not_found() {
        let (_dir, _repo, snaps) = setup();
        let err = snaps.resolve("main", "nope").unwrap_err();
        assert_eq!(err.error_code(), "not-found");
    }

    #[test]
    fn invalid_tag_is_rejected() {
        let (_dir, _repo, snaps) = setup();
        let engine = CopyEngine;
        let err = snaps
            .publish(
                "main",
                &engine,
                PublishOptions {
                    tags: vec!["not/a/tag".into()],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid-input");
    }

    #[test]
    fn default_tags_merge_into_publish() {
        let (dir, repo, _snaps) = setup();
        std::fs::write(repo.jvs_dir().join("config.yaml"), "default_tags: [nightly]\n").unwrap();
        let snaps = SnapshotEngine::new(repo.clone());
        let engine = CopyEngine;
        let d = snaps
            .publish(
                "main",
                &engine,
                PublishOptions {
                    tags: vec!["release".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(d.tags.contains(&"nightly".to_string()));
        assert!(d.tags.contains(&"release".to_string()));
        drop(dir);
    }

    #[test]
    fn compression_renames_payload_files_to_gz() {
        let (_dir, repo, snaps) = setup();
        let engine = CopyEngine;
        let d = snaps
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
        assert!(d.compression.is_some());
        let payload = snaps.payload_path(&d.snapshot_id);
        assert!(payload.join("a.txt.gz").is_file());
        assert!(!payload.join("a.txt").exists());
    }
}
