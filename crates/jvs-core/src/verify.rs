//! Snapshot integrity verification (spec.md §4.6).
//!
//! Shallow verification recomputes `descriptor_checksum` only (cheap, catches
//! descriptor tampering). Deep verification additionally recomputes
//! `payload_root_hash` over the full payload tree.

use crate::descriptor::{Descriptor, IntegrityState};
use crate::error::{Error, Result};
use crate::hashing::payload_root_hash;
use crate::repo::Repository;
use crate::snapshot::SnapshotEngine;
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct VerifyOutcome {
    pub snapshot_id: String,
    pub ok: bool,
    pub checksum_ok: bool,
    pub payload_hash_ok: Option<bool>,
    pub detail: String,
}

/// Verify a single snapshot. `deep` additionally rehashes the payload tree;
/// without it, only the descriptor's self-checksum is checked.
pub fn verify_snapshot(repo: &Repository, snapshot_id: &str, deep: bool) -> Result<VerifyOutcome> {
    let snaps = SnapshotEngine::new(repo.clone());
    if !snaps.ready(snapshot_id) {
        return Err(Error::not_found("snapshot", snapshot_id.to_string()));
    }
    let descriptor = snaps.get(snapshot_id)?;

    let recomputed_checksum = descriptor.compute_checksum()?;
    let checksum_ok = recomputed_checksum == descriptor.descriptor_checksum;

    let payload_hash_ok = if deep {
        let payload = snaps.payload_path(snapshot_id);
        let recomputed = payload_root_hash(&payload)?;
        Some(recomputed == descriptor.payload_root_hash)
    } else {
        None
    };

    let ok = checksum_ok && payload_hash_ok.unwrap_or(true);
    let detail = if ok {
        "integrity verified".to_string()
    } else {
        let mut parts = Vec::new();
        if !checksum_ok {
            parts.push("descriptor_checksum mismatch".to_string());
        }
        if payload_hash_ok == Some(false) {
            parts.push("payload_root_hash mismatch".to_string());
        }
        parts.join("; ")
    };

    if deep {
        update_integrity_state(repo, &descriptor, ok)?;
    }

    Ok(VerifyOutcome {
        snapshot_id: snapshot_id.to_string(),
        ok,
        checksum_ok,
        payload_hash_ok,
        detail,
    })
}

fn update_integrity_state(repo: &Repository, descriptor: &Descriptor, ok: bool) -> Result<()> {
    let mut updated = descriptor.clone();
    updated.integrity_state = if ok {
        IntegrityState::Verified
    } else {
        IntegrityState::Tampered
    };
    // integrity_state is excluded from the checksum, so updating it never
    // invalidates descriptor_checksum.
    let path = Descriptor::path(&repo.jvs_dir(), &descriptor.snapshot_id);
    crate::fsutil::atomic_write(&path, updated.to_json_bytes()?.as_slice())
}

/// Verify every published snapshot in the repository.
pub fn verify_all(repo: &Repository, deep: bool) -> Result<Vec<VerifyOutcome>> {
    let snaps = SnapshotEngine::new(repo.clone());
    snaps
        .list_all()?
        .into_iter()
        .map(|d| verify_snapshot(repo, &d.snapshot_id, deep))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CopyEngine;
    use crate::snapshot::PublishOptions;
    use tempfile::TempDir;

    #[test]
    fn verifies_clean_snapshot() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());
        let d = snaps
            .publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() })
            .unwrap();

        let outcome = verify_snapshot(&repo, &d.snapshot_id, true).unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.payload_hash_ok, Some(true));
    }

    #[test]
    fn detects_tampered_payload() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());
        let d = snaps
            .publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() })
            .unwrap();

        std::fs::write(snaps.payload_path(&d.snapshot_id).join("a.txt"), b"tampered").unwrap();

        let outcome = verify_snapshot(&repo, &d.snapshot_id, true).unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.payload_hash_ok, Some(false));
    }
}
