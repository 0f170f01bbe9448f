//! Descriptor JSON sidecar: the record that names and verifies a snapshot
//! (spec.md §3, §6).

use crate::engine::EngineKind;
use crate::error::{Error, Result};
use crate::hashing::descriptor_checksum;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityState {
    Verified,
    Unverified,
    Tampered,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Descriptor {
    pub snapshot_id: String,
    pub parent_snapshot_id: Option<String>,
    pub worktree_name: String,
    pub created_at: String,
    pub note: String,
    pub tags: Vec<String>,
    pub engine: EngineKind,
    pub partial_paths: Option<Vec<String>>,
    pub compression: Option<CompressionInfo>,
    pub payload_root_hash: String,
    pub descriptor_checksum: String,
    pub integrity_state: IntegrityState,
}

impl Descriptor {
    /// Path of the published descriptor file under `.jvs/descriptors/`.
    pub fn path(jvs_dir: &Path, snapshot_id: &str) -> std::path::PathBuf {
        jvs_dir.join("descriptors").join(format!("{snapshot_id}.json"))
    }

    /// Recompute `descriptor_checksum` over this descriptor's canonical form.
    pub fn compute_checksum(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        descriptor_checksum(&value)
    }

    /// Load and deserialize a descriptor from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Serialize to pretty JSON bytes for writing to disk.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Descriptor {
        Descriptor {
            snapshot_id: "1700000000000-abcdef01".into(),
            parent_snapshot_id: None,
            worktree_name: "main".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            note: "first".into(),
            tags: vec![],
            engine: EngineKind::Copy,
            partial_paths: None,
            compression: None,
            payload_root_hash: "deadbeef".into(),
            descriptor_checksum: String::new(),
            integrity_state: IntegrityState::Unverified,
        }
    }

    #[test]
    fn checksum_independent_of_itself_and_integrity_state() {
        let mut d1 = sample();
        d1.descriptor_checksum = "aaa".into();
        d1.integrity_state = IntegrityState::Unverified;
        let mut d2 = sample();
        d2.descriptor_checksum = "bbb".into();
        d2.integrity_state = IntegrityState::Verified;
        assert_eq!(d1.compute_checksum().unwrap(), d2.compute_checksum().unwrap());
    }

    #[test]
    fn roundtrips_through_json() {
        let d = sample();
        let bytes = d.to_json_bytes().unwrap();
        let path = std::env::temp_dir().join(format!("jvs-desc-test-{}.json", std::process::id()));
        std::fs::write(&path, &bytes).unwrap();
        let loaded = Descriptor::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.snapshot_id, d.snapshot_id);
    }
}
