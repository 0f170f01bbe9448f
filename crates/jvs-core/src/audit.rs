//! Append-only, hash-chained audit log (spec.md §4.8).
//!
//! Each record's `record_hash` covers its own canonicalized fields (excluding
//! `record_hash` itself) chained to the previous record's hash, so any edit or
//! reordering of a past line is detectable without re-reading the whole
//! repository state — only the log itself.

use crate::error::{Error, Result};
use crate::hashing::sha256_hex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: String,
    pub timestamp: String,
    pub action: String,
    pub actor: String,
    pub worktree: Option<String>,
    pub snapshot_id: Option<String>,
    pub detail: String,
    #[serde(default)]
    pub extra: serde_json::Value,
    pub prev_hash: String,
    pub record_hash: String,
}

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(jvs_dir: &Path) -> Self {
        Self {
            path: jvs_dir.join("audit").join("audit.jsonl"),
        }
    }

    fn last_hash(&self) -> Result<String> {
        match self.read_all()?.last() {
            Some(record) => Ok(record.record_hash.clone()),
            None => Ok(String::new()),
        }
    }

    /// Best-effort identity of the process performing the action: the first
    /// of `USER`/`USERNAME` that's set, or `"unknown"`.
    fn current_actor() -> String {
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Append a new record, computing its `prev_hash`/`record_hash` from the
    /// current tail of the log.
    pub fn append(
        &self,
        action: &str,
        worktree: Option<&str>,
        snapshot_id: Option<&str>,
        detail: &str,
    ) -> Result<AuditRecord> {
        let prev_hash = self.last_hash()?;
        let mut record = AuditRecord {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            action: action.to_string(),
            actor: Self::current_actor(),
            worktree: worktree.map(str::to_string),
            snapshot_id: snapshot_id.map(str::to_string),
            detail: detail.to_string(),
            extra: serde_json::Value::Object(serde_json::Map::new()),
            prev_hash,
            record_hash: String::new(),
        };
        record.record_hash = Self::compute_record_hash(&record)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        file.write_all(&line).map_err(|e| Error::io(&self.path, e))?;
        file.sync_all().map_err(|e| Error::io(&self.path, e))?;
        Ok(record)
    }

    fn compute_record_hash(record: &AuditRecord) -> Result<String> {
        let mut for_hash = record.clone();
        for_hash.record_hash = String::new();
        let bytes = serde_json::to_vec(&for_hash)?;
        Ok(sha256_hex(&bytes))
    }

    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let reader = BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| Error::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }

    /// Verify the hash chain end-to-end. Returns the index (1-based line
    /// number) of the first broken link, if any.
    pub fn verify_chain(&self) -> Result<Option<usize>> {
        let records = self.read_all()?;
        let mut expected_prev = String::new();
        for (i, record) in records.iter().enumerate() {
            if record.prev_hash != expected_prev {
                return Ok(Some(i + 1));
            }
            let recomputed = Self::compute_record_hash(record)?;
            if recomputed != record.record_hash {
                return Ok(Some(i + 1));
            }
            expected_prev = record.record_hash.clone();
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_form_a_valid_chain() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append("snapshot.publish", Some("main"), Some("s1"), "note").unwrap();
        log.append("snapshot.publish", Some("main"), Some("s2"), "note2").unwrap();
        assert_eq!(log.verify_chain().unwrap(), None);
        assert_eq!(log.read_all().unwrap().len(), 2);
    }

    #[test]
    fn detects_tampered_record() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append("snapshot.publish", Some("main"), Some("s1"), "note").unwrap();
        log.append("snapshot.publish", Some("main"), Some("s2"), "note2").unwrap();

        let path = dir.path().join("audit/audit.jsonl");
        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
        lines[0] = lines[0].replace("note", "tampered");
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        assert_eq!(log.verify_chain().unwrap(), Some(1));
    }

    #[test]
    fn empty_log_has_no_break() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        assert_eq!(log.verify_chain().unwrap(), None);
    }
}
