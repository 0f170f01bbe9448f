//! Structural and integrity scan producing actionable findings, with repair
//! gated behind an explicit request (spec.md §4.9).

use crate::audit::AuditLog;
use crate::error::Result;
use crate::fsutil;
use crate::repo::Repository;
use crate::snapshot::SnapshotEngine;
use crate::verify::verify_snapshot;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Finding {
    pub category: String,
    pub description: String,
    pub severity: Severity,
    pub error_code: String,
    pub path: Option<String>,
    #[serde(default)]
    pub worktree: Option<String>,
    #[serde(default)]
    pub related_snapshot: Option<String>,
}

/// Run the full structural/integrity scan (spec.md §4.9): format version,
/// orphan staging directories, snapshot directories missing `.READY`,
/// descriptors with no matching snapshot directory, snapshots with no
/// descriptor, worktree head/latest pointers that don't resolve to a ready
/// snapshot, a worktree pointer stuck behind a snapshot that was already
/// durably published (the crash-after-publish-before-pointer-advance
/// window), stale publish intents, and the audit log hash chain. `deep`
/// additionally rehashes every snapshot's payload.
pub fn scan(repo: &Repository, deep: bool) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();

    scan_format_version(repo, &mut findings)?;
    scan_orphan_staging(repo, &mut findings)?;
    scan_snapshots_without_ready(repo, &mut findings)?;
    scan_descriptor_snapshot_consistency(repo, &mut findings)?;
    scan_worktree_pointers(repo, &mut findings)?;
    scan_advance_head_candidates(repo, &mut findings)?;
    scan_stale_intents(repo, &mut findings)?;
    scan_audit_chain(repo, &mut findings)?;
    scan_integrity(repo, deep, &mut findings)?;

    Ok(findings)
}

fn scan_format_version(repo: &Repository, findings: &mut Vec<Finding>) -> Result<()> {
    match repo.format_version() {
        Ok(v) if v == crate::repo::FORMAT_VERSION => {}
        Ok(v) => findings.push(Finding {
            category: "format-version-mismatch".to_string(),
            description: format!("repository format_version {v} does not match supported version {}", crate::repo::FORMAT_VERSION),
            severity: Severity::Critical,
            error_code: "invalid-input".to_string(),
            path: Some(repo.jvs_dir().join("format_version").display().to_string()),
            worktree: None,
            related_snapshot: None,
        }),
        Err(_) => findings.push(Finding {
            category: "format-version-unreadable".to_string(),
            description: "format_version file is missing or unparseable".to_string(),
            severity: Severity::Critical,
            error_code: "invalid-input".to_string(),
            path: Some(repo.jvs_dir().join("format_version").display().to_string()),
            worktree: None,
            related_snapshot: None,
        }),
    }
    Ok(())
}

fn scan_orphan_staging(repo: &Repository, findings: &mut Vec<Finding>) -> Result<()> {
    let snapshots_dir = repo.jvs_dir().join("snapshots");
    if !snapshots_dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&snapshots_dir).map_err(|e| crate::error::Error::io(&snapshots_dir, e))? {
        let entry = entry.map_err(|e| crate::error::Error::io(&snapshots_dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') && name.ends_with(".staging") {
            findings.push(Finding {
                category: "orphan-staging".to_string(),
                description: format!("leftover publish staging directory: {name}"),
                severity: Severity::Warning,
                error_code: "io".to_string(),
                path: Some(entry.path().display().to_string()),
                worktree: None,
                related_snapshot: None,
            });
        }
    }
    Ok(())
}

fn scan_snapshots_without_ready(repo: &Repository, findings: &mut Vec<Finding>) -> Result<()> {
    let snapshots_dir = repo.jvs_dir().join("snapshots");
    if !snapshots_dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&snapshots_dir).map_err(|e| crate::error::Error::io(&snapshots_dir, e))? {
        let entry = entry.map_err(|e| crate::error::Error::io(&snapshots_dir, e))?;
        let path = entry.path();
        if !path.is_dir() || entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if !path.join(".READY").is_file() {
            findings.push(Finding {
                category: "unready-snapshot".to_string(),
                description: format!(
                    "snapshot directory {} has no .READY marker, publish likely interrupted",
                    entry.file_name().to_string_lossy()
                ),
                severity: Severity::Warning,
                error_code: "precondition-failed".to_string(),
                path: Some(path.display().to_string()),
                worktree: None,
                related_snapshot: None,
            });
        }
    }
    Ok(())
}

fn scan_descriptor_snapshot_consistency(repo: &Repository, findings: &mut Vec<Finding>) -> Result<()> {
    let snaps = SnapshotEngine::new(repo.clone());
    let descriptors_dir = repo.jvs_dir().join("descriptors");
    let snapshots_dir = repo.jvs_dir().join("snapshots");

    if descriptors_dir.is_dir() {
        for entry in std::fs::read_dir(&descriptors_dir).map_err(|e| crate::error::Error::io(&descriptors_dir, e))? {
            let entry = entry.map_err(|e| crate::error::Error::io(&descriptors_dir, e))?;
            let id = entry.path().file_stem().unwrap().to_string_lossy().to_string();
            if !snapshots_dir.join(&id).join(".READY").is_file() {
                findings.push(Finding {
                    category: "descriptor-without-snapshot".to_string(),
                    description: format!("descriptor {id} has no ready snapshot directory"),
                    severity: Severity::Critical,
                    error_code: "integrity-tamper".to_string(),
                    path: Some(entry.path().display().to_string()),
                    worktree: None,
                    related_snapshot: None,
                });
            }
        }
    }

    for descriptor in snaps.list_all()? {
        let descriptor_path = crate::descriptor::Descriptor::path(&repo.jvs_dir(), &descriptor.snapshot_id);
        if !descriptor_path.is_file() {
            findings.push(Finding {
                category: "snapshot-without-descriptor".to_string(),
                description: format!("snapshot {} has no descriptor file", descriptor.snapshot_id),
                severity: Severity::Critical,
                error_code: "integrity-tamper".to_string(),
                path: Some(descriptor_path.display().to_string()),
                worktree: None,
                related_snapshot: None,
            });
        }
    }
    Ok(())
}

/// Check 2 (spec.md §4.9): every worktree's `head`/`latest` pointer, if set,
/// must resolve to a ready snapshot.
fn scan_worktree_pointers(repo: &Repository, findings: &mut Vec<Finding>) -> Result<()> {
    let snaps = SnapshotEngine::new(repo.clone());
    for wt in repo.worktree_manager().list()? {
        if let Some(head) = &wt.head {
            if !snaps.ready(head) {
                findings.push(Finding {
                    category: "dangling-head".to_string(),
                    description: format!("worktree '{}' head '{head}' does not resolve to a ready snapshot", wt.name),
                    severity: Severity::Critical,
                    error_code: "integrity-tamper".to_string(),
                    path: None,
                    worktree: Some(wt.name.clone()),
                    related_snapshot: Some(head.clone()),
                });
            }
        }
        if let Some(latest) = &wt.latest {
            if !snaps.ready(latest) {
                findings.push(Finding {
                    category: "dangling-latest".to_string(),
                    description: format!("worktree '{}' latest '{latest}' does not resolve to a ready snapshot", wt.name),
                    severity: Severity::Critical,
                    error_code: "integrity-tamper".to_string(),
                    path: None,
                    worktree: Some(wt.name.clone()),
                    related_snapshot: Some(latest.clone()),
                });
            }
        }
    }
    Ok(())
}

/// Detects the publish crash window between the snapshot becoming durably
/// ready (steps 6-9) and the worktree pointer advancing to it (step 10): a
/// ready, published descriptor whose parent is the worktree's current head
/// but which the worktree's own head hasn't advanced to. Proposes
/// `advance_head` as the repair (spec.md §4.4, §4.9).
fn scan_advance_head_candidates(repo: &Repository, findings: &mut Vec<Finding>) -> Result<()> {
    let snaps = SnapshotEngine::new(repo.clone());
    let all = snaps.list_all()?;
    for wt in repo.worktree_manager().list()? {
        for descriptor in &all {
            if descriptor.worktree_name != wt.name {
                continue;
            }
            if descriptor.parent_snapshot_id.as_deref() != wt.head.as_deref() {
                continue;
            }
            if Some(descriptor.snapshot_id.as_str()) == wt.head.as_deref() {
                continue;
            }
            findings.push(Finding {
                category: "advance-head-candidate".to_string(),
                description: format!(
                    "worktree '{}' head is behind published snapshot '{}', likely a crash between publish completing and the pointer update",
                    wt.name, descriptor.snapshot_id
                ),
                severity: Severity::Warning,
                error_code: "precondition-failed".to_string(),
                path: None,
                worktree: Some(wt.name.clone()),
                related_snapshot: Some(descriptor.snapshot_id.clone()),
            });
        }
    }
    Ok(())
}

fn scan_stale_intents(repo: &Repository, findings: &mut Vec<Finding>) -> Result<()> {
    let intents_dir = repo.jvs_dir().join("intents");
    if !intents_dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&intents_dir).map_err(|e| crate::error::Error::io(&intents_dir, e))? {
        let entry = entry.map_err(|e| crate::error::Error::io(&intents_dir, e))?;
        findings.push(Finding {
            category: "stale-intent".to_string(),
            description: "publish intent without a matching completed snapshot, a crash likely interrupted publish"
                .to_string(),
            severity: Severity::Warning,
            error_code: "precondition-failed".to_string(),
            path: Some(entry.path().display().to_string()),
            worktree: None,
            related_snapshot: None,
        });
    }
    Ok(())
}

fn scan_audit_chain(repo: &Repository, findings: &mut Vec<Finding>) -> Result<()> {
    let log = AuditLog::new(&repo.jvs_dir());
    if let Some(broken_at) = log.verify_chain()? {
        findings.push(Finding {
            category: "audit-chain-broken".to_string(),
            description: format!("audit log hash chain breaks at line {broken_at}"),
            severity: Severity::Critical,
            error_code: "audit-chain-broken".to_string(),
            path: Some(repo.jvs_dir().join("audit/audit.jsonl").display().to_string()),
            worktree: None,
            related_snapshot: None,
        });
    }
    Ok(())
}

fn scan_integrity(repo: &Repository, deep: bool, findings: &mut Vec<Finding>) -> Result<()> {
    let snaps = SnapshotEngine::new(repo.clone());
    for descriptor in snaps.list_all()? {
        let outcome = verify_snapshot(repo, &descriptor.snapshot_id, deep)?;
        if !outcome.ok {
            findings.push(Finding {
                category: "integrity-mismatch".to_string(),
                description: format!("snapshot {}: {}", descriptor.snapshot_id, outcome.detail),
                severity: Severity::Critical,
                error_code: "integrity-tamper".to_string(),
                path: None,
                worktree: None,
                related_snapshot: None,
            });
        }
    }
    Ok(())
}

/// Repair the findings named in `categories`. Only touches orphan staging
/// directories, stale intents, and advance-head candidates; never repairs
/// integrity or audit-chain findings, which require human judgment.
pub fn repair(repo: &Repository, findings: &[Finding], categories: &[&str]) -> Result<usize> {
    let mut repaired = 0;
    for finding in findings {
        if !categories.contains(&finding.category.as_str()) {
            continue;
        }
        match finding.category.as_str() {
            "orphan-staging" | "stale-intent" => {
                let Some(path) = &finding.path else { continue };
                fsutil::remove_if_present(std::path::Path::new(path))?;
                repaired += 1;
            }
            "advance-head-candidate" => {
                let (Some(worktree), Some(snapshot_id)) = (&finding.worktree, &finding.related_snapshot) else {
                    continue;
                };
                repo.worktree_manager().update_pointers(worktree, Some(snapshot_id), Some(snapshot_id))?;
                repaired += 1;
            }
            _ => {}
        }
    }
    Ok(repaired)
}
