//! Two-phase garbage collection: a read-only `plan()` fixes the candidate set
//! under a protection set and a retention policy, and `run()` commits
//! deletions against a specific plan id through an explicit mark-then-commit
//! state machine, independently per candidate (spec.md §4.8).

use crate::audit::AuditLog;
use crate::config::RetentionPolicy;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::refs::RefManager;
use crate::repo::Repository;
use crate::snapshot::SnapshotEngine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Retention parameters consumed by [`GcEngine::plan`]. CLI flags override
/// the repository's configured `retention_policy` defaults field-by-field
/// (spec.md §6); any field left `None`/empty imposes no constraint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GcPolicy {
    pub keep_last_n: Option<u64>,
    pub keep_days: Option<u64>,
    #[serde(default)]
    pub keep_tag_prefixes: Vec<String>,
    pub max_repo_bytes: Option<u64>,
}

impl GcPolicy {
    /// Fill in any unset field from the repository's configured defaults
    /// (`retention_policy.keep_min_snapshots` / `keep_min_age`).
    pub fn with_config_defaults(mut self, config: &RetentionPolicy) -> Result<Self> {
        if self.keep_last_n.is_none() {
            self.keep_last_n = config.keep_min_snapshots;
        }
        if self.keep_days.is_none() {
            if let Some(age) = &config.keep_min_age {
                self.keep_days = Some(parse_days(age)?);
            }
        }
        Ok(self)
    }
}

fn parse_days(spec: &str) -> Result<u64> {
    let re = Regex::new(r"^(\d+)d$").expect("valid regex");
    let caps = re
        .captures(spec.trim())
        .ok_or_else(|| Error::invalid_input(format!("invalid retention age spec (want '<n>d'): {spec}")))?;
    caps[1]
        .parse::<u64>()
        .map_err(|_| Error::invalid_input(format!("invalid retention age spec: {spec}")))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcPlan {
    pub plan_id: String,
    pub created_at: String,
    pub candidates: Vec<String>,
    pub protected: Vec<String>,
    pub policy: GcPolicy,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcState {
    Marked,
    Committed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tombstone {
    pub snapshot_id: String,
    pub plan_id: String,
    pub gc_state: GcState,
    pub marked_at: String,
    pub committed_at: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcRunResult {
    pub plan_id: String,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct GcEngine {
    repo: Repository,
}

impl GcEngine {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    fn plans_dir(&self) -> PathBuf {
        self.repo.jvs_dir().join("gc/plans")
    }

    fn tombstones_dir(&self) -> PathBuf {
        self.repo.jvs_dir().join("gc/tombstones")
    }

    fn tombstone_path(&self, snapshot_id: &str) -> PathBuf {
        self.tombstones_dir().join(format!("{snapshot_id}.json"))
    }

    /// Compute the hard protection set: every worktree's head and latest,
    /// every named ref's target, the full ancestry chain of any protected
    /// snapshot (lineage via `parent_snapshot_id`), plus any snapshot with an
    /// unreleased publish intent still on disk. Nothing in this set is ever
    /// eligible for deletion regardless of retention policy (spec.md §4.8).
    pub fn protection_set(&self) -> Result<BTreeSet<String>> {
        let snaps = SnapshotEngine::new(self.repo.clone());
        let by_id: std::collections::HashMap<String, crate::descriptor::Descriptor> =
            snaps.list_all()?.into_iter().map(|d| (d.snapshot_id.clone(), d)).collect();

        let mut roots = BTreeSet::new();
        for wt in self.repo.worktree_manager().list()? {
            if let Some(h) = wt.head {
                roots.insert(h);
            }
            if let Some(l) = wt.latest {
                roots.insert(l);
            }
        }
        for r in RefManager::new(self.repo.clone()).list()? {
            roots.insert(r.snapshot_id);
        }

        let mut protected = BTreeSet::new();
        let mut frontier: Vec<String> = roots.into_iter().collect();
        while let Some(id) = frontier.pop() {
            if !protected.insert(id.clone()) {
                continue;
            }
            if let Some(parent) = by_id.get(&id).and_then(|d| d.parent_snapshot_id.clone()) {
                frontier.push(parent);
            }
        }

        let intents_dir = self.repo.jvs_dir().join("intents");
        if intents_dir.is_dir() {
            for entry in std::fs::read_dir(&intents_dir).map_err(|e| Error::io(&intents_dir, e))? {
                let entry = entry.map_err(|e| Error::io(&intents_dir, e))?;
                if let Some(stem) = entry.path().file_stem() {
                    protected.insert(stem.to_string_lossy().to_string());
                }
            }
        }

        Ok(protected)
    }

    /// Apply `policy`'s `keep_last_n`/`keep_days`/`keep_tag_prefixes`/
    /// `max_repo_bytes` on top of the hard protection set, returning
    /// `(candidates, protected)` both sorted. Candidates are every published
    /// snapshot that survives neither the hard protection set nor retention.
    fn compute_candidates(&self, policy: &GcPolicy) -> Result<(Vec<String>, Vec<String>)> {
        let snaps = SnapshotEngine::new(self.repo.clone());
        let hard_protected = self.protection_set()?;
        let mut all = snaps.list_all()?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at)); // newest first

        let mut retention_protected: BTreeSet<String> = BTreeSet::new();

        if let Some(n) = policy.keep_last_n {
            for d in all.iter().filter(|d| !hard_protected.contains(&d.snapshot_id)).take(n as usize) {
                retention_protected.insert(d.snapshot_id.clone());
            }
        }
        if let Some(days) = policy.keep_days {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(days as i64);
            for d in &all {
                if hard_protected.contains(&d.snapshot_id) {
                    continue;
                }
                if let Ok(created) = chrono::DateTime::parse_from_rfc3339(&d.created_at) {
                    if created >= cutoff {
                        retention_protected.insert(d.snapshot_id.clone());
                    }
                }
            }
        }
        if !policy.keep_tag_prefixes.is_empty() {
            for d in &all {
                if hard_protected.contains(&d.snapshot_id) {
                    continue;
                }
                if d.tags.iter().any(|t| policy.keep_tag_prefixes.iter().any(|p| t.starts_with(p.as_str()))) {
                    retention_protected.insert(d.snapshot_id.clone());
                }
            }
        }

        if let Some(budget) = policy.max_repo_bytes {
            let sizes: BTreeMap<String, u64> = all
                .iter()
                .map(|d| Ok((d.snapshot_id.clone(), dir_size(&snaps.payload_path(&d.snapshot_id))?)))
                .collect::<Result<_>>()?;

            let mut survivors: BTreeSet<String> = hard_protected.union(&retention_protected).cloned().collect();
            let mut total: u64 = survivors.iter().map(|id| sizes.get(id).copied().unwrap_or(0)).sum();

            // Evict retention-protected snapshots oldest-first (never hard-protected
            // ones) until the surviving set fits under the byte budget.
            for d in all.iter().rev() {
                if total <= budget {
                    break;
                }
                if hard_protected.contains(&d.snapshot_id) || !retention_protected.contains(&d.snapshot_id) {
                    continue;
                }
                retention_protected.remove(&d.snapshot_id);
                survivors.remove(&d.snapshot_id);
                total = total.saturating_sub(sizes.get(&d.snapshot_id).copied().unwrap_or(0));
            }
        }

        let protected: BTreeSet<String> = hard_protected.union(&retention_protected).cloned().collect();
        let mut candidates: Vec<String> = all
            .into_iter()
            .map(|d| d.snapshot_id)
            .filter(|id| !protected.contains(id))
            .collect();
        candidates.sort();

        Ok((candidates, protected.into_iter().collect()))
    }

    /// Compute a deterministic candidate set under `policy` and persist it
    /// under a `plan_id` derived from the plan's own content, so replanning
    /// identical repository state with identical policy always yields the
    /// same `plan_id` (spec.md §4.8). Read-only: no deletion happens until
    /// `run` is called against this plan_id.
    pub fn plan(&self, policy: &GcPolicy) -> Result<GcPlan> {
        let (candidates, protected) = self.compute_candidates(policy)?;
        let plan_id = compute_plan_id(&candidates, &protected, policy)?;

        let plan = GcPlan {
            plan_id,
            created_at: chrono::Utc::now().to_rfc3339(),
            candidates,
            protected,
            policy: policy.clone(),
        };
        let path = self.plans_dir().join(format!("{}.json", plan.plan_id));
        fsutil::atomic_write(&path, serde_json::to_vec_pretty(&plan)?.as_slice())?;
        Ok(plan)
    }

    pub fn load_plan(&self, plan_id: &str) -> Result<GcPlan> {
        let path = self.plans_dir().join(format!("{plan_id}.json"));
        let contents = std::fs::read_to_string(&path).map_err(|_| Error::not_found("gc plan", plan_id.to_string()))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Commit deletions for a previously computed plan.
    ///
    /// If every candidate already carries a terminal (`committed`/`failed`)
    /// tombstone from an earlier call, this is a no-op that replays the prior
    /// outcome (idempotent re-run). Otherwise the candidate set is recomputed
    /// under the plan's own policy and compared for exact set-equality
    /// against the recorded plan; any mismatch — a snapshot became protected,
    /// or a new one appeared — fails the whole run as `Error::PlanMismatch`
    /// before anything is touched. Only then does the two-phase mark (write
    /// `gc_state=marked` for every candidate) followed by commit (delete,
    /// then `gc_state=committed` or `failed`) proceed.
    pub fn run(&self, plan_id: &str) -> Result<GcRunResult> {
        let plan = self.load_plan(plan_id)?;
        let existing = self.load_tombstones(&plan.candidates)?;

        let already_done = !plan.candidates.is_empty()
            && plan
                .candidates
                .iter()
                .all(|id| matches!(existing.get(id).map(|t| t.gc_state), Some(GcState::Committed) | Some(GcState::Failed)));

        if already_done {
            let mut deleted = Vec::new();
            let mut failed = Vec::new();
            for id in &plan.candidates {
                match existing.get(id).map(|t| t.gc_state) {
                    Some(GcState::Committed) => deleted.push(id.clone()),
                    Some(GcState::Failed) => failed.push((id.clone(), "previous commit attempt failed".to_string())),
                    _ => unreachable!("already_done guarantees a terminal state"),
                }
            }
            return Ok(GcRunResult {
                plan_id: plan_id.to_string(),
                deleted,
                failed,
            });
        }

        let (live_candidates, _live_protected) = self.compute_candidates(&plan.policy)?;
        let recorded: BTreeSet<&String> = plan.candidates.iter().collect();
        let live: BTreeSet<&String> = live_candidates.iter().collect();
        if recorded != live {
            return Err(Error::PlanMismatch {
                plan_id: plan_id.to_string(),
            });
        }

        for snapshot_id in &plan.candidates {
            self.mark(&plan.plan_id, snapshot_id)?;
        }

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for snapshot_id in &plan.candidates {
            match self.commit(snapshot_id) {
                Ok(()) => deleted.push(snapshot_id.clone()),
                Err(e) => {
                    tracing::warn!(snapshot_id = %snapshot_id, error = %e, "gc commit failed for candidate");
                    let _ = self.mark_failed(&plan.plan_id, snapshot_id);
                    failed.push((snapshot_id.clone(), e.to_string()));
                }
            }
        }

        AuditLog::new(&self.repo.jvs_dir()).append(
            "gc.run",
            None,
            None,
            &format!("plan={plan_id} deleted={} failed={}", deleted.len(), failed.len()),
        )?;

        Ok(GcRunResult {
            plan_id: plan_id.to_string(),
            deleted,
            failed,
        })
    }

    fn load_tombstones(&self, ids: &[String]) -> Result<BTreeMap<String, Tombstone>> {
        let mut out = BTreeMap::new();
        for id in ids {
            let path = self.tombstone_path(id);
            if path.is_file() {
                let contents = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
                out.insert(id.clone(), serde_json::from_str(&contents)?);
            }
        }
        Ok(out)
    }

    fn mark(&self, plan_id: &str, snapshot_id: &str) -> Result<()> {
        let tombstone = Tombstone {
            snapshot_id: snapshot_id.to_string(),
            plan_id: plan_id.to_string(),
            gc_state: GcState::Marked,
            marked_at: chrono::Utc::now().to_rfc3339(),
            committed_at: None,
        };
        fsutil::atomic_write(&self.tombstone_path(snapshot_id), serde_json::to_vec_pretty(&tombstone)?.as_slice())
    }

    fn commit(&self, snapshot_id: &str) -> Result<()> {
        let snapshot_dir = self.repo.jvs_dir().join("snapshots").join(snapshot_id);
        let descriptor_path = crate::descriptor::Descriptor::path(&self.repo.jvs_dir(), snapshot_id);
        fsutil::remove_if_present(&snapshot_dir)?;
        fsutil::remove_if_present(&descriptor_path)?;

        let path = self.tombstone_path(snapshot_id);
        let mut tombstone: Tombstone = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(_) => Tombstone {
                snapshot_id: snapshot_id.to_string(),
                plan_id: String::new(),
                gc_state: GcState::Marked,
                marked_at: chrono::Utc::now().to_rfc3339(),
                committed_at: None,
            },
        };
        tombstone.gc_state = GcState::Committed;
        tombstone.committed_at = Some(chrono::Utc::now().to_rfc3339());
        fsutil::atomic_write(&path, serde_json::to_vec_pretty(&tombstone)?.as_slice())
    }

    fn mark_failed(&self, plan_id: &str, snapshot_id: &str) -> Result<()> {
        let path = self.tombstone_path(snapshot_id);
        let mut tombstone: Tombstone = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(_) => Tombstone {
                snapshot_id: snapshot_id.to_string(),
                plan_id: plan_id.to_string(),
                gc_state: GcState::Marked,
                marked_at: chrono::Utc::now().to_rfc3339(),
                committed_at: None,
            },
        };
        tombstone.gc_state = GcState::Failed;
        fsutil::atomic_write(&path, serde_json::to_vec_pretty(&tombstone)?.as_slice())
    }
}

fn compute_plan_id(candidates: &[String], protected: &[String], policy: &GcPolicy) -> Result<String> {
    let mut sorted_candidates = candidates.to_vec();
    sorted_candidates.sort();
    let mut sorted_protected = protected.to_vec();
    sorted_protected.sort();
    let payload = serde_json::json!({
        "candidates": sorted_candidates,
        "protected": sorted_protected,
        "policy": policy,
    });
    let bytes = serde_json::to_vec(&payload)?;
    Ok(format!("gcplan-{}", &crate::hashing::sha256_hex(&bytes)[..16]))
}

fn dir_size(path: &Path) -> Result<u64> {
    if !path.is_dir() {
        return Ok(0);
    }
    let mut total = 0u64;
    for entry in std::fs::read_dir(path).map_err(|e| Error::io(path, e))? {
        let entry = entry.map_err(|e| Error::io(path, e))?;
        let p = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::io(&p, e))?;
        if file_type.is_dir() {
            total += dir_size(&p)?;
        } else if file_type.is_file() {
            total += entry.metadata().map_err(|e| Error::io(&p, e))?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CopyEngine;
    use crate::snapshot::{PublishOptions, SnapshotEngine};
    use tempfile::TempDir;

    #[test]
    fn plan_excludes_protected_head_and_lineage() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let d1 = snaps.publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() }).unwrap();
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v2").unwrap();
        let d2 = snaps.publish("main", &engine, PublishOptions { note: "v2".into(), ..Default::default() }).unwrap();

        let gc = GcEngine::new(repo.clone());
        let plan = gc.plan(&GcPolicy::default()).unwrap();
        // d2 is head/latest; d1 is its parent lineage — both protected, candidates empty.
        assert!(plan.candidates.is_empty());
        assert!(plan.protected.contains(&d1.snapshot_id));
        assert!(plan.protected.contains(&d2.snapshot_id));
    }

    #[test]
    fn plan_id_is_deterministic_for_identical_state() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        snaps.publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() }).unwrap();

        let gc = GcEngine::new(repo.clone());
        let plan1 = gc.plan(&GcPolicy::default()).unwrap();
        let plan2 = gc.plan(&GcPolicy::default()).unwrap();
        assert_eq!(plan1.plan_id, plan2.plan_id);
    }

    #[test]
    fn run_deletes_unprotected_candidate() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let d1 = snaps.publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() }).unwrap();

        let wt_mgr = repo.worktree_manager();
        wt_mgr.update_pointers("main", Some("other"), Some("other")).unwrap();

        let gc = GcEngine::new(repo.clone());
        let plan = gc.plan(&GcPolicy::default()).unwrap();
        assert!(plan.candidates.contains(&d1.snapshot_id));

        let result = gc.run(&plan.plan_id).unwrap();
        assert_eq!(result.deleted, vec![d1.snapshot_id.clone()]);
        assert!(!snaps.ready(&d1.snapshot_id));
    }

    #[test]
    fn run_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let d1 = snaps.publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() }).unwrap();
        repo.worktree_manager().update_pointers("main", Some("other"), Some("other")).unwrap();

        let gc = GcEngine::new(repo.clone());
        let plan = gc.plan(&GcPolicy::default()).unwrap();
        gc.run(&plan.plan_id).unwrap();
        let second = gc.run(&plan.plan_id).unwrap();
        assert_eq!(second.deleted, vec![d1.snapshot_id]);
        assert!(second.failed.is_empty());
    }

    #[test]
    fn run_fails_with_plan_mismatch_when_candidate_becomes_protected() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let d1 = snaps.publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() }).unwrap();
        repo.worktree_manager().update_pointers("main", Some("other"), Some("other")).unwrap();

        let gc = GcEngine::new(repo.clone());
        let plan = gc.plan(&GcPolicy::default()).unwrap();

        // d1 becomes protected again (e.g. a ref now points at it) before run().
        crate::refs::RefManager::new(repo.clone()).create("keep", &d1.snapshot_id).unwrap();

        let err = gc.run(&plan.plan_id).unwrap_err();
        assert_eq!(err.error_code(), "plan-mismatch");
    }

    #[test]
    fn keep_last_n_protects_newest_snapshots() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "r1").unwrap();
        let engine = CopyEngine;
        let snaps = SnapshotEngine::new(repo.clone());
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v1").unwrap();
        let d1 = snaps.publish("main", &engine, PublishOptions { note: "v1".into(), ..Default::default() }).unwrap();
        std::fs::write(repo.worktree_payload_path("main").join("a.txt"), b"v2").unwrap();
        let d2 = snaps.publish("main", &engine, PublishOptions { note: "v2".into(), ..Default::default() }).unwrap();
        // Orphan both from worktree pointers so only retention policy protects them.
        repo.worktree_manager().update_pointers("main", Some("other"), Some("other")).unwrap();

        let gc = GcEngine::new(repo.clone());
        let policy = GcPolicy { keep_last_n: Some(1), ..Default::default() };
        let plan = gc.plan(&policy).unwrap();
        assert!(plan.protected.contains(&d2.snapshot_id));
        assert!(plan.candidates.contains(&d1.snapshot_id));
    }
}
