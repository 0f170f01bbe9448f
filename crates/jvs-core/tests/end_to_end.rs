//! End-to-end exercise of the publish → fork/restore → gc → doctor lifecycle
//! against a real temp-directory repository (spec.md §8 testable properties).

use jvs_core::engine::{select_engine, CopyEngine};
use jvs_core::gc::GcEngine;
use jvs_core::repo::Repository;
use jvs_core::restore::RestoreEngine;
use jvs_core::snapshot::{PublishOptions, SnapshotEngine};
use tempfile::TempDir;

#[test]
fn full_lifecycle_publish_restore_gc_doctor() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path(), "proj").unwrap();
    let engine = CopyEngine::new();
    let snaps = SnapshotEngine::new(repo.clone());

    std::fs::write(repo.worktree_payload_path("main").join("file.txt"), b"v1").unwrap();
    let snap1 = snaps
        .publish(
            "main",
            &engine,
            PublishOptions {
                note: "initial".into(),
                tags: vec!["v1".into()],
                ..Default::default()
            },
        )
        .unwrap();
    assert!(snaps.ready(&snap1.snapshot_id));

    std::fs::write(repo.worktree_payload_path("main").join("file.txt"), b"v2-updated").unwrap();
    let snap2 = snaps
        .publish(
            "main",
            &engine,
            PublishOptions {
                note: "second".into(),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(snap2.parent_snapshot_id.as_deref(), Some(snap1.snapshot_id.as_str()));

    let restorer = RestoreEngine::new(repo.clone());
    restorer.restore("main", &snap1.snapshot_id, &engine).unwrap();
    let contents = std::fs::read(repo.worktree_payload_path("main").join("file.txt")).unwrap();
    assert_eq!(contents, b"v1");

    let wt = repo.worktree_manager().get("main").unwrap();
    assert!(wt.is_detached(), "restoring to an older snapshot must detach the worktree");

    let publish_while_detached = snaps.publish("main", &engine, PublishOptions::default());
    assert!(publish_while_detached.is_err(), "publish must be rejected while detached");

    restorer.restore_to_latest("main", &engine).unwrap();
    assert!(!repo.worktree_manager().get("main").unwrap().is_detached());

    let gc = GcEngine::new(repo.clone());
    let plan = gc.plan(&jvs_core::gc::GcPolicy::default()).unwrap();
    assert!(
        plan.candidates.is_empty(),
        "both snapshots are in main's lineage and must stay protected"
    );

    let findings = jvs_core::doctor::scan(&repo, true).unwrap();
    assert!(findings.is_empty(), "clean repository should have no doctor findings: {findings:?}");

    let resolved = snaps.resolve("main", "v1").unwrap();
    assert_eq!(resolved, snap1.snapshot_id);

    let auto = select_engine(repo.root(), None);
    assert_eq!(auto.kind(), jvs_core::engine::EngineKind::Copy);
}
