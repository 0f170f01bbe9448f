use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jvs_core::engine::select_engine;
use jvs_core::repo::Repository;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "jvs", version, about = "Snapshot-native workspace versioning")]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Emit machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a new repository.
    Init { name: String },
    /// Publish a new snapshot of a worktree.
    Snapshot {
        #[arg(long, default_value = "main")]
        worktree: String,
        #[arg(long, default_value = "")]
        note: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long = "path")]
        partial_paths: Vec<String>,
        #[arg(long)]
        gzip: Option<u32>,
    },
    /// Restore a worktree to a specific snapshot.
    Restore {
        #[arg(long, default_value = "main")]
        worktree: String,
        reference: String,
    },
    /// Restore a worktree to its own latest snapshot, clearing detached state.
    RestoreHead {
        #[arg(long, default_value = "main")]
        worktree: String,
    },
    /// List published snapshots.
    History {
        #[arg(long, default_value = "main")]
        worktree: String,
    },
    /// Diff two snapshots.
    Diff {
        #[arg(long, default_value = "main")]
        worktree: String,
        from: String,
        to: String,
    },
    /// Verify snapshot integrity.
    Verify {
        reference: Option<String>,
        #[arg(long)]
        deep: bool,
    },
    /// Run structural and integrity checks.
    Doctor {
        #[arg(long)]
        deep: bool,
        #[arg(long)]
        repair: bool,
    },
    /// Garbage collection.
    Gc {
        #[command(subcommand)]
        action: GcAction,
    },
    /// Worktree management.
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },
    /// Named ref management.
    Ref {
        #[command(subcommand)]
        action: RefAction,
    },
    /// Print repository metadata.
    Info,
}

#[derive(Subcommand)]
enum GcAction {
    Plan {
        /// Always keep the N most recently created snapshots per worktree.
        #[arg(long)]
        keep_last_n: Option<u64>,
        /// Always keep snapshots created within the last N days.
        #[arg(long)]
        keep_days: Option<u64>,
        /// Always keep snapshots carrying at least one tag with this prefix (repeatable).
        #[arg(long = "keep-tag-prefix")]
        keep_tag_prefixes: Vec<String>,
        /// Evict retention-protected snapshots, oldest first, until the repo's snapshot
        /// storage is at or under this many bytes.
        #[arg(long)]
        max_bytes: Option<u64>,
    },
    Run { plan_id: String },
}

#[derive(Subcommand)]
enum WorktreeAction {
    Create { name: String },
    Fork {
        new_name: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        snapshot: String,
    },
    List,
    Rename { old_name: String, new_name: String },
    Remove { name: String },
    Path { name: String },
}

#[derive(Subcommand)]
enum RefAction {
    Create { name: String, snapshot_id: String },
    List,
    Delete { name: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if let Some(core_err) = e.downcast_ref::<jvs_core::Error>() {
                if core_err.is_critical() {
                    return ExitCode::from(2);
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    let repo_root = cli.repo.clone().unwrap_or(cwd);

    match cli.command {
        Command::Init { name } => {
            let parent = repo_root;
            let repo = Repository::init(&parent, &name)?;
            println!("initialized repository at {}", repo.root().display());
            Ok(())
        }
        Command::Snapshot {
            worktree,
            note,
            tags,
            partial_paths,
            gzip,
        } => {
            let repo = Repository::open(&repo_root)?;
            let engine = select_engine(repo.root(), repo.config()?.default_engine_kind());
            let snaps = jvs_core::snapshot::SnapshotEngine::new(repo);
            let options = jvs_core::snapshot::PublishOptions {
                note,
                tags,
                partial_paths: if partial_paths.is_empty() {
                    None
                } else {
                    Some(partial_paths)
                },
                gzip_level: gzip,
            };
            let descriptor = snaps.publish(&worktree, engine.as_ref(), options)?;
            print_json_or(cli.json, &descriptor, || {
                println!("published {}", descriptor.snapshot_id)
            })
        }
        Command::Restore { worktree, reference } => {
            let repo = Repository::open(&repo_root)?;
            let engine = select_engine(repo.root(), repo.config()?.default_engine_kind());
            let snaps = jvs_core::snapshot::SnapshotEngine::new(repo.clone());
            let snapshot_id = snaps.resolve(&worktree, &reference)?;
            jvs_core::restore::RestoreEngine::new(repo).restore(&worktree, &snapshot_id, engine.as_ref())?;
            println!("restored {worktree} to {snapshot_id}");
            Ok(())
        }
        Command::RestoreHead { worktree } => {
            let repo = Repository::open(&repo_root)?;
            let engine = select_engine(repo.root(), repo.config()?.default_engine_kind());
            jvs_core::restore::RestoreEngine::new(repo).restore_to_latest(&worktree, engine.as_ref())?;
            println!("restored {worktree} to latest");
            Ok(())
        }
        Command::History { worktree } => {
            let repo = Repository::open(&repo_root)?;
            let snaps = jvs_core::snapshot::SnapshotEngine::new(repo);
            let mut all: Vec<_> = snaps.list_all()?.into_iter().filter(|d| d.worktree_name == worktree).collect();
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            print_json_or(cli.json, &all, || {
                for d in &all {
                    println!("{}  {}  {}", d.snapshot_id, d.created_at, d.note);
                }
            })
        }
        Command::Diff { worktree, from, to } => {
            let repo = Repository::open(&repo_root)?;
            let snaps = jvs_core::snapshot::SnapshotEngine::new(repo.clone());
            let from_id = snaps.resolve(&worktree, &from)?;
            let to_id = snaps.resolve(&worktree, &to)?;
            let result = jvs_core::diff::diff_snapshots(&repo, &from_id, &to_id)?;
            print_json_or(cli.json, &result, || {
                for entry in &result.entries {
                    println!("{:?} {}", entry.kind, entry.path);
                }
                println!(
                    "summary: +{} -{} ~{}",
                    result.summary.added, result.summary.removed, result.summary.modified
                );
            })
        }
        Command::Verify { reference, deep } => {
            let repo = Repository::open(&repo_root)?;
            if let Some(reference) = reference {
                let snaps = jvs_core::snapshot::SnapshotEngine::new(repo.clone());
                let id = match snaps.resolve("main", &reference) {
                    Ok(id) => id,
                    Err(_) => reference,
                };
                let outcome = jvs_core::verify::verify_snapshot(&repo, &id, deep)?;
                print_json_or(cli.json, &outcome, || println!("{}: {}", outcome.snapshot_id, outcome.detail))
            } else {
                let outcomes = jvs_core::verify::verify_all(&repo, deep)?;
                let any_bad = outcomes.iter().any(|o| !o.ok);
                print_json_or(cli.json, &outcomes, || {
                    for o in &outcomes {
                        println!("{}: {}", o.snapshot_id, o.detail);
                    }
                })?;
                if any_bad {
                    bail!("one or more snapshots failed verification");
                }
                Ok(())
            }
        }
        Command::Doctor { deep, repair } => {
            let repo = Repository::open(&repo_root)?;
            let findings = jvs_core::doctor::scan(&repo, deep)?;
            if repair {
                let repaired = jvs_core::doctor::repair(
                    &repo,
                    &findings,
                    &["orphan-staging", "stale-intent", "advance-head-candidate"],
                )?;
                println!("repaired {repaired} finding(s)");
            }
            let critical = findings
                .iter()
                .any(|f| matches!(f.severity, jvs_core::doctor::Severity::Critical));
            print_json_or(cli.json, &findings, || {
                for f in &findings {
                    println!("[{:?}] {}: {}", f.severity, f.category, f.description);
                }
                if findings.is_empty() {
                    println!("no findings");
                }
            })?;
            if critical {
                bail!("doctor found critical findings");
            }
            Ok(())
        }
        Command::Gc { action } => {
            let repo = Repository::open(&repo_root)?;
            let retention = repo.config()?.retention_policy;
            let gc = jvs_core::gc::GcEngine::new(repo);
            match action {
                GcAction::Plan {
                    keep_last_n,
                    keep_days,
                    keep_tag_prefixes,
                    max_bytes,
                } => {
                    let policy = jvs_core::gc::GcPolicy {
                        keep_last_n,
                        keep_days,
                        keep_tag_prefixes,
                        max_repo_bytes: max_bytes,
                    }
                    .with_config_defaults(&retention)?;
                    let plan = gc.plan(&policy)?;
                    print_json_or(cli.json, &plan, || {
                        println!("plan {} ({} candidates)", plan.plan_id, plan.candidates.len())
                    })
                }
                GcAction::Run { plan_id } => {
                    let result = gc.run(&plan_id)?;
                    print_json_or(cli.json, &result, || {
                        println!("deleted {} failed {}", result.deleted.len(), result.failed.len())
                    })
                }
            }
        }
        Command::Worktree { action } => worktree_command(&repo_root, cli.json, action),
        Command::Ref { action } => ref_command(&repo_root, cli.json, action),
        Command::Info => {
            let repo = Repository::open(&repo_root)?;
            println!("repo_id: {}", repo.repo_id()?);
            println!("format_version: {}", repo.format_version()?);
            Ok(())
        }
    }
}

fn worktree_command(repo_root: &PathBuf, json: bool, action: WorktreeAction) -> Result<()> {
    let repo = Repository::open(repo_root)?;
    let mgr = repo.worktree_manager();
    match action {
        WorktreeAction::Create { name } => {
            mgr.create(&name, None)?;
            println!("created worktree {name}");
            Ok(())
        }
        WorktreeAction::Fork { new_name, from, snapshot } => {
            let engine = select_engine(repo.root(), repo.config()?.default_engine_kind());
            mgr.fork(&new_name, &from, &snapshot, engine.as_ref())?;
            println!("forked {new_name} from {from}@{snapshot}");
            Ok(())
        }
        WorktreeAction::List => {
            let all = mgr.list()?;
            print_json_or(json, &all, || {
                for wt in &all {
                    println!(
                        "{}  head={:?} latest={:?} detached={}",
                        wt.name,
                        wt.head,
                        wt.latest,
                        wt.is_detached()
                    );
                }
            })
        }
        WorktreeAction::Rename { old_name, new_name } => {
            mgr.rename(&old_name, &new_name)?;
            println!("renamed {old_name} to {new_name}");
            Ok(())
        }
        WorktreeAction::Remove { name } => {
            mgr.remove(&name)?;
            println!("removed worktree {name}");
            Ok(())
        }
        WorktreeAction::Path { name } => {
            println!("{}", repo.worktree_payload_path(&name).display());
            Ok(())
        }
    }
}

fn ref_command(repo_root: &PathBuf, json: bool, action: RefAction) -> Result<()> {
    let repo = Repository::open(repo_root)?;
    let mgr = jvs_core::refs::RefManager::new(repo);
    match action {
        RefAction::Create { name, snapshot_id } => {
            mgr.create(&name, &snapshot_id)?;
            println!("created ref {name} -> {snapshot_id}");
            Ok(())
        }
        RefAction::List => {
            let all = mgr.list()?;
            print_json_or(json, &all, || {
                for r in &all {
                    println!("{} -> {}", r.name, r.snapshot_id);
                }
            })
        }
        RefAction::Delete { name } => {
            mgr.delete(&name)?;
            println!("deleted ref {name}");
            Ok(())
        }
    }
}

fn print_json_or<T: serde::Serialize>(json: bool, value: &T, text: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text();
    }
    Ok(())
}
