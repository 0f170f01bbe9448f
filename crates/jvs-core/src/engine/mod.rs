//! Pluggable directory clone engines (spec.md §4.1).
//!
//! An [`Engine`] exposes exactly two operations, mirroring the teacher's
//! `FsSnapshotProvider` trait: `clone` a directory tree, and report `name()`.
//! Construction of an engine fails when the platform can't support it, so
//! selection happens once at startup rather than mid-operation (Design Notes).

mod copy;
mod fsclone;
mod reflink;

pub use copy::CopyEngine;
pub use fsclone::FsCloneEngine;
pub use reflink::ReflinkEngine;

use crate::error::Result;
use std::fmt;
use std::path::Path;

/// The engine kind recorded on every descriptor and used for explicit selection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Copy,
    Reflink,
    Juicefs,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineKind::Copy => "copy",
            EngineKind::Reflink => "reflink",
            EngineKind::Juicefs => "juicefs",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for EngineKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "copy" => Ok(EngineKind::Copy),
            "reflink" => Ok(EngineKind::Reflink),
            "juicefs" => Ok(EngineKind::Juicefs),
            other => Err(crate::error::Error::invalid_input(format!(
                "unknown engine kind: {other}"
            ))),
        }
    }
}

/// A directory-clone mechanism. Implementations must fail construction (via their
/// `new`/`probe` constructor) rather than fail mid-`clone` when the platform can't
/// support them, so callers can fall back at selection time.
pub trait Engine: Send + Sync {
    /// Clone the directory tree at `src` into a not-yet-existing `dst`, returning the
    /// number of bytes physically moved (informational; CoW engines may report an
    /// estimate rather than the logical tree size).
    fn clone_dir(&self, src: &Path, dst: &Path) -> Result<u64>;

    /// The kind of this engine, recorded on descriptors.
    fn kind(&self) -> EngineKind;
}

/// Probe the repository root for the strongest available engine: attempt a native
/// filesystem clone, then a reflink, falling back to byte-copy. Failure to probe
/// falls back to byte-copy (spec.md §4.1).
pub fn auto_detect(repo_root: &Path) -> Box<dyn Engine> {
    if let Ok(engine) = FsCloneEngine::probe(repo_root) {
        tracing::info!(engine = "juicefs", "auto-detected native filesystem clone support");
        return Box::new(engine);
    }
    if let Ok(engine) = ReflinkEngine::probe(repo_root) {
        tracing::info!(engine = "reflink", "auto-detected reflink support");
        return Box::new(engine);
    }
    tracing::info!(engine = "copy", "falling back to byte-copy engine");
    Box::new(CopyEngine::new())
}

/// Construct the engine requested by `kind`, falling back to byte-copy if
/// construction of the requested kind fails on this platform.
pub fn for_kind(kind: EngineKind, repo_root: &Path) -> Box<dyn Engine> {
    let built = match kind {
        EngineKind::Copy => Ok(Box::new(CopyEngine::new()) as Box<dyn Engine>),
        EngineKind::Reflink => {
            ReflinkEngine::probe(repo_root).map(|e| Box::new(e) as Box<dyn Engine>)
        }
        EngineKind::Juicefs => {
            FsCloneEngine::probe(repo_root).map(|e| Box::new(e) as Box<dyn Engine>)
        }
    };
    built.unwrap_or_else(|e| {
        tracing::warn!(requested = %kind, error = %e, "requested engine unavailable, falling back to copy");
        Box::new(CopyEngine::new())
    })
}

/// Resolve the engine to use for a repository: `JVS_ENGINE` env override takes
/// precedence over `explicit` (typically the repo config's `default_engine`), which
/// in turn takes precedence over auto-detection (spec.md §6).
pub fn select_engine(repo_root: &Path, explicit: Option<EngineKind>) -> Box<dyn Engine> {
    if let Ok(val) = std::env::var("JVS_ENGINE") {
        if let Ok(kind) = val.parse::<EngineKind>() {
            return for_kind(kind, repo_root);
        }
        tracing::warn!(value = %val, "unknown JVS_ENGINE value, falling back to auto-detection");
        return auto_detect(repo_root);
    }
    match explicit {
        Some(kind) => for_kind(kind, repo_root),
        None => auto_detect(repo_root),
    }
}
