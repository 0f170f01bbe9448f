//! Error taxonomy for the JVS repository engine.
//!
//! Every variant maps to one of the kinds in the error-handling design: not-found,
//! ambiguous, invalid-input, precondition-failed, plan-mismatch, integrity-tamper,
//! io, audit-chain-broken. `error_code` is the stable discriminator CLI hosts surface
//! under `--json`.

use std::path::PathBuf;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {what} '{id}'")]
    NotFound { what: &'static str, id: String },

    #[error("ambiguous {what} '{input}': candidates {candidates:?}")]
    Ambiguous {
        what: &'static str,
        input: String,
        candidates: Vec<String>,
    },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("gc plan mismatch: plan '{plan_id}' no longer matches repository state")]
    PlanMismatch { plan_id: String },

    #[error("integrity tamper detected on snapshot '{snapshot_id}': {detail}")]
    IntegrityTamper { snapshot_id: String, detail: String },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("audit chain broken at line {line}: {detail}")]
    AuditChainBroken { line: usize, detail: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl Error {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn ambiguous(
        what: &'static str,
        input: impl Into<String>,
        candidates: Vec<String>,
    ) -> Self {
        Self::Ambiguous {
            what,
            input: input.into(),
            candidates,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The stable machine-readable discriminator for `--json` error output.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not-found",
            Error::Ambiguous { .. } => "ambiguous",
            Error::InvalidInput { .. } => "invalid-input",
            Error::PreconditionFailed { .. } => "precondition-failed",
            Error::PlanMismatch { .. } => "plan-mismatch",
            Error::IntegrityTamper { .. } => "integrity-tamper",
            Error::Io { .. } => "io",
            Error::AuditChainBroken { .. } => "audit-chain-broken",
            Error::Serde(_) => "io",
            Error::Config(_) => "io",
        }
    }

    /// Whether this error kind should be treated as a critical, non-zero-exit
    /// condition by a CLI host.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Error::IntegrityTamper { .. } | Error::PlanMismatch { .. } | Error::AuditChainBroken { .. }
        )
    }
}
