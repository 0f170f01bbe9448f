//! Repository-scoped configuration: `.jvs/config.yaml` (spec.md §6).

use crate::engine::EngineKind;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_min_snapshots: Option<u64>,
    pub keep_min_age: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    pub default_engine: Option<String>,
    #[serde(default)]
    pub default_tags: Vec<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub progress_enabled: bool,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
}

impl RepoConfig {
    /// Load `.jvs/config.yaml` if present; a repository with no config file gets
    /// all-default settings.
    pub fn load(jvs_dir: &Path) -> Result<Self> {
        let path = jvs_dir.join("config.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| crate::error::Error::io(&path, e))?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// The engine kind this config's `default_engine` names, if any and if it
    /// parses; `auto`/unset/unrecognized means "let the caller auto-detect".
    pub fn default_engine_kind(&self) -> Option<EngineKind> {
        self.default_engine
            .as_deref()
            .and_then(|s| s.parse::<EngineKind>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_is_all_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = RepoConfig::load(dir.path()).unwrap();
        assert!(cfg.default_engine.is_none());
        assert!(cfg.default_tags.is_empty());
    }

    #[test]
    fn parses_recognized_keys() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "default_engine: reflink\ndefault_tags: [nightly]\noutput_format: json\n",
        )
        .unwrap();
        let cfg = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.default_engine.as_deref(), Some("reflink"));
        assert_eq!(cfg.default_tags, vec!["nightly".to_string()]);
        assert_eq!(cfg.default_engine_kind(), Some(EngineKind::Reflink));
    }
}
