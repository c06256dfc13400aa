use std::{collections::HashMap, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::{import::ImportMode, workspace::CorruptionPolicy};

/// Settings read from `AIREPO_*` environment variables.
pub struct AirepoConfig {
    pub repo_dir: Option<PathBuf>,
    pub import_mode: Option<ImportMode>,
    pub cache_corruption: Option<CorruptionPolicy>,
    pub git_program: Option<String>,
}

impl AirepoConfig {
    pub fn load() -> anyhow::Result<Self> {
        let raw_config = RawConfig::load(None)?;

        Ok(Self {
            repo_dir: raw_config.repo.dir,
            import_mode: raw_config.import.mode,
            cache_corruption: raw_config.cache.corruption,
            git_program: raw_config.git.program,
        })
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    repo: RepoConfig,
    #[serde(default)]
    import: ImportConfig,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    git: GitConfig,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RepoConfig {
    dir: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct ImportConfig {
    mode: Option<ImportMode>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct CacheConfig {
    corruption: Option<CorruptionPolicy>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct GitConfig {
    program: Option<String>,
}

impl RawConfig {
    fn load(env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("AIREPO").separator("_").source(env))
            .build()?
            .try_deserialize()
    }
}
