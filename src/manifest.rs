use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use log::{debug, error};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::{resolve, SourceDescriptor, SourceError};

pub const MANIFEST_FILE_NAME: &str = "airepo.toml";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error on manifest {}: {source}", path.display())]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed manifest: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Cannot serialize manifest: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Source `{name}` must set exactly one of `url` and `path`")]
    Location { name: String },
    #[error("Source `{0}` is declared more than once")]
    DuplicateName(String),
    #[error("Invalid source `{name}`: {source}")]
    Source { name: String, source: SourceError },
}

/// Named sources a repository is synced from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub sources: Vec<ManifestSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSource {
    pub name: String,
    /// Any source string, e.g. `gh:owner/repo` or a full git URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Local directory, relative to the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Overrides a ref embedded in `url`.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl ManifestSource {
    /// Resolves the source. Relative paths are taken from `base`.
    pub fn descriptor(&self, base: &Path) -> Result<SourceDescriptor, ManifestError> {
        match (&self.url, &self.path) {
            (Some(url), None) => {
                let descriptor = resolve(url).map_err(|source| ManifestError::Source {
                    name: self.name.clone(),
                    source,
                })?;
                Ok(match descriptor {
                    SourceDescriptor::Remote {
                        kind,
                        url,
                        reference,
                        subpath,
                    } => SourceDescriptor::Remote {
                        kind,
                        url,
                        reference: self.reference.clone().or(reference),
                        subpath,
                    },
                    SourceDescriptor::Local { path } => SourceDescriptor::Local {
                        path: base.join(path),
                    },
                })
            }
            (None, Some(path)) => Ok(SourceDescriptor::Local {
                path: base.join(path),
            }),
            _ => Err(ManifestError::Location {
                name: self.name.clone(),
            }),
        }
    }
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Manifest, ManifestError> {
        debug!("Reading manifest {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::IO {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = Manifest::from_toml_str(&contents);
        if let Err(err) = &manifest {
            error!("Could not load manifest {}: {err}", path.display());
        }
        manifest
    }

    /// Like [`Manifest::from_file`], but a missing file is `None`.
    pub fn load(path: &Path) -> Result<Option<Manifest>, ManifestError> {
        if path.exists() {
            Manifest::from_file(path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn from_toml_str(data: &str) -> Result<Manifest, ManifestError> {
        let manifest: Manifest = toml::from_str(data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ManifestError::IO {
            path: path.to_path_buf(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.url.is_some() == source.path.is_some() {
                return Err(ManifestError::Location {
                    name: source.name.clone(),
                });
            }
            if !names.insert(source.name.as_str()) {
                return Err(ManifestError::DuplicateName(source.name.clone()));
            }
        }
        Ok(())
    }

    /// Adds `source`, replacing a source with the same name.
    pub fn upsert(&mut self, source: ManifestSource) -> Result<(), ManifestError> {
        match self.sources.iter_mut().find(|s| s.name == source.name) {
            Some(existing) => *existing = source,
            None => self.sources.push(source),
        }
        self.validate()
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.name != name);
        self.sources.len() != before
    }

    /// Clone URLs of the remote sources, part of the live set for pruning.
    pub fn live_urls(&self, base: &Path) -> Result<Vec<String>, ManifestError> {
        let mut urls = Vec::new();
        for source in &self.sources {
            if let SourceDescriptor::Remote { url, .. } = source.descriptor(base)? {
                urls.push(url);
            }
        }
        Ok(urls)
    }
}
