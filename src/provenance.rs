//! Per resource JSON sidecars recording where each resource came from.
//!
//! Records live at `.metadata/<type>s/<name>-metadata.json`. Nested command
//! names keep their directories, so `api/deploy` and `api-deploy` never share
//! a sidecar. Remote git records are the only evidence that keeps a workspace
//! cache entry alive during pruning.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    repository::remove_empty_parents,
    resource::{ResourceId, ResourceType},
    source::SourceKind,
    workspace::normalize_url,
};

pub const METADATA_DIR: &str = ".metadata";

const METADATA_SUFFIX: &str = "-metadata.json";

#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("No provenance record for {0}")]
    NotFound(ResourceId),
    #[error("Malformed provenance record {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("IO error on provenance record {}: {source}", path.display())]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub source_type: SourceKind,
    pub source_url: String,
    /// Configured alias of the source, distinct from its URL.
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r#ref: String,
    pub first_installed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ProvenanceRecord {
    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.resource_type, self.name.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ProvenanceStore {
    root: PathBuf,
}

impl ProvenanceStore {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            root: repo_root.join(METADATA_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, resource_type: ResourceType, name: &str) -> PathBuf {
        let mut path = self.root.join(resource_type.dir_name());
        let mut segments = name.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{}{}", segment, METADATA_SUFFIX));
            }
        }
        path
    }

    pub fn save(&self, record: &ProvenanceRecord) -> Result<(), ProvenanceError> {
        let path = self.path_for(record.resource_type, &record.name);
        let io = |source| ProvenanceError::IO {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let text = serde_json::to_string_pretty(record).map_err(|source| ProvenanceError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(io)?;
        std::fs::rename(&tmp, &path).map_err(io)?;
        debug!("Saved provenance for {}", record.id());
        Ok(())
    }

    pub fn load(
        &self,
        resource_type: ResourceType,
        name: &str,
    ) -> Result<ProvenanceRecord, ProvenanceError> {
        let path = self.path_for(resource_type, name);
        match std::fs::read_to_string(&path) {
            Ok(text) => parse(&path, &text),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Err(
                ProvenanceError::NotFound(ResourceId::new(resource_type, name)),
            ),
            Err(source) => Err(ProvenanceError::IO { path, source }),
        }
    }

    /// Deletes the record. Returns `false` when there was none.
    pub fn remove(&self, resource_type: ResourceType, name: &str) -> Result<bool, ProvenanceError> {
        let path = self.path_for(resource_type, name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                remove_empty_parents(&path, &self.root.join(resource_type.dir_name()));
                Ok(true)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ProvenanceError::IO { path, source }),
        }
    }

    /// Every readable record. Malformed sidecars are skipped with a warning.
    pub fn list_all(&self) -> Result<Vec<ProvenanceRecord>, ProvenanceError> {
        let mut records = Vec::new();
        for resource_type in ResourceType::ALL {
            let dir = self.root.join(resource_type.dir_name());
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&dir).sort_by_file_name() {
                let entry = entry.map_err(|error| ProvenanceError::IO {
                    path: error.path().unwrap_or(dir.as_path()).to_path_buf(),
                    source: error.into(),
                })?;
                let path = entry.path();
                if !entry.file_type().is_file()
                    || !entry.file_name().to_string_lossy().ends_with(METADATA_SUFFIX)
                {
                    continue;
                }
                let record = std::fs::read_to_string(path)
                    .map_err(|source| ProvenanceError::IO {
                        path: path.to_path_buf(),
                        source,
                    })
                    .and_then(|text| parse(path, &text));
                match record {
                    Ok(record) => records.push(record),
                    Err(error) => warn!("Skipping provenance record: {}", error),
                }
            }
        }
        records.sort_by(|a, b| a.id().cmp(&b.id()));
        Ok(records)
    }

    /// Distinct source URLs of remote git records: the live set for pruning.
    pub fn live_git_urls(&self) -> Result<Vec<String>, ProvenanceError> {
        let mut urls = BTreeMap::new();
        for record in self.list_all()? {
            if record.source_type.is_remote_git() && !record.source_url.is_empty() {
                urls.entry(normalize_url(&record.source_url))
                    .or_insert(record.source_url);
            }
        }
        Ok(urls.into_values().collect())
    }
}

fn parse(path: &Path, text: &str) -> Result<ProvenanceRecord, ProvenanceError> {
    serde_json::from_str(text).map_err(|source| ProvenanceError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn record(
        resource_type: ResourceType,
        name: &str,
        source_type: SourceKind,
        source_url: &str,
    ) -> ProvenanceRecord {
        let now = Utc::now();
        ProvenanceRecord {
            name: name.to_owned(),
            resource_type,
            source_type,
            source_url: source_url.to_owned(),
            source_name: crate::source::derive_source_name(source_url),
            source_id: None,
            r#ref: String::new(),
            first_installed: now,
            last_updated: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::record;
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn sidecar_paths() {
        let store = ProvenanceStore::new(Path::new("/repo"));
        assert_eq!(
            store.path_for(ResourceType::Command, "api/deploy"),
            PathBuf::from("/repo/.metadata/commands/api/deploy-metadata.json")
        );
        assert_eq!(
            store.path_for(ResourceType::Command, "api-deploy"),
            PathBuf::from("/repo/.metadata/commands/api-deploy-metadata.json")
        );
        assert_eq!(
            store.path_for(ResourceType::Skill, "pdf"),
            PathBuf::from("/repo/.metadata/skills/pdf-metadata.json")
        );
    }

    #[test]
    fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProvenanceStore::new(dir.path());
        let saved = record(
            ResourceType::Agent,
            "reviewer",
            SourceKind::Github,
            "https://github.com/acme/agents",
        );
        store.save(&saved).unwrap();
        assert_eq!(store.load(ResourceType::Agent, "reviewer").unwrap(), saved);
        assert!(store.remove(ResourceType::Agent, "reviewer").unwrap());
        assert!(!store.remove(ResourceType::Agent, "reviewer").unwrap());
        assert!(matches!(
            store.load(ResourceType::Agent, "reviewer"),
            Err(ProvenanceError::NotFound(_))
        ));
    }

    #[test]
    fn reads_documented_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProvenanceStore::new(dir.path());
        let path = store.path_for(ResourceType::Skill, "pdf");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{
                "name": "pdf",
                "type": "skill",
                "source_type": "github",
                "source_url": "https://github.com/anthropics/skills",
                "source_name": "anthropics-skills",
                "ref": "main",
                "first_installed": "2026-01-25T09:00:00Z",
                "last_updated": "2026-01-26T09:00:00Z"
            }"#,
        )
        .unwrap();
        let loaded = store.load(ResourceType::Skill, "pdf").unwrap();
        assert_eq!(loaded.r#ref, "main");
        assert_eq!(loaded.source_id, None);
        assert_eq!(loaded.source_name, "anthropics-skills");
    }

    #[test]
    fn list_skips_malformed_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProvenanceStore::new(dir.path());
        store
            .save(&record(
                ResourceType::Command,
                "api/deploy",
                SourceKind::Local,
                "/src",
            ))
            .unwrap();
        let broken = store.path_for(ResourceType::Command, "broken");
        std::fs::write(&broken, "{not json").unwrap();

        let records = store.list_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "api/deploy");
    }

    #[test]
    fn nested_and_dashed_names_keep_separate_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProvenanceStore::new(dir.path());
        let nested = record(
            ResourceType::Command,
            "api/deploy",
            SourceKind::Github,
            "https://github.com/acme/tools",
        );
        let dashed = record(ResourceType::Command, "api-deploy", SourceKind::Local, "/src");
        store.save(&nested).unwrap();
        store.save(&dashed).unwrap();

        assert_eq!(store.load(ResourceType::Command, "api/deploy").unwrap(), nested);
        assert_eq!(store.load(ResourceType::Command, "api-deploy").unwrap(), dashed);
        let names: Vec<_> = store.list_all().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["api-deploy", "api/deploy"]);
        assert_eq!(
            store.live_git_urls().unwrap(),
            vec!["https://github.com/acme/tools".to_string()]
        );

        assert!(store.remove(ResourceType::Command, "api/deploy").unwrap());
        assert!(!dir.path().join(".metadata/commands/api").exists());
        assert_eq!(store.list_all().unwrap(), vec![dashed]);
    }

    #[test]
    fn live_urls_are_remote_and_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProvenanceStore::new(dir.path());
        let url = "https://github.com/acme/tools";
        for (resource_type, name, kind, source) in [
            (ResourceType::Command, "a", SourceKind::Github, url),
            (ResourceType::Command, "b", SourceKind::Github, "https://github.com/acme/tools.git"),
            (ResourceType::Agent, "c", SourceKind::GitUrl, "https://example.com/x.git"),
            (ResourceType::Skill, "d", SourceKind::Local, "/local/skills"),
            (ResourceType::Skill, "e", SourceKind::File, "file:///tmp/e"),
        ] {
            store.save(&record(resource_type, name, kind, source)).unwrap();
        }
        let live = store.live_git_urls().unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.iter().any(|u| normalize_url(u) == normalize_url(url)));
        assert!(live.contains(&"https://example.com/x.git".to_string()));
    }
}
