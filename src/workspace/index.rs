use std::{collections::BTreeMap, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const INDEX_FILE_NAME: &str = ".cache-metadata.json";

const VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error on cache index: {0}")]
    IO(#[from] std::io::Error),
    #[error("Malformed cache index: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported cache index version {0}")]
    UnsupportedVersion(String),
}

/// What the index remembers about one checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    pub url: String,
    pub last_accessed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub r#ref: String,
}

/// `key → URL` index stored next to the checkouts. The key is a one-way hash,
/// so this is the only way to list which URLs are materialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheIndex {
    pub version: String,
    #[serde(default)]
    pub caches: BTreeMap<String, IndexEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: VERSION.to_owned(),
            caches: BTreeMap::new(),
        }
    }
}

pub(super) enum Touch {
    Access,
    Update,
}

impl CacheIndex {
    /// A missing file is an empty index.
    pub fn load(path: &Path) -> Result<CacheIndex, IndexError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_str(&text),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(error.into()),
        }
    }

    pub fn from_str(text: &str) -> Result<CacheIndex, IndexError> {
        let index: CacheIndex = serde_json::from_str(text)?;
        if index.version != VERSION {
            return Err(IndexError::UnsupportedVersion(index.version));
        }
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let text = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub(super) fn touch(&mut self, key: &str, url: &str, reference: &str, touch: Touch) {
        let now = Utc::now();
        let entry = self
            .caches
            .entry(key.to_owned())
            .or_insert_with(|| IndexEntry {
                url: url.to_owned(),
                last_accessed: now,
                last_updated: now,
                r#ref: String::new(),
            });
        entry.last_accessed = now;
        entry.r#ref = reference.to_owned();
        if let Touch::Update = touch {
            entry.last_updated = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::load(&dir.path().join(INDEX_FILE_NAME)).unwrap();
        assert_eq!(index, CacheIndex::default());
    }

    #[test]
    fn parses_documented_format() {
        let text = r#"{
            "version": "1.0",
            "caches": {
                "a3f2e1": {
                    "url": "https://github.com/anthropics/skills",
                    "last_accessed": "2026-01-25T10:00:00Z",
                    "last_updated": "2026-01-25T09:00:00Z",
                    "ref": "main"
                }
            }
        }"#;
        let index = CacheIndex::from_str(text).unwrap();
        let entry = &index.caches["a3f2e1"];
        assert_eq!(entry.url, "https://github.com/anthropics/skills");
        assert_eq!(entry.r#ref, "main");
        assert_eq!(entry.last_updated.to_rfc3339(), "2026-01-25T09:00:00+00:00");
    }

    #[test]
    fn rejects_unknown_version() {
        let error = CacheIndex::from_str(r#"{"version": "9", "caches": {}}"#).unwrap_err();
        assert!(matches!(error, IndexError::UnsupportedVersion(v) if v == "9"));
    }

    #[test]
    fn save_then_touch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE_NAME);
        let mut index = CacheIndex::default();
        index.touch("k", "https://example.com/a", "main", Touch::Update);
        let first = index.caches["k"].clone();
        index.touch("k", "https://example.com/a", "dev", Touch::Access);
        assert_eq!(index.caches["k"].last_updated, first.last_updated);
        assert_eq!(index.caches["k"].r#ref, "dev");

        index.save(&path).unwrap();
        assert_eq!(CacheIndex::load(&path).unwrap(), index);
    }
}
