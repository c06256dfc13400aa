//! Bulk import of candidate resource paths into the repository.
//!
//! Every candidate is handled independently: a candidate that fails to load,
//! conflicts with an existing resource or cannot be written is recorded in
//! the outcome and the batch moves on. Only [`ImportError::Fatal`] aborts.

use std::{
    collections::HashSet,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::Utc;
use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    provenance::ProvenanceRecord,
    repository::{Repository, RepositoryError},
    resource::{validate_name, FsLoader, LoadError, ResourceId, ResourceLoader, ResourceType},
    source::{derive_source_name, resolve, SourceKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    #[default]
    Copy,
    /// Link to the absolute source path instead of copying it.
    Symlink,
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "copy" => Ok(ImportMode::Copy),
            "symlink" => Ok(ImportMode::Symlink),
            other => Err(format!("unknown import mode `{other}`")),
        }
    }
}

impl Display for ImportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ImportMode::Copy => f.write_str("copy"),
            ImportMode::Symlink => f.write_str("symlink"),
        }
    }
}

/// `force` wins over `skip_existing` when both are set.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub force: bool,
    pub skip_existing: bool,
    pub dry_run: bool,
    pub mode: ImportMode,
    /// Provenance stamped on every imported resource. Without a URL each
    /// resource records its own absolute path as a `file://` source.
    pub source_url: Option<String>,
    pub source_kind: Option<SourceKind>,
    pub source_alias: Option<String>,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Conflict,
    Validation,
    Resource,
    Fatal,
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("{id} already exists, use force to overwrite or skip existing to ignore it")]
    Conflict { id: ResourceId },
    #[error(transparent)]
    Validation(#[from] LoadError),
    #[error("Failed to write {id}: {source}")]
    Resource {
        id: ResourceId,
        source: RepositoryError,
    },
    #[error("Import aborted: {0}")]
    Fatal(String),
}

impl ImportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ImportError::Conflict { .. } => ErrorCategory::Conflict,
            ImportError::Validation(_) => ErrorCategory::Validation,
            ImportError::Resource { .. } => ErrorCategory::Resource,
            ImportError::Fatal(_) => ErrorCategory::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }
}

#[derive(Debug)]
pub struct ImportFailure {
    pub path: PathBuf,
    pub error: ImportError,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TypeCounts {
    pub commands: usize,
    pub skills: usize,
    pub agents: usize,
    pub packages: usize,
}

impl TypeCounts {
    pub fn add(&mut self, resource_type: ResourceType) {
        match resource_type {
            ResourceType::Command => self.commands += 1,
            ResourceType::Skill => self.skills += 1,
            ResourceType::Agent => self.agents += 1,
            ResourceType::Package => self.packages += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.commands + self.skills + self.agents + self.packages
    }
}

impl Display for TypeCounts {
    /// `2 command(s), 1 skill(s)`; zero counts are left out.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let parts: Vec<String> = [
            (self.commands, "command"),
            (self.skills, "skill"),
            (self.agents, "agent"),
            (self.packages, "package"),
        ]
        .into_iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, label)| format!("{count} {label}(s)"))
        .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Result of one `import` call. Never persisted.
#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub added: Vec<ResourceId>,
    pub updated: Vec<ResourceId>,
    pub skipped: Vec<ResourceId>,
    pub failed: Vec<ImportFailure>,
    /// Added plus updated, per type. Also filled in dry runs.
    pub counts: TypeCounts,
    pub committed: bool,
}

impl ImportOutcome {
    pub fn changed(&self) -> usize {
        self.added.len() + self.updated.len()
    }

    pub fn commit_message(&self) -> String {
        format!("import {} resource(s) ({})", self.changed(), self.counts)
    }

    pub fn merge(&mut self, other: ImportOutcome) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
        self.counts.commands += other.counts.commands;
        self.counts.skills += other.counts.skills;
        self.counts.agents += other.counts.agents;
        self.counts.packages += other.counts.packages;
        self.committed |= other.committed;
    }
}

pub struct Importer<'a, L = FsLoader> {
    repository: &'a Repository,
    loader: L,
}

impl<'a> Importer<'a, FsLoader> {
    pub fn new(repository: &'a Repository) -> Self {
        Self::with_loader(repository, FsLoader)
    }
}

impl<'a, L: ResourceLoader> Importer<'a, L> {
    pub fn with_loader(repository: &'a Repository, loader: L) -> Self {
        Self { repository, loader }
    }

    /// Imports `paths` and commits the result as a single commit.
    pub fn import(
        &self,
        paths: &[PathBuf],
        options: &ImportOptions,
    ) -> Result<ImportOutcome, ImportError> {
        let mut outcome = self.import_without_commit(paths, options)?;
        if !options.dry_run && outcome.changed() > 0 {
            let message = outcome.commit_message();
            match self.repository.commit(&message) {
                Ok(committed) => outcome.committed = committed,
                Err(error) => warn!("Imported resources were not committed: {}", error),
            }
        }
        Ok(outcome)
    }

    /// Same as [`Importer::import`] without the trailing commit, for callers
    /// that batch several imports into one commit.
    pub fn import_without_commit(
        &self,
        paths: &[PathBuf],
        options: &ImportOptions,
    ) -> Result<ImportOutcome, ImportError> {
        let mut outcome = ImportOutcome::default();
        let mut claimed = HashSet::new();
        for path in paths {
            match self.import_one(path, options, &mut claimed, &mut outcome) {
                Ok(()) => {}
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    warn!("Failed to import {}: {}", path.display(), error);
                    outcome.failed.push(ImportFailure {
                        path: path.clone(),
                        error,
                    });
                }
            }
        }
        info!(
            "{}{} added, {} updated, {} skipped, {} failed",
            if options.dry_run { "[dry run] " } else { "" },
            outcome.added.len(),
            outcome.updated.len(),
            outcome.skipped.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    fn import_one(
        &self,
        path: &Path,
        options: &ImportOptions,
        claimed: &mut HashSet<ResourceId>,
        outcome: &mut ImportOutcome,
    ) -> Result<(), ImportError> {
        let resource_type = self.loader.detect_type(path)?;
        let resource = self.loader.load(path, resource_type)?;
        let id = resource.id();

        if let Err(error) = validate_name(id.resource_type, &id.name) {
            return Err(ImportError::Fatal(format!(
                "loader produced an unusable name for {}: {}",
                path.display(),
                error
            )));
        }
        let destination = self.repository.resource_path(id.resource_type, &id.name);
        if !destination.starts_with(self.repository.root()) {
            return Err(ImportError::Fatal(format!(
                "{} resolves outside the repository",
                id
            )));
        }

        // Two candidates with one identity in a batch, or a candidate that
        // already is the repository copy, can never be overwritten.
        let same_file = is_same_file(&resource.path, &destination);
        let exists = self.repository.contains(id.resource_type, &id.name);
        if claimed.contains(&id) || same_file {
            return self.reject_existing(id, options, outcome);
        }

        let mut first_installed = None;
        if exists {
            if !options.force {
                return self.reject_existing(id, options, outcome);
            }
            first_installed = self
                .repository
                .provenance()
                .load(id.resource_type, &id.name)
                .ok()
                .map(|record| record.first_installed);
        }

        if !options.dry_run {
            let placed = if exists {
                debug!("Replacing {}", id);
                self.replace(&resource.path, &destination, options.mode)
            } else {
                self.materialize(&resource.path, &destination, options.mode)
            };
            placed
                .and_then(|()| {
                    let now = Utc::now();
                    let record = self.stamp(&id, &resource.path, options, now, first_installed);
                    self.repository
                        .provenance()
                        .save(&record)
                        .map_err(RepositoryError::from)
                })
                .map_err(|source| ImportError::Resource {
                    id: id.clone(),
                    source,
                })?;
        }

        outcome.counts.add(id.resource_type);
        claimed.insert(id.clone());
        if exists {
            info!("Updated {}", id);
            outcome.updated.push(id);
        } else {
            info!("Added {}", id);
            outcome.added.push(id);
        }
        Ok(())
    }

    fn reject_existing(
        &self,
        id: ResourceId,
        options: &ImportOptions,
        outcome: &mut ImportOutcome,
    ) -> Result<(), ImportError> {
        if options.skip_existing {
            debug!("Skipping existing {}", id);
            outcome.skipped.push(id);
            Ok(())
        } else {
            Err(ImportError::Conflict { id })
        }
    }

    fn stamp(
        &self,
        id: &ResourceId,
        source_path: &Path,
        options: &ImportOptions,
        now: chrono::DateTime<Utc>,
        first_installed: Option<chrono::DateTime<Utc>>,
    ) -> ProvenanceRecord {
        let (source_type, source_url) = match &options.source_url {
            Some(url) => {
                let kind = options.source_kind.unwrap_or_else(|| {
                    resolve(url)
                        .map(|descriptor| descriptor.kind())
                        .unwrap_or(SourceKind::File)
                });
                (kind, url.clone())
            }
            None => (
                options.source_kind.unwrap_or(SourceKind::File),
                format!("file://{}", absolute(source_path).display()),
            ),
        };
        let source_name = options
            .source_alias
            .clone()
            .unwrap_or_else(|| derive_source_name(&source_url));
        ProvenanceRecord {
            name: id.name.clone(),
            resource_type: id.resource_type,
            source_type,
            source_url,
            source_name,
            source_id: None,
            r#ref: options.reference.clone().unwrap_or_default(),
            first_installed: first_installed.unwrap_or(now),
            last_updated: now,
        }
    }

    /// Materializes next to `destination` and swaps it in only once complete,
    /// so a failed copy leaves the existing resource untouched.
    fn replace(
        &self,
        source: &Path,
        destination: &Path,
        mode: ImportMode,
    ) -> Result<(), RepositoryError> {
        let staging = staging_path(destination);
        remove_path(&staging)?;
        let swapped = self
            .materialize(source, &staging, mode)
            .and_then(|()| remove_path(destination))
            .and_then(|()| {
                std::fs::rename(&staging, destination).map_err(|source| RepositoryError::IO {
                    path: destination.to_path_buf(),
                    source,
                })
            });
        if swapped.is_err() {
            if let Err(error) = remove_path(&staging) {
                warn!("Could not clean up {}: {}", staging.display(), error);
            }
        }
        swapped
    }

    fn materialize(
        &self,
        source: &Path,
        destination: &Path,
        mode: ImportMode,
    ) -> Result<(), RepositoryError> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| RepositoryError::IO { path, source }
        };
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(io(parent))?;
        }
        match mode {
            ImportMode::Symlink => {
                let target = absolute(source);
                symlink(&target, destination).map_err(io(destination))
            }
            ImportMode::Copy if source.is_dir() => copy_tree(source, destination),
            ImportMode::Copy => std::fs::copy(source, destination)
                .map(|_| ())
                .map_err(io(destination)),
        }
    }
}

fn staging_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.airepo-tmp", name))
}

/// Removes a file, link or directory tree. Absence is not an error.
fn remove_path(path: &Path) -> Result<(), RepositoryError> {
    let result = match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(error) => Err(error),
    };
    result.map_err(|source| RepositoryError::IO {
        path: path.to_path_buf(),
        source,
    })
}

fn copy_tree(source: &Path, destination: &Path) -> Result<(), RepositoryError> {
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|error| RepositoryError::IO {
            path: source.to_path_buf(),
            source: error.into(),
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = destination.join(relative);
        let result = if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
        } else {
            std::fs::copy(entry.path(), &target).map(|_| ())
        };
        result.map_err(|source| RepositoryError::IO {
            path: target,
            source,
        })?;
    }
    Ok(())
}

pub(crate) fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

/// A link in the repository pointing at the source does not count: replacing
/// the link leaves the source intact.
fn is_same_file(source: &Path, destination: &Path) -> bool {
    let is_link = destination
        .symlink_metadata()
        .map(|metadata| metadata.file_type().is_symlink())
        .unwrap_or(true);
    if is_link {
        return false;
    }
    match (std::fs::canonicalize(source), std::fs::canonicalize(destination)) {
        (Ok(source), Ok(destination)) => source == destination,
        _ => false,
    }
}

#[cfg(unix)]
pub(crate) fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
pub(crate) fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use crate::{
        git::{
            testing::{configure_identity, git_available},
            Git,
        },
        repository::Repository,
    };

    /// A writable copy of `resources/fixtures`.
    pub fn fixture_source() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = project_root::get_project_root()
            .unwrap()
            .join("resources/fixtures");
        super::copy_tree(&fixtures, dir.path()).unwrap();
        dir
    }

    /// An initialized repository; under git when a git binary is available.
    pub fn repository() -> (TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repository = Repository::new(dir.path().join("repo"), Git::default());
        if git_available() {
            repository.init().unwrap();
            configure_identity(repository.root());
        } else {
            for name in ["commands", "skills", "agents", "packages", ".metadata"] {
                std::fs::create_dir_all(repository.root().join(name)).unwrap();
            }
        }
        (dir, repository)
    }

    pub fn paths(root: &Path, relative: &[&str]) -> Vec<PathBuf> {
        relative.iter().map(|r| root.join(r)).collect()
    }
}
