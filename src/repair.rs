//! Reconciles provenance records, repository files and the links an
//! [`Installer`] maintains in a consumer tool directory.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    import::{absolute, symlink},
    provenance::ProvenanceError,
    repository::{remove_empty_parents, Repository, RepositoryError},
    resource::{ResourceId, ResourceType},
};

#[derive(Error, Debug)]
pub enum RepairError {
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("IO error on {}: {source}", path.display())]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Installs repository resources into a consumer tool.
pub trait Installer {
    fn is_installed(&self, id: &ResourceId) -> bool;

    fn install(&self, id: &ResourceId) -> std::io::Result<()>;

    fn uninstall(&self, id: &ResourceId) -> std::io::Result<()>;

    /// Directories the installer owns, scanned for broken links and strays.
    fn managed_dirs(&self) -> Vec<(ResourceType, PathBuf)>;
}

/// Links `<target>/commands/<name>.md`, `<target>/skills/<name>` and
/// `<target>/agents/<name>.md` to the repository copy.
#[derive(Debug, Clone)]
pub struct SymlinkInstaller {
    repository_root: PathBuf,
    target: PathBuf,
}

impl SymlinkInstaller {
    pub fn new(repository_root: PathBuf, target: PathBuf) -> Self {
        Self {
            repository_root,
            target,
        }
    }

    pub fn link_path(&self, id: &ResourceId) -> PathBuf {
        self.target.join(id.resource_type.relative_path(&id.name))
    }

    fn resource_path(&self, id: &ResourceId) -> PathBuf {
        absolute_keeping_name(
            &self
                .repository_root
                .join(id.resource_type.relative_path(&id.name)),
        )
    }
}

impl Installer for SymlinkInstaller {
    fn is_installed(&self, id: &ResourceId) -> bool {
        let link = self.link_path(id);
        let is_link = link
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        is_link
            && match (
                std::fs::canonicalize(&link),
                std::fs::canonicalize(self.resource_path(id)),
            ) {
                (Ok(installed), Ok(resource)) => installed == resource,
                _ => false,
            }
    }

    fn install(&self, id: &ResourceId) -> std::io::Result<()> {
        if id.resource_type == ResourceType::Package {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "packages are not installed as links",
            ));
        }
        let link = self.link_path(id);
        if let Ok(metadata) = link.symlink_metadata() {
            if !metadata.file_type().is_symlink() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a link", link.display()),
                ));
            }
            std::fs::remove_file(&link)?;
        }
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent)?;
        }
        symlink(&self.resource_path(id), &link)
    }

    fn uninstall(&self, id: &ResourceId) -> std::io::Result<()> {
        let link = self.link_path(id);
        match link.symlink_metadata() {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                std::fs::remove_file(&link)?;
                remove_empty_parents(&link, &self.target.join(id.resource_type.dir_name()));
                Ok(())
            }
            Ok(_) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a link", link.display()),
            )),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn managed_dirs(&self) -> Vec<(ResourceType, PathBuf)> {
        [ResourceType::Command, ResourceType::Skill, ResourceType::Agent]
            .into_iter()
            .map(|t| (t, self.target.join(t.dir_name())))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    OrphanedMetadata,
    MissingInstall,
    BrokenLink,
    UnmanagedFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// A provenance record whose resource is gone.
    OrphanedMetadata { id: ResourceId, record: PathBuf },
    /// An expected resource the installer does not have.
    MissingInstall { id: ResourceId },
    /// An installed link whose target does not resolve.
    BrokenLink {
        id: ResourceId,
        link: PathBuf,
        target: PathBuf,
    },
    /// Anything else inside a managed directory.
    UnmanagedFile {
        resource_type: ResourceType,
        path: PathBuf,
    },
}

impl Issue {
    pub fn kind(&self) -> IssueKind {
        match self {
            Issue::OrphanedMetadata { .. } => IssueKind::OrphanedMetadata,
            Issue::MissingInstall { .. } => IssueKind::MissingInstall,
            Issue::BrokenLink { .. } => IssueKind::BrokenLink,
            Issue::UnmanagedFile { .. } => IssueKind::UnmanagedFile,
        }
    }
}

impl Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Issue::OrphanedMetadata { id, .. } => {
                write!(f, "orphaned metadata: {id} has a record but no resource")
            }
            Issue::MissingInstall { id } => write!(f, "missing install: {id}"),
            Issue::BrokenLink { link, target, .. } => write!(
                f,
                "broken link: {} points to missing {}",
                link.display(),
                target.display()
            ),
            Issue::UnmanagedFile { path, .. } => {
                write!(f, "unmanaged file: {}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FixOptions {
    pub dry_run: bool,
    pub force: bool,
    /// Allows removal of unmanaged files, together with `force`.
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixStatus {
    Fixed,
    WouldFix,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixResult {
    pub issue: Issue,
    pub status: FixStatus,
    pub message: String,
}

pub struct RepairEngine<'a> {
    repository: &'a Repository,
    installer: &'a dyn Installer,
}

impl<'a> RepairEngine<'a> {
    pub fn new(repository: &'a Repository, installer: &'a dyn Installer) -> Self {
        Self {
            repository,
            installer,
        }
    }

    /// Classifies drift. `expected` lists the resources the consumer should have installed.
    pub fn scan(&self, expected: &[ResourceId]) -> Result<Vec<Issue>, RepairError> {
        let provenance = self.repository.provenance();
        let mut issues: Vec<Issue> = provenance
            .list_all()?
            .into_iter()
            .filter(|record| !self.repository.contains(record.resource_type, &record.name))
            .map(|record| Issue::OrphanedMetadata {
                record: provenance.path_for(record.resource_type, &record.name),
                id: record.id(),
            })
            .collect();

        for (resource_type, dir) in self.installer.managed_dirs() {
            self.scan_managed_dir(resource_type, &dir, &mut issues)?;
        }

        for id in expected {
            let broken = issues
                .iter()
                .any(|issue| matches!(issue, Issue::BrokenLink { id: broken, .. } if broken == id));
            if !broken && !self.installer.is_installed(id) {
                issues.push(Issue::MissingInstall { id: id.clone() });
            }
        }
        debug!("Scan found {} issue(s)", issues.len());
        Ok(issues)
    }

    fn scan_managed_dir(
        &self,
        resource_type: ResourceType,
        dir: &Path,
        issues: &mut Vec<Issue>,
    ) -> Result<(), RepairError> {
        if !dir.is_dir() {
            return Ok(());
        }
        let repository_root = absolute(self.repository.root());
        let max_depth = match resource_type {
            ResourceType::Command => usize::MAX,
            _ => 1,
        };
        let mut walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|error| RepairError::IO {
                path: dir.to_path_buf(),
                source: error.into(),
            })?;
            let path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            if entry.path_is_symlink() {
                let target = std::fs::read_link(path).map_err(|source| RepairError::IO {
                    path: path.to_path_buf(),
                    source,
                })?;
                let resolved = path.parent().unwrap_or(dir).join(&target);
                if !resolved.exists() {
                    let relative = path.strip_prefix(dir).unwrap_or(path);
                    match resource_type.name_from_relative(relative) {
                        Some(name) => issues.push(Issue::BrokenLink {
                            id: ResourceId::new(resource_type, name),
                            link: path.to_path_buf(),
                            target,
                        }),
                        None => issues.push(Issue::UnmanagedFile {
                            resource_type,
                            path: path.to_path_buf(),
                        }),
                    }
                } else if !absolute_keeping_name(&resolved).starts_with(&repository_root) {
                    issues.push(Issue::UnmanagedFile {
                        resource_type,
                        path: path.to_path_buf(),
                    });
                }
                continue;
            }

            // Command namespaces are plain directories.
            if resource_type == ResourceType::Command && entry.file_type().is_dir() {
                continue;
            }
            issues.push(Issue::UnmanagedFile {
                resource_type,
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Applies fixes. Every issue gets exactly one result; failures do not stop the run.
    pub fn fix(&self, issues: &[Issue], options: &FixOptions) -> Vec<FixResult> {
        let results: Vec<FixResult> = issues
            .iter()
            .map(|issue| {
                let (status, message) = self.fix_one(issue, options);
                match status {
                    FixStatus::Failed => warn!("{}", message),
                    _ => info!("{}", message),
                }
                FixResult {
                    issue: issue.clone(),
                    status,
                    message,
                }
            })
            .collect();

        let removed_records = results
            .iter()
            .filter(|r| r.status == FixStatus::Fixed && r.issue.kind() == IssueKind::OrphanedMetadata)
            .count();
        if removed_records > 0 {
            let message = format!("repair: remove {removed_records} orphaned metadata record(s)");
            if let Err(error) = self.repository.commit(&message) {
                warn!("Repair was not committed: {}", error);
            }
        }
        results
    }

    fn fix_one(&self, issue: &Issue, options: &FixOptions) -> (FixStatus, String) {
        match issue {
            Issue::OrphanedMetadata { id, .. } => {
                if options.dry_run {
                    return (FixStatus::WouldFix, format!("Would remove metadata for {id}"));
                }
                if !options.force {
                    return (
                        FixStatus::Skipped,
                        format!("Metadata for {id} kept, use force to remove it"),
                    );
                }
                match self
                    .repository
                    .provenance()
                    .remove(id.resource_type, &id.name)
                {
                    Ok(_) => (FixStatus::Fixed, format!("Removed metadata for {id}")),
                    Err(error) => (
                        FixStatus::Failed,
                        format!("Failed to remove metadata for {id}: {error}"),
                    ),
                }
            }
            Issue::MissingInstall { id } => {
                if options.dry_run {
                    return (FixStatus::WouldFix, format!("Would install {id}"));
                }
                if !self.repository.contains(id.resource_type, &id.name) {
                    return (
                        FixStatus::Failed,
                        format!("Cannot install {id}: it is not in the repository"),
                    );
                }
                match self.installer.install(id) {
                    Ok(()) => (FixStatus::Fixed, format!("Installed {id}")),
                    Err(error) => (
                        FixStatus::Failed,
                        format!("Failed to install {id}: {error}"),
                    ),
                }
            }
            Issue::BrokenLink { id, link, .. } => {
                if options.dry_run {
                    return (
                        FixStatus::WouldFix,
                        format!("Would recreate link {}", link.display()),
                    );
                }
                if !options.force {
                    return (
                        FixStatus::Skipped,
                        format!("Broken link {} kept, use force to recreate it", link.display()),
                    );
                }
                if !self.repository.contains(id.resource_type, &id.name) {
                    return match self.installer.uninstall(id) {
                        Ok(()) => (
                            FixStatus::Fixed,
                            format!("Removed broken link {}, {id} is not in the repository", link.display()),
                        ),
                        Err(error) => (
                            FixStatus::Failed,
                            format!("Failed to remove broken link {}: {error}", link.display()),
                        ),
                    };
                }
                match self.installer.install(id) {
                    Ok(()) => (FixStatus::Fixed, format!("Recreated link {}", link.display())),
                    Err(error) => (
                        FixStatus::Failed,
                        format!("Failed to recreate link {}: {error}", link.display()),
                    ),
                }
            }
            Issue::UnmanagedFile {
                resource_type,
                path,
            } => {
                if !options.reset {
                    return (
                        FixStatus::Skipped,
                        format!("{} is not managed, reset removes it", path.display()),
                    );
                }
                if options.dry_run {
                    return (FixStatus::WouldFix, format!("Would remove {}", path.display()));
                }
                if !options.force {
                    return (
                        FixStatus::Skipped,
                        format!("{} kept, use force with reset to remove it", path.display()),
                    );
                }
                match remove_path(path) {
                    Ok(()) => {
                        if let Some(stop) = self
                            .installer
                            .managed_dirs()
                            .into_iter()
                            .find(|(t, _)| t == resource_type)
                            .map(|(_, dir)| dir)
                        {
                            remove_empty_parents(path, &stop);
                        }
                        (FixStatus::Fixed, format!("Removed {}", path.display()))
                    }
                    Err(error) => (
                        FixStatus::Failed,
                        format!("Failed to remove {}: {error}", path.display()),
                    ),
                }
            }
        }
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = path.symlink_metadata()?;
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Resolves the directories of `path` but not its last component, so a
/// repository resource that is itself a link still counts as in the repository.
fn absolute_keeping_name(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => absolute(parent).join(name),
        _ => absolute(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::{
        import::{
            testing::{fixture_source, repository},
            ImportOptions, Importer,
        },
        provenance::testing::record,
        source::SourceKind,
    };

    fn reviewer() -> ResourceId {
        ResourceId::new(ResourceType::Agent, "reviewer")
    }

    fn orphan() -> ResourceId {
        ResourceId::new(ResourceType::Command, "gone")
    }

    /// A repository holding the reviewer agent plus an orphaned record.
    fn setup() -> (tempfile::TempDir, tempfile::TempDir, Repository, SymlinkInstaller) {
        let source = fixture_source();
        let (dir, repository) = repository();
        Importer::new(&repository)
            .import(
                &[source.path().join("agents/reviewer.md")],
                &ImportOptions::default(),
            )
            .unwrap();
        repository
            .provenance()
            .save(&record(
                ResourceType::Command,
                "gone",
                SourceKind::Local,
                "/src",
            ))
            .unwrap();
        let installer =
            SymlinkInstaller::new(repository.root().to_path_buf(), dir.path().join("tool"));
        (source, dir, repository, installer)
    }

    #[test]
    fn orphaned_metadata() {
        let (_source, _dir, repository, installer) = setup();
        let engine = RepairEngine::new(&repository, &installer);
        let issues = engine.scan(&[]).unwrap();
        assert_eq!(
            issues,
            vec![Issue::OrphanedMetadata {
                id: orphan(),
                record: repository
                    .provenance()
                    .path_for(ResourceType::Command, "gone"),
            }]
        );

        let dry = engine.fix(
            &issues,
            &FixOptions {
                dry_run: true,
                force: true,
                ..Default::default()
            },
        );
        assert_eq!(dry[0].status, FixStatus::WouldFix);
        assert!(dry[0].message.starts_with("Would"));
        assert_eq!(repository.provenance().list_all().unwrap().len(), 2);

        let unforced = engine.fix(&issues, &FixOptions::default());
        assert_eq!(unforced[0].status, FixStatus::Skipped);
        assert_eq!(repository.provenance().list_all().unwrap().len(), 2);

        let fixed = engine.fix(
            &issues,
            &FixOptions {
                force: true,
                ..Default::default()
            },
        );
        assert_eq!(fixed[0].status, FixStatus::Fixed);
        let remaining: Vec<_> = repository
            .provenance()
            .list_all()
            .unwrap()
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(remaining, vec![reviewer()]);
        assert!(engine.scan(&[]).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn missing_install_and_broken_links() {
        let (_source, dir, repository, installer) = setup();
        repository
            .provenance()
            .remove(ResourceType::Command, "gone")
            .unwrap();
        let engine = RepairEngine::new(&repository, &installer);

        assert_eq!(
            engine.scan(&[reviewer()]).unwrap(),
            vec![Issue::MissingInstall { id: reviewer() }]
        );
        let results = engine.fix(
            &[Issue::MissingInstall { id: reviewer() }],
            &FixOptions::default(),
        );
        assert_eq!(results[0].status, FixStatus::Fixed);
        assert!(installer.is_installed(&reviewer()));
        assert!(engine.scan(&[reviewer()]).unwrap().is_empty());

        // Point the link somewhere that does not exist.
        let link = installer.link_path(&reviewer());
        std::fs::remove_file(&link).unwrap();
        symlink(&dir.path().join("nowhere.md"), &link).unwrap();
        let issues = engine.scan(&[reviewer()]).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind(), IssueKind::BrokenLink);

        let results = engine.fix(
            &issues,
            &FixOptions {
                force: true,
                ..Default::default()
            },
        );
        assert_eq!(results[0].status, FixStatus::Fixed);
        assert!(installer.is_installed(&reviewer()));

        // A broken link for a resource the repository does not have is removed.
        let stale = dir.path().join("tool/commands/ns/stale.md");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        symlink(&dir.path().join("nowhere.md"), &stale).unwrap();
        let issues = engine.scan(&[]).unwrap();
        assert_eq!(
            issues,
            vec![Issue::BrokenLink {
                id: ResourceId::new(ResourceType::Command, "ns/stale"),
                link: stale.clone(),
                target: dir.path().join("nowhere.md"),
            }]
        );
        engine.fix(
            &issues,
            &FixOptions {
                force: true,
                ..Default::default()
            },
        );
        assert!(stale.symlink_metadata().is_err());
        assert!(!dir.path().join("tool/commands/ns").exists());
    }

    #[cfg(unix)]
    #[test]
    fn unmanaged_files_need_reset() {
        let (_source, dir, repository, installer) = setup();
        repository
            .provenance()
            .remove(ResourceType::Command, "gone")
            .unwrap();
        let engine = RepairEngine::new(&repository, &installer);

        let stray = dir.path().join("tool/commands/team/stray.md");
        std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
        std::fs::write(&stray, "mine").unwrap();
        let outside = dir.path().join("outside.md");
        std::fs::write(&outside, "").unwrap();
        let foreign = dir.path().join("tool/agents/foreign.md");
        std::fs::create_dir_all(foreign.parent().unwrap()).unwrap();
        symlink(&outside, &foreign).unwrap();

        let issues = engine.scan(&[]).unwrap();
        assert_eq!(
            issues,
            vec![
                Issue::UnmanagedFile {
                    resource_type: ResourceType::Command,
                    path: stray.clone()
                },
                Issue::UnmanagedFile {
                    resource_type: ResourceType::Agent,
                    path: foreign.clone()
                },
            ]
        );

        let kept = engine.fix(
            &issues,
            &FixOptions {
                force: true,
                ..Default::default()
            },
        );
        assert!(kept.iter().all(|r| r.status == FixStatus::Skipped));
        assert!(stray.exists());

        let removed = engine.fix(
            &issues,
            &FixOptions {
                force: true,
                reset: true,
                ..Default::default()
            },
        );
        assert!(removed.iter().all(|r| r.status == FixStatus::Fixed));
        assert!(!stray.exists());
        assert!(!dir.path().join("tool/commands/team").exists());
        assert!(dir.path().join("tool/commands").is_dir());
        assert!(foreign.symlink_metadata().is_err());
        assert!(outside.exists());
    }

    #[cfg(unix)]
    #[test]
    fn installs_of_linked_resources_are_managed() {
        let source = fixture_source();
        let (dir, repository) = repository();
        Importer::new(&repository)
            .import(
                &[
                    source.path().join("skills/pdf"),
                    source.path().join("commands/db/deploy.md"),
                ],
                &ImportOptions {
                    mode: crate::import::ImportMode::Symlink,
                    ..Default::default()
                },
            )
            .unwrap();
        let installer =
            SymlinkInstaller::new(repository.root().to_path_buf(), dir.path().join("tool"));
        let ids = [
            ResourceId::new(ResourceType::Skill, "pdf"),
            ResourceId::new(ResourceType::Command, "db/deploy"),
        ];
        for id in &ids {
            installer.install(id).unwrap();
            assert!(installer.is_installed(id));
            assert!(std::fs::read_link(installer.link_path(id))
                .unwrap()
                .starts_with(absolute(repository.root())));
        }
        let stray = dir.path().join("tool/agents/stray.md");
        std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
        std::fs::write(&stray, "mine").unwrap();

        let engine = RepairEngine::new(&repository, &installer);
        let issues = engine.scan(&ids).unwrap();
        assert_eq!(
            issues,
            vec![Issue::UnmanagedFile {
                resource_type: ResourceType::Agent,
                path: stray.clone()
            }]
        );
        let results = engine.fix(
            &issues,
            &FixOptions {
                force: true,
                reset: true,
                ..Default::default()
            },
        );
        assert!(results.iter().all(|r| r.status == FixStatus::Fixed));
        assert!(!stray.exists());
        for id in &ids {
            assert!(installer.is_installed(id));
        }
    }
}
