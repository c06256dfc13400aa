use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    git::{Git, GitError},
    provenance::{ProvenanceError, ProvenanceStore, METADATA_DIR},
    resource::{ResourceId, ResourceType},
    workspace::WORKSPACE_DIR,
};

const GITIGNORE_FILE_NAME: &str = ".gitignore";

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("{0} is not in the repository")]
    NotFound(ResourceId),
    #[error("IO error on {}: {source}", path.display())]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
}

/// The versioned directory holding resources, their provenance records and
/// the workspace cache.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    git: Git,
    provenance: ProvenanceStore,
}

impl Repository {
    pub fn new(root: PathBuf, git: Git) -> Self {
        let provenance = ProvenanceStore::new(&root);
        Self {
            root,
            git,
            provenance,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn provenance(&self) -> &ProvenanceStore {
        &self.provenance
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    /// Creates the type directories, initializes git and ignores the workspace cache.
    /// Safe to run on an existing repository.
    pub fn init(&self) -> Result<(), RepositoryError> {
        for dir in ResourceType::ALL
            .iter()
            .map(|t| t.dir_name())
            .chain([METADATA_DIR])
        {
            let path = self.root.join(dir);
            std::fs::create_dir_all(&path).map_err(|source| RepositoryError::IO { path, source })?;
        }

        if !self.is_git_repo() {
            info!("Initializing git repository in {}", self.root.display());
            self.git.init(&self.root)?;
        }

        let gitignore = self.root.join(GITIGNORE_FILE_NAME);
        let io = |source| RepositoryError::IO {
            path: gitignore.clone(),
            source,
        };
        let entry = format!("{WORKSPACE_DIR}/");
        let mut content = match std::fs::read_to_string(&gitignore) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(error) => return Err(io(error)),
        };
        if !content.lines().any(|line| line.trim() == entry) {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&entry);
            content.push('\n');
            std::fs::write(&gitignore, content).map_err(io)?;
        }
        Ok(())
    }

    pub fn is_git_repo(&self) -> bool {
        self.root.join(".git").exists()
    }

    pub fn resource_path(&self, resource_type: ResourceType, name: &str) -> PathBuf {
        self.root.join(resource_type.relative_path(name))
    }

    /// Whether anything, including a dangling symlink, occupies the resource's location.
    pub fn contains(&self, resource_type: ResourceType, name: &str) -> bool {
        self.resource_path(resource_type, name)
            .symlink_metadata()
            .is_ok()
    }

    /// Deletes the resource file, directory or link, then prunes namespace
    /// directories it leaves empty. Returns `false` when nothing was there.
    pub fn delete_resource(
        &self,
        resource_type: ResourceType,
        name: &str,
    ) -> Result<bool, RepositoryError> {
        let path = self.resource_path(resource_type, name);
        let metadata = match path.symlink_metadata() {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(RepositoryError::IO { path, source }),
        };
        let result = if metadata.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|source| RepositoryError::IO {
            path: path.clone(),
            source,
        })?;
        remove_empty_parents(&path, &self.root.join(resource_type.dir_name()));
        Ok(true)
    }

    /// Removes a resource and its provenance record, then commits.
    pub fn remove(&self, resource_type: ResourceType, name: &str) -> Result<(), RepositoryError> {
        let deleted = self.delete_resource(resource_type, name)?;
        let forgotten = self.provenance.remove(resource_type, name)?;
        if !deleted && !forgotten {
            return Err(RepositoryError::NotFound(ResourceId::new(
                resource_type,
                name,
            )));
        }
        info!("Removed {} {}", resource_type, name);
        if let Err(error) = self.commit(&format!("remove {resource_type}: {name}")) {
            warn!("Failed to commit removal of {}: {}", name, error);
        }
        Ok(())
    }

    /// Resources present on disk, optionally restricted to one type.
    pub fn list(
        &self,
        resource_type: Option<ResourceType>,
    ) -> Result<Vec<ResourceId>, RepositoryError> {
        let types = match resource_type {
            Some(resource_type) => vec![resource_type],
            None => ResourceType::ALL.to_vec(),
        };
        let mut ids = Vec::new();
        for resource_type in types {
            let dir = self.root.join(resource_type.dir_name());
            if !dir.is_dir() {
                continue;
            }
            let max_depth = match resource_type {
                ResourceType::Command => usize::MAX,
                _ => 1,
            };
            let walker = WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(max_depth)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| !entry.file_name().to_string_lossy().starts_with('.'));
            for entry in walker {
                let entry = entry.map_err(|error| RepositoryError::IO {
                    path: dir.clone(),
                    source: error.into(),
                })?;
                let is_dir = entry.file_type().is_dir();
                let wanted = match resource_type {
                    ResourceType::Skill => is_dir || entry.path_is_symlink(),
                    _ => !is_dir,
                };
                if !wanted {
                    continue;
                }
                let relative = entry.path().strip_prefix(&dir).unwrap_or(entry.path());
                if let Some(name) = resource_type.name_from_relative(relative) {
                    ids.push(ResourceId::new(resource_type, name));
                }
            }
        }
        Ok(ids)
    }

    /// Stages everything and commits. Returns `false` when there was nothing
    /// to commit or the repository is not under git.
    pub fn commit(&self, message: &str) -> Result<bool, RepositoryError> {
        if !self.is_git_repo() {
            debug!("{} is not a git repository, skipping commit", self.root.display());
            return Ok(false);
        }
        self.git.add_all(&self.root)?;
        if self.git.status_porcelain(&self.root)?.trim().is_empty() {
            debug!("Nothing to commit");
            return Ok(false);
        }
        self.git.commit(&self.root, message)?;
        info!("Committed: {}", message);
        Ok(true)
    }
}

/// Removes empty directories from `path`'s parent up to, not including, `stop`.
pub(crate) fn remove_empty_parents(path: &Path, stop: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        // Fails on non empty directories, which ends the walk.
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        git::testing::{configure_identity, git_available},
        provenance::testing::record,
        source::SourceKind,
    };
    use pretty_assertions::assert_eq;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn init_is_idempotent() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::new(dir.path().to_path_buf(), Git::default());
        repo.init().unwrap();
        repo.init().unwrap();

        for name in ["commands", "skills", "agents", "packages", ".metadata", ".git"] {
            assert!(dir.path().join(name).is_dir(), "{name}");
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".gitignore")).unwrap(),
            ".workspace/\n"
        );
    }

    #[test]
    fn list_resources() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::new(dir.path().to_path_buf(), Git::default());
        write(&repo.resource_path(ResourceType::Command, "api/deploy"), "");
        write(&repo.resource_path(ResourceType::Command, "db/deploy"), "");
        write(&repo.resource_path(ResourceType::Skill, "pdf").join("SKILL.md"), "");
        write(&repo.resource_path(ResourceType::Agent, "reviewer"), "");

        assert_eq!(
            repo.list(Some(ResourceType::Command)).unwrap(),
            vec![
                ResourceId::new(ResourceType::Command, "api/deploy"),
                ResourceId::new(ResourceType::Command, "db/deploy"),
            ]
        );
        assert_eq!(repo.list(None).unwrap().len(), 4);
    }

    #[test]
    fn remove_resource_and_record() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::new(dir.path().to_path_buf(), Git::default());
        repo.init().unwrap();
        configure_identity(dir.path());

        let path = repo.resource_path(ResourceType::Command, "api/deploy");
        write(&path, "---\n---\n");
        repo.provenance()
            .save(&record(
                ResourceType::Command,
                "api/deploy",
                SourceKind::Local,
                "/src",
            ))
            .unwrap();
        assert!(repo.commit("add").unwrap());

        repo.remove(ResourceType::Command, "api/deploy").unwrap();
        assert!(!path.exists());
        assert!(!dir.path().join("commands/api").exists());
        assert!(dir.path().join("commands").is_dir());
        assert!(repo
            .provenance()
            .load(ResourceType::Command, "api/deploy")
            .is_err());
        assert!(repo.git().status_porcelain(dir.path()).unwrap().is_empty());

        assert!(matches!(
            repo.remove(ResourceType::Command, "api/deploy"),
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[test]
    fn commit_outside_git_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::new(dir.path().to_path_buf(), Git::default());
        assert!(!repo.commit("nothing").unwrap());
    }
}
