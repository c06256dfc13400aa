use std::{error::Error, path::PathBuf, time::Duration};

use home::home_dir;

use crate::{
    config::AirepoConfig,
    git::Git,
    import::ImportMode,
    manifest::MANIFEST_FILE_NAME,
    repository::Repository,
    workspace::{CorruptionPolicy, WorkspaceCache},
    Airepo,
};

#[derive(Default)]
pub struct AirepoBuilder {
    repo_dir: Option<PathBuf>,
    manifest_file_name: Option<PathBuf>,
    import_mode: Option<ImportMode>,
    corruption_policy: Option<CorruptionPolicy>,
    git_program: Option<String>,
    lock_timeout: Option<Duration>,
}

impl AirepoBuilder {
    /// Location of the resource repository.
    ///
    /// Defaults to `$AIREPO_REPO_DIR`, then `$HOME/.local/share/airepo/repo`.
    pub fn repo_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.repo_dir = Some(path.into());
        self
    }

    /// Name of the sources manifest, relative to the repository.
    ///
    /// Defaults to `airepo.toml`.
    pub fn manifest_file_name(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_file_name = Some(path.into());
        self
    }

    /// How `add`, `sync` and `update` place resources in the repository.
    ///
    /// Defaults to `$AIREPO_IMPORT_MODE`, then copying.
    pub fn import_mode(mut self, mode: ImportMode) -> Self {
        self.import_mode = Some(mode);
        self
    }

    /// What to do with a cache entry that is no longer a valid checkout.
    pub fn corruption_policy(mut self, policy: CorruptionPolicy) -> Self {
        self.corruption_policy = Some(policy);
        self
    }

    /// The git executable. Defaults to `git` on the `PATH`.
    pub fn git_program(mut self, program: impl Into<String>) -> Self {
        self.git_program = Some(program.into());
        self
    }

    /// How long to wait for another process holding a cache lock.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn try_build(self) -> Result<Airepo, Box<dyn Error>> {
        let Self {
            repo_dir,
            manifest_file_name,
            import_mode,
            corruption_policy,
            git_program,
            lock_timeout,
        } = self;
        let config = AirepoConfig::load()?;

        let repo_dir = match repo_dir.or(config.repo_dir) {
            Some(repo_dir) => repo_dir,
            None => default_repo_dir()?,
        };

        let manifest_file_name =
            manifest_file_name.unwrap_or_else(|| PathBuf::from(MANIFEST_FILE_NAME));

        let git = git_program
            .or(config.git_program)
            .map(Git::new)
            .unwrap_or_default();

        let repository = Repository::new(repo_dir, git.clone());

        let mut cache = WorkspaceCache::new(repository.workspace_dir(), git)?
            .with_corruption_policy(
                corruption_policy
                    .or(config.cache_corruption)
                    .unwrap_or_default(),
            );
        if let Some(timeout) = lock_timeout {
            cache = cache.with_lock_timeout(timeout);
        }

        Ok(Airepo {
            repository,
            cache,
            manifest_file_name,
            import_mode: import_mode.or(config.import_mode).unwrap_or_default(),
        })
    }
}

fn default_repo_dir() -> Result<PathBuf, Box<dyn Error>> {
    let mut repo_dir =
        home_dir().ok_or("Could not find home dir. Please define $HOME env variable.")?;
    repo_dir.push(".local/share/airepo/repo");
    Ok(repo_dir)
}
