use std::{
    error::Error,
    path::{Path, PathBuf},
};

use crate::{
    cli::command_handlers::{
        do_add, do_cache_list, do_cache_remove, do_import, do_init, do_list, do_prune,
        do_remove, do_repair, do_sync, do_update, SyncReport,
    },
    import::{ImportMode, ImportOptions, ImportOutcome},
    repair::{FixOptions, FixResult, Installer, Issue, RepairEngine},
    repository::Repository,
    resource::{ResourceId, ResourceType},
    update::{UpdateOptions, UpdateReport},
    workspace::WorkspaceCache,
};

mod builder;

pub use builder::AirepoBuilder;

pub struct Airepo {
    repository: Repository,
    cache: WorkspaceCache,
    manifest_file_name: PathBuf,
    import_mode: ImportMode,
}

/// How `prune` treats unreferenced cache entries.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PruneMode {
    /// Only report what would be removed.
    DryRun,
    /// Remove every cache entry no resource or manifest source refers to.
    Force,
}

impl Airepo {
    pub fn builder() -> AirepoBuilder {
        AirepoBuilder::default()
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn cache(&self) -> &WorkspaceCache {
        &self.cache
    }

    /// The configured import mode, used when a caller does not pick one.
    pub fn import_mode(&self) -> ImportMode {
        self.import_mode
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.repository.root().join(&self.manifest_file_name)
    }

    /// Creates the repository layout and puts it under git
    pub fn init(&self) -> Result<(), Box<dyn Error>> {
        do_init(&self.repository)
    }

    /// Imports resource files and directories into the repository
    pub fn import(
        &self,
        paths: &[PathBuf],
        options: &ImportOptions,
    ) -> Result<ImportOutcome, Box<dyn Error>> {
        do_import(&self.repository, paths, options)
    }

    /// Imports every resource of a source string such as `gh:owner/repo`,
    /// a git URL or a local directory. With `save`, the source is also
    /// recorded in the manifest so `sync` picks it up.
    pub fn add(
        &self,
        source: &str,
        options: ImportOptions,
        save: bool,
    ) -> Result<ImportOutcome, Box<dyn Error>> {
        let manifest_path = self.manifest_path();
        do_add(
            &self.repository,
            &self.cache,
            source,
            options,
            save.then_some(manifest_path.as_path()),
        )
    }

    /// Refreshes tracked resources from their recorded sources
    pub fn update(
        &self,
        selection: &[ResourceId],
        dry_run: bool,
    ) -> Result<UpdateReport, Box<dyn Error>> {
        let options = UpdateOptions {
            dry_run,
            mode: self.import_mode,
        };
        do_update(&self.repository, &self.cache, selection, &options)
    }

    /// Re-imports every source listed in the manifest
    pub fn sync(&self, dry_run: bool) -> Result<SyncReport, Box<dyn Error>> {
        let options = ImportOptions {
            dry_run,
            mode: self.import_mode,
            ..Default::default()
        };
        do_sync(&self.repository, &self.cache, &self.manifest_path(), options)
    }

    pub fn remove(&self, id: &ResourceId) -> Result<(), Box<dyn Error>> {
        do_remove(&self.repository, id)
    }

    pub fn list(
        &self,
        resource_type: Option<ResourceType>,
    ) -> Result<Vec<ResourceId>, Box<dyn Error>> {
        do_list(&self.repository, resource_type)
    }

    /// URLs of every cached source checkout
    pub fn cached_sources(&self) -> Result<Vec<String>, Box<dyn Error>> {
        do_cache_list(&self.cache)
    }

    /// Removes cached checkouts nothing refers to anymore
    pub fn prune(&self, mode: PruneMode) -> Result<Vec<String>, Box<dyn Error>> {
        do_prune(
            &self.repository,
            &self.cache,
            &self.manifest_path(),
            mode == PruneMode::DryRun,
            mode == PruneMode::Force,
        )
    }

    pub fn remove_cached(&self, url: &str) -> Result<bool, Box<dyn Error>> {
        do_cache_remove(&self.cache, url)
    }

    /// Lists inconsistencies between provenance, the repository and `installer`
    pub fn scan(
        &self,
        installer: &dyn Installer,
        expected: &[ResourceId],
    ) -> Result<Vec<Issue>, Box<dyn Error>> {
        Ok(RepairEngine::new(&self.repository, installer).scan(expected)?)
    }

    /// Scans and fixes what `options` allows
    pub fn repair(
        &self,
        installer: &dyn Installer,
        expected: &[ResourceId],
        options: &FixOptions,
    ) -> Result<(Vec<Issue>, Vec<FixResult>), Box<dyn Error>> {
        do_repair(&self.repository, installer, expected, options)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.repository.contains(id.resource_type, &id.name)
    }

    pub fn root(&self) -> &Path {
        self.repository.root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::{
        git::{
            testing::{commit_files, git_available, init_upstream},
            Git,
        },
        import::testing::{fixture_source, repository},
        manifest::{Manifest, ManifestSource},
        source::SourceKind,
    };

    fn airepo() -> (tempfile::TempDir, Airepo) {
        let (dir, repository) = repository();
        let cache = WorkspaceCache::new(repository.workspace_dir(), Git::default()).unwrap();
        let airepo = Airepo {
            repository,
            cache,
            manifest_file_name: PathBuf::from(crate::manifest::MANIFEST_FILE_NAME),
            import_mode: ImportMode::Copy,
        };
        (dir, airepo)
    }

    fn id(s: &str) -> ResourceId {
        s.parse().unwrap()
    }

    #[test]
    fn builder_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let airepo = Airepo::builder()
            .repo_dir(dir.path().join("repo"))
            .manifest_file_name("sources.toml")
            .import_mode(ImportMode::Symlink)
            .try_build()
            .unwrap();
        assert_eq!(airepo.root(), dir.path().join("repo"));
        assert_eq!(airepo.manifest_path(), dir.path().join("repo/sources.toml"));
        assert_eq!(airepo.import_mode(), ImportMode::Symlink);
        assert_eq!(airepo.cache().location(), dir.path().join("repo/.workspace"));
    }

    #[test]
    fn add_local_source_and_save_it() {
        let (_dir, airepo) = airepo();
        let source = fixture_source();

        let outcome = airepo
            .add(
                &source.path().to_string_lossy(),
                ImportOptions::default(),
                true,
            )
            .unwrap();
        assert_eq!(outcome.added.len(), 6);
        assert_eq!(outcome.counts.total(), 6);

        let commands = airepo.list(Some(ResourceType::Command)).unwrap();
        assert_eq!(
            commands,
            vec![id("command/api/deploy"), id("command/api/rollback"), id("command/db/deploy")]
        );

        let record = airepo
            .repository()
            .provenance()
            .load(ResourceType::Skill, "pdf")
            .unwrap();
        assert_eq!(record.source_type, SourceKind::Local);

        let manifest = Manifest::from_file(&airepo.manifest_path()).unwrap();
        assert_eq!(manifest.sources.len(), 1);
        assert_eq!(manifest.sources[0].url, None);
        assert!(manifest.sources[0].path.is_some());

        // A second add of the same source conflicts on every resource.
        let again = airepo
            .add(&source.path().to_string_lossy(), ImportOptions::default(), false)
            .unwrap();
        assert_eq!(again.added.len(), 0);
        assert_eq!(again.failed.len(), 6);
    }

    #[test]
    fn add_missing_local_source() {
        let (dir, airepo) = airepo();
        let missing = dir.path().join("nowhere");
        assert!(airepo
            .add(&missing.to_string_lossy(), ImportOptions::default(), false)
            .is_err());
    }

    #[test]
    fn sync_reimports_manifest_sources() {
        let (_dir, airepo) = airepo();
        let source = fixture_source();
        let manifest = Manifest {
            sources: vec![
                ManifestSource {
                    name: "fixtures".to_string(),
                    url: None,
                    path: Some(source.path().to_path_buf()),
                    reference: None,
                },
                ManifestSource {
                    name: "gone".to_string(),
                    url: None,
                    path: Some(source.path().join("does-not-exist")),
                    reference: None,
                },
            ],
        };
        manifest.save(&airepo.manifest_path()).unwrap();

        let first = airepo.sync(false).unwrap();
        assert_eq!(first.outcome.added.len(), 6);
        assert_eq!(first.failed_sources.len(), 1);
        assert_eq!(first.failed_sources[0].0, "gone");

        let record = airepo
            .repository()
            .provenance()
            .load(ResourceType::Agent, "reviewer")
            .unwrap();
        assert_eq!(record.source_name, "fixtures");

        let second = airepo.sync(false).unwrap();
        assert_eq!(second.outcome.added.len(), 0);
        assert_eq!(second.outcome.updated.len(), 6);
    }

    #[test]
    fn sync_without_manifest_fails() {
        let (_dir, airepo) = airepo();
        assert!(airepo.sync(false).is_err());
    }

    #[test]
    fn remove_resource() {
        let (_dir, airepo) = airepo();
        let source = fixture_source();
        airepo
            .add(&source.path().to_string_lossy(), ImportOptions::default(), false)
            .unwrap();

        airepo.remove(&id("command/api/deploy")).unwrap();
        assert!(!airepo.contains(&id("command/api/deploy")));
        assert!(airepo.contains(&id("command/api/rollback")));
        assert!(airepo.remove(&id("command/api/deploy")).is_err());
    }

    #[test]
    fn add_remote_source_then_prune() {
        if !git_available() {
            return;
        }
        let (dir, airepo) = airepo();
        let upstream = dir.path().join("upstream");
        init_upstream(
            &upstream,
            &[("commands/hello.md", "---\ndescription: Say hello\n---\nHello\n")],
        );
        let url = format!("file://{}", upstream.display());

        let outcome = airepo.add(&url, ImportOptions::default(), true).unwrap();
        assert_eq!(outcome.added, vec![id("command/hello")]);
        assert_eq!(airepo.cached_sources().unwrap(), vec![url.clone()]);

        // Referenced by provenance and the manifest, so nothing to prune.
        assert!(airepo.prune(PruneMode::DryRun).unwrap().is_empty());

        airepo.remove(&id("command/hello")).unwrap();
        std::fs::remove_file(airepo.manifest_path()).unwrap();
        assert_eq!(airepo.prune(PruneMode::DryRun).unwrap(), vec![url.clone()]);
        assert_eq!(airepo.cached_sources().unwrap(), vec![url.clone()]);
        assert_eq!(airepo.prune(PruneMode::Force).unwrap(), vec![url]);
        assert!(airepo.cached_sources().unwrap().is_empty());
    }

    #[test]
    fn add_refreshes_a_cached_source() {
        if !git_available() {
            return;
        }
        let (dir, airepo) = airepo();
        let upstream = dir.path().join("upstream");
        init_upstream(&upstream, &[("agents/one.md", "---\ndescription: One\n---\n")]);
        let url = format!("file://{}", upstream.display());
        airepo.add(&url, ImportOptions::default(), false).unwrap();

        commit_files(
            &upstream,
            &[("agents/two.md", "---\ndescription: Two\n---\n")],
            "add two",
        );
        let outcome = airepo
            .add(
                &url,
                ImportOptions {
                    skip_existing: true,
                    ..Default::default()
                },
                false,
            )
            .unwrap();
        assert_eq!(outcome.added, vec![id("agent/two")]);
        assert_eq!(outcome.skipped, vec![id("agent/one")]);
    }

    #[test]
    fn repair_removes_orphaned_records() {
        let (dir, airepo) = airepo();
        let provenance = airepo.repository().provenance();
        provenance
            .save(&crate::provenance::testing::record(
                ResourceType::Agent,
                "ghost",
                SourceKind::Github,
                "https://github.com/acme/agents",
            ))
            .unwrap();
        let installer = crate::repair::SymlinkInstaller::new(
            airepo.root().to_path_buf(),
            dir.path().join("tool"),
        );

        let issues = airepo.scan(&installer, &[]).unwrap();
        assert_eq!(issues.len(), 1);

        let preview = FixOptions {
            dry_run: true,
            ..Default::default()
        };
        let (_, results) = airepo.repair(&installer, &[], &preview).unwrap();
        assert_eq!(results[0].status, crate::repair::FixStatus::WouldFix);
        assert!(provenance.load(ResourceType::Agent, "ghost").is_ok());

        let force = FixOptions {
            force: true,
            ..Default::default()
        };
        let (_, results) = airepo.repair(&installer, &[], &force).unwrap();
        assert_eq!(results[0].status, crate::repair::FixStatus::Fixed);
        assert!(provenance.load(ResourceType::Agent, "ghost").is_err());
        assert!(airepo.scan(&installer, &[]).unwrap().is_empty());
    }

    #[test]
    fn remove_cached_entry() {
        let (_dir, airepo) = airepo();
        assert!(!airepo.remove_cached("https://github.com/acme/none").unwrap());
    }
}
