//! Refreshes tracked resources from the sources recorded in their provenance.
//!
//! Remote resources are grouped by normalized source URL so that a source
//! shared by N resources is fetched once, not N times.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    import::{ImportError, ImportFailure, ImportMode, ImportOptions, ImportOutcome, Importer},
    provenance::{ProvenanceError, ProvenanceRecord},
    repository::Repository,
    resource::{LoadError, ResourceId},
    source::SourceKind,
    workspace::{normalize_url, CacheError, WorkspaceCache},
};

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
    #[error(transparent)]
    Import(#[from] ImportError),
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Report what would be refreshed. Checkouts are still materialized so
    /// resources can be located, but nothing is fetched or written.
    pub dry_run: bool,
    pub mode: ImportMode,
}

#[derive(Debug, Default)]
pub struct UpdateReport {
    pub outcome: ImportOutcome,
    /// Remote sources refreshed, one entry per URL.
    pub sources: Vec<String>,
    /// Remote sources that could not be materialized at all.
    pub failed_sources: Vec<(String, CacheError)>,
}

pub struct Updater<'a> {
    repository: &'a Repository,
    cache: &'a WorkspaceCache,
}

struct SourceGroup {
    url: String,
    /// Records by ref; the empty ref is the provider default branch.
    by_ref: BTreeMap<String, Vec<ProvenanceRecord>>,
}

impl<'a> Updater<'a> {
    pub fn new(repository: &'a Repository, cache: &'a WorkspaceCache) -> Self {
        Self { repository, cache }
    }

    /// Re-imports `selection`, or every tracked resource when it is empty,
    /// from its recorded source with `force`. One commit covers the run.
    pub fn update(
        &self,
        selection: &[ResourceId],
        options: &UpdateOptions,
    ) -> Result<UpdateReport, UpdateError> {
        let mut report = UpdateReport::default();
        let mut remote: BTreeMap<String, SourceGroup> = BTreeMap::new();
        let mut local = Vec::new();

        for record in self.repository.provenance().list_all()? {
            let id = record.id();
            if !selection.is_empty() && !selection.contains(&id) {
                continue;
            }
            if !self.repository.contains(id.resource_type, &id.name) {
                debug!("{} has no resource on disk, leaving it to repair", id);
                continue;
            }
            if record.source_type.is_remote_git() {
                remote
                    .entry(normalize_url(&record.source_url))
                    .or_insert_with(|| SourceGroup {
                        url: record.source_url.clone(),
                        by_ref: BTreeMap::new(),
                    })
                    .by_ref
                    .entry(record.r#ref.clone())
                    .or_default()
                    .push(record);
            } else {
                local.push(record);
            }
        }

        for group in remote.into_values() {
            self.update_remote(group, options, &mut report)?;
        }
        for record in local {
            self.update_local(record, options, &mut report.outcome)?;
        }

        if !options.dry_run && report.outcome.changed() > 0 {
            let message = format!(
                "update {} resource(s) ({})",
                report.outcome.changed(),
                report.outcome.counts
            );
            match self.repository.commit(&message) {
                Ok(committed) => report.outcome.committed = committed,
                Err(error) => warn!("Updated resources were not committed: {}", error),
            }
        }
        Ok(report)
    }

    fn update_remote(
        &self,
        group: SourceGroup,
        options: &UpdateOptions,
        report: &mut UpdateReport,
    ) -> Result<(), UpdateError> {
        let SourceGroup { url, by_ref } = group;
        let count: usize = by_ref.values().map(Vec::len).sum();
        info!("Refreshing {} resource(s) from {}", count, url);

        let mut fetched = false;
        for (reference, records) in by_ref {
            let reference = Some(reference.as_str()).filter(|r| !r.is_empty());
            let checkout = match self.cache.get_or_clone(&url, reference) {
                Ok(checkout) => checkout,
                Err(error) => {
                    warn!("Cannot materialize {}: {}", url, error);
                    report.failed_sources.push((url.clone(), error));
                    return Ok(());
                }
            };
            // Later refs of the same URL are local checkouts of the fetched history.
            if !fetched && !options.dry_run {
                if let Err(error) = self.cache.update(&url, reference) {
                    warn!(
                        "Failed to refresh {}, using the existing checkout: {}",
                        url, error
                    );
                }
                fetched = true;
            }

            for record in records {
                let id = record.id();
                match locate(&checkout, &id) {
                    Some(path) => {
                        let outcome = self.reimport(&path, &record, options)?;
                        report.outcome.merge(outcome);
                    }
                    None => report.outcome.failed.push(ImportFailure {
                        path: checkout.join(id.resource_type.relative_path(&id.name)),
                        error: ImportError::Validation(LoadError::NotFound {
                            path: checkout.clone(),
                        }),
                    }),
                }
            }
        }
        report.sources.push(url);
        Ok(())
    }

    fn update_local(
        &self,
        record: ProvenanceRecord,
        options: &UpdateOptions,
        outcome: &mut ImportOutcome,
    ) -> Result<(), UpdateError> {
        let id = record.id();
        let source = PathBuf::from(
            record
                .source_url
                .strip_prefix("file://")
                .unwrap_or(&record.source_url),
        );
        if std::fs::symlink_metadata(&source).is_err() {
            info!(
                "Source {} of {} no longer exists, skipping",
                source.display(),
                id
            );
            outcome.skipped.push(id);
            return Ok(());
        }
        let path = match record.source_type {
            SourceKind::Local if source.is_dir() => match locate(&source, &id) {
                Some(path) => path,
                None => {
                    outcome.skipped.push(id);
                    return Ok(());
                }
            },
            _ => source,
        };
        outcome.merge(self.reimport(&path, &record, options)?);
        Ok(())
    }

    fn reimport(
        &self,
        path: &Path,
        record: &ProvenanceRecord,
        options: &UpdateOptions,
    ) -> Result<ImportOutcome, UpdateError> {
        let import_options = ImportOptions {
            force: true,
            skip_existing: false,
            dry_run: options.dry_run,
            mode: options.mode,
            source_url: Some(record.source_url.clone()),
            source_kind: Some(record.source_type),
            source_alias: Some(record.source_name.clone()),
            reference: Some(record.r#ref.clone()).filter(|r| !r.is_empty()),
        };
        Ok(Importer::new(self.repository)
            .import_without_commit(&[path.to_path_buf()], &import_options)?)
    }
}

/// Finds the resource `id` inside a source tree: under the root's conventional
/// directory first, then under any nested directory of the same name.
pub(crate) fn locate(root: &Path, id: &ResourceId) -> Option<PathBuf> {
    let relative = id.resource_type.relative_path(&id.name);
    let direct = root.join(&relative);
    if direct.exists() {
        return Some(direct);
    }
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.file_type().is_dir() && entry.file_name() == id.resource_type.dir_name()
        })
        .filter_map(|entry| entry.path().parent().map(|parent| parent.join(&relative)))
        .find(|candidate| candidate.exists())
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
        resource::ResourceType,
        workspace::WORKSPACE_DIR,
    };

    const HELLO: &str = "---\ndescription: hello\n---\nv1\n";

    fn cache(repository: &Repository) -> WorkspaceCache {
        WorkspaceCache::new(repository.root().join(WORKSPACE_DIR), Git::default()).unwrap()
    }

    fn import_remote(repository: &Repository, cache: &WorkspaceCache, url: &str) {
        let checkout = cache.get_or_clone(url, None).unwrap();
        let paths = crate::resource::discover(&checkout).unwrap();
        Importer::new(repository)
            .import(
                &paths,
                &ImportOptions {
                    source_url: Some(url.to_string()),
                    source_kind: Some(SourceKind::GitUrl),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn locate_nested_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("plugins/kit/commands/api/deploy.md");
        std::fs::create_dir_all(nested.parent().unwrap()).unwrap();
        std::fs::write(&nested, "").unwrap();
        let id = ResourceId::new(ResourceType::Command, "api/deploy");
        assert_eq!(locate(dir.path(), &id), Some(nested));
        assert_eq!(
            locate(dir.path(), &ResourceId::new(ResourceType::Skill, "pdf")),
            None
        );
    }

    #[test]
    fn refreshes_remote_resources_with_one_fetch_per_source() {
        if !git_available() {
            return;
        }
        let (dir, repository) = repository();
        let upstream = dir.path().join("upstream");
        init_upstream(
            &upstream,
            &[("commands/hello.md", HELLO), ("commands/bye.md", HELLO)],
        );
        let url = format!("file://{}", upstream.display());
        let cache = cache(&repository);
        import_remote(&repository, &cache, &url);

        commit_files(
            &upstream,
            &[("commands/hello.md", "---\ndescription: hello\n---\nv2\n")],
            "v2",
        );
        let report = Updater::new(&repository, &cache)
            .update(&[], &UpdateOptions::default())
            .unwrap();

        assert_eq!(report.sources, vec![url.clone()]);
        assert!(report.failed_sources.is_empty());
        assert_eq!(report.outcome.updated.len(), 2);
        assert!(report.outcome.committed);
        let content = std::fs::read_to_string(
            repository.resource_path(ResourceType::Command, "hello"),
        )
        .unwrap();
        assert!(content.ends_with("v2\n"));
        assert_eq!(cache.list_cached().unwrap(), vec![url]);
    }

    #[test]
    fn default_ref_resources_follow_the_branch_when_another_ref_shares_the_source() {
        if !git_available() {
            return;
        }
        let (dir, repository) = repository();
        let upstream = dir.path().join("upstream");
        init_upstream(
            &upstream,
            &[("commands/a.md", HELLO), ("commands/b.md", HELLO)],
        );
        crate::git::testing::git(&upstream, &["tag", "v1"]);
        let url = format!("file://{}", upstream.display());
        let cache = cache(&repository);
        let importer = Importer::new(&repository);
        for (name, reference) in [("a", None), ("b", Some("v1"))] {
            let checkout = cache.get_or_clone(&url, reference).unwrap();
            importer
                .import(
                    &[checkout.join(format!("commands/{name}.md"))],
                    &ImportOptions {
                        source_url: Some(url.clone()),
                        source_kind: Some(SourceKind::GitUrl),
                        reference: reference.map(str::to_owned),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        commit_files(
            &upstream,
            &[("commands/a.md", "---\ndescription: hello\n---\nv2\n")],
            "v2",
        );
        let report = Updater::new(&repository, &cache)
            .update(&[], &UpdateOptions::default())
            .unwrap();
        assert!(report.failed_sources.is_empty());
        assert!(report.outcome.failed.is_empty());

        let read = |name: &str| {
            std::fs::read_to_string(repository.resource_path(ResourceType::Command, name)).unwrap()
        };
        assert!(read("a").ends_with("v2\n"));
        assert!(read("b").ends_with("v1\n"));
    }

    #[test]
    fn dry_run_changes_nothing() {
        if !git_available() {
            return;
        }
        let (dir, repository) = repository();
        let upstream = dir.path().join("upstream");
        init_upstream(&upstream, &[("agents/helper.md", HELLO)]);
        let url = format!("file://{}", upstream.display());
        let cache = cache(&repository);
        import_remote(&repository, &cache, &url);
        let before = repository
            .provenance()
            .load(ResourceType::Agent, "helper")
            .unwrap();

        let report = Updater::new(&repository, &cache)
            .update(
                &[],
                &UpdateOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(report.outcome.updated.len(), 1);
        assert!(!report.outcome.committed);
        assert_eq!(
            repository
                .provenance()
                .load(ResourceType::Agent, "helper")
                .unwrap(),
            before
        );
    }

    #[test]
    fn local_sources_are_reimported_or_skipped() {
        let source = fixture_source();
        let (_dir, repository) = repository();
        let cache = cache(&repository);
        let paths = vec![
            source.path().join("agents/reviewer.md"),
            source.path().join("commands/db/deploy.md"),
        ];
        Importer::new(&repository)
            .import(&paths, &ImportOptions::default())
            .unwrap();

        std::fs::write(&paths[0], "---\ndescription: v2\n---\n").unwrap();
        std::fs::remove_file(&paths[1]).unwrap();

        let selection = [
            ResourceId::new(ResourceType::Agent, "reviewer"),
            ResourceId::new(ResourceType::Command, "db/deploy"),
        ];
        let report = Updater::new(&repository, &cache)
            .update(&selection, &UpdateOptions::default())
            .unwrap();
        assert_eq!(report.outcome.updated, vec![selection[0].clone()]);
        assert_eq!(report.outcome.skipped, vec![selection[1].clone()]);
        assert!(std::fs::read_to_string(
            repository.resource_path(ResourceType::Agent, "reviewer")
        )
        .unwrap()
        .contains("v2"));
        assert!(report.sources.is_empty());
    }
}
