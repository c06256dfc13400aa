use log::{debug, info, warn};

use crate::{
    import::{absolute, ImportOptions, ImportOutcome, Importer},
    manifest::{Manifest, ManifestSource},
    repair::{FixOptions, FixResult, Installer, Issue, RepairEngine},
    repository::Repository,
    resource::{discover, ResourceId, ResourceType},
    source::{derive_source_name, resolve, SourceDescriptor, SourceKind},
    update::{UpdateOptions, UpdateReport, Updater},
    workspace::WorkspaceCache,
};
use std::{
    error::Error,
    path::{Path, PathBuf},
};

/// Outcome of a sync over every manifest source.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub outcome: ImportOutcome,
    /// Sources that could not be synced, with the reason.
    pub failed_sources: Vec<(String, String)>,
}

/// Handler to init command
pub fn do_init(repository: &Repository) -> Result<(), Box<dyn Error>> {
    repository.init()?;
    info!("Initialized repository in {}", repository.root().display());
    Ok(())
}

/// Handler to import command
pub fn do_import(
    repository: &Repository,
    paths: &[PathBuf],
    options: &ImportOptions,
) -> Result<ImportOutcome, Box<dyn Error>> {
    Ok(Importer::new(repository).import(paths, options)?)
}

/// Handler to add command
/// 1 - Resolves the source string
/// 2 - Materializes remote sources in the workspace cache
/// 3 - Imports every resource found under the source
/// 4 - Optionally records the source in the manifest
pub fn do_add(
    repository: &Repository,
    cache: &WorkspaceCache,
    source: &str,
    options: ImportOptions,
    manifest_path: Option<&Path>,
) -> Result<ImportOutcome, Box<dyn Error>> {
    let descriptor = resolve(source)?;
    let dry_run = options.dry_run;
    let alias = options.source_alias.clone();
    let outcome = import_source(repository, cache, &descriptor, options, true)?;

    if let Some(manifest_path) = manifest_path.filter(|_| !dry_run) {
        let name = alias.unwrap_or_else(|| match &descriptor {
            SourceDescriptor::Remote { url, .. } => derive_source_name(url),
            SourceDescriptor::Local { path } => derive_source_name(&path.to_string_lossy()),
        });
        let entry = match &descriptor {
            SourceDescriptor::Remote { .. } => ManifestSource {
                name,
                url: Some(source.trim().to_owned()),
                path: None,
                reference: None,
            },
            SourceDescriptor::Local { path } => ManifestSource {
                name,
                url: None,
                path: Some(absolute(path)),
                reference: None,
            },
        };
        let mut manifest = Manifest::load(manifest_path)?.unwrap_or_default();
        info!("Recording source `{}` in {}", entry.name, manifest_path.display());
        manifest.upsert(entry)?;
        manifest.save(manifest_path)?;
    }
    Ok(outcome)
}

/// Handler to update command
pub fn do_update(
    repository: &Repository,
    cache: &WorkspaceCache,
    selection: &[ResourceId],
    options: &UpdateOptions,
) -> Result<UpdateReport, Box<dyn Error>> {
    let report = Updater::new(repository, cache).update(selection, options)?;
    for (url, error) in &report.failed_sources {
        warn!("Could not refresh {}: {}", url, error);
    }
    Ok(report)
}

/// Handler to sync command
/// Re-imports every manifest source with `force`, stamping the source name,
/// and commits once at the end.
pub fn do_sync(
    repository: &Repository,
    cache: &WorkspaceCache,
    manifest_path: &Path,
    options: ImportOptions,
) -> Result<SyncReport, Box<dyn Error>> {
    let manifest = Manifest::from_file(manifest_path)?;
    let base = manifest_path.parent().unwrap_or(Path::new("."));
    let mut report = SyncReport::default();

    for source in &manifest.sources {
        info!("Syncing source `{}`", source.name);
        let result = source
            .descriptor(base)
            .map_err(Box::<dyn Error>::from)
            .and_then(|descriptor| {
                let options = ImportOptions {
                    force: true,
                    skip_existing: false,
                    source_alias: Some(source.name.clone()),
                    ..options.clone()
                };
                import_source(repository, cache, &descriptor, options, false)
            });
        match result {
            Ok(outcome) => report.outcome.merge(outcome),
            Err(error) => {
                warn!("Failed to sync `{}`: {}", source.name, error);
                report
                    .failed_sources
                    .push((source.name.clone(), error.to_string()));
            }
        }
    }

    if !options.dry_run && report.outcome.changed() > 0 {
        let message = format!(
            "sync {} resource(s) ({})",
            report.outcome.changed(),
            report.outcome.counts
        );
        match repository.commit(&message) {
            Ok(committed) => report.outcome.committed = committed,
            Err(error) => warn!("Synced resources were not committed: {}", error),
        }
    }
    Ok(report)
}

/// Handler to remove command
pub fn do_remove(repository: &Repository, id: &ResourceId) -> Result<(), Box<dyn Error>> {
    repository.remove(id.resource_type, &id.name)?;
    Ok(())
}

pub fn do_list(
    repository: &Repository,
    resource_type: Option<ResourceType>,
) -> Result<Vec<ResourceId>, Box<dyn Error>> {
    Ok(repository.list(resource_type)?)
}

pub fn do_cache_list(cache: &WorkspaceCache) -> Result<Vec<String>, Box<dyn Error>> {
    Ok(cache.list_cached()?)
}

/// Handler to cache prune command
/// The live set is every remote source in provenance plus every remote
/// manifest source. A dry run only reports; otherwise `force` is required.
pub fn do_prune(
    repository: &Repository,
    cache: &WorkspaceCache,
    manifest_path: &Path,
    dry_run: bool,
    force: bool,
) -> Result<Vec<String>, Box<dyn Error>> {
    let mut live = repository.provenance().live_git_urls()?;
    if let Some(manifest) = Manifest::load(manifest_path)? {
        let base = manifest_path.parent().unwrap_or(Path::new("."));
        live.extend(manifest.live_urls(base)?);
    }
    debug!("Live sources: {:?}", live);

    if dry_run {
        let unreferenced = cache.unreferenced(&live)?;
        for url in &unreferenced {
            info!("Would remove cached repository {}", url);
        }
        return Ok(unreferenced);
    }
    if !force {
        return Err(
            "pruning deletes cached repositories, use force or preview with a dry run".into(),
        );
    }
    Ok(cache.prune(&live)?)
}

pub fn do_cache_remove(cache: &WorkspaceCache, url: &str) -> Result<bool, Box<dyn Error>> {
    let removed = cache.remove(url)?;
    if removed {
        info!("Removed cached repository {}", url);
    } else {
        info!("{} is not cached, nothing to do", url);
    }
    Ok(removed)
}

/// Handler to repair command
pub fn do_repair(
    repository: &Repository,
    installer: &dyn Installer,
    expected: &[ResourceId],
    options: &FixOptions,
) -> Result<(Vec<Issue>, Vec<FixResult>), Box<dyn Error>> {
    let engine = RepairEngine::new(repository, installer);
    let issues = engine.scan(expected)?;
    if issues.is_empty() {
        info!("No issues found");
        return Ok((issues, Vec::new()));
    }
    for issue in &issues {
        info!("Found {}", issue);
    }
    let results = engine.fix(&issues, options);
    Ok((issues, results))
}

/// Imports everything found under a resolved source, stamping its provenance.
fn import_source(
    repository: &Repository,
    cache: &WorkspaceCache,
    descriptor: &SourceDescriptor,
    options: ImportOptions,
    commit: bool,
) -> Result<ImportOutcome, Box<dyn Error>> {
    let (root, options) = match descriptor {
        SourceDescriptor::Remote {
            kind,
            url,
            reference,
            subpath,
        } => {
            let cached = cache.entry_path(url).exists();
            let checkout = cache.get_or_clone(url, reference.as_deref())?;
            if cached {
                if let Err(error) = cache.update(url, reference.as_deref()) {
                    warn!("Failed to refresh {}, using the cached checkout: {}", url, error);
                }
            }
            let root = match subpath {
                Some(subpath) => checkout.join(subpath),
                None => checkout.clone(),
            };
            if !absolute(&root).starts_with(absolute(&checkout)) || !root.exists() {
                return Err(format!(
                    "subpath `{}` not found in {}",
                    subpath.as_deref().unwrap_or_default(),
                    url
                )
                .into());
            }
            let options = ImportOptions {
                source_url: Some(url.clone()),
                source_kind: Some(*kind),
                source_alias: options
                    .source_alias
                    .clone()
                    .or_else(|| Some(derive_source_name(url))),
                reference: reference.clone(),
                ..options
            };
            (root, options)
        }
        SourceDescriptor::Local { path } => {
            if !path.exists() {
                return Err(format!("{} does not exist", path.display()).into());
            }
            let root = absolute(path);
            let url = root.to_string_lossy().into_owned();
            let options = ImportOptions {
                source_alias: options
                    .source_alias
                    .clone()
                    .or_else(|| Some(derive_source_name(&url))),
                source_url: Some(url),
                source_kind: Some(SourceKind::Local),
                reference: None,
                ..options
            };
            (root, options)
        }
    };

    let paths = discover(&root)?;
    if paths.is_empty() {
        warn!("No resources found in {}", root.display());
    }
    let importer = Importer::new(repository);
    let outcome = if commit {
        importer.import(&paths, &options)?
    } else {
        importer.import_without_commit(&paths, &options)?
    };
    Ok(outcome)
}
