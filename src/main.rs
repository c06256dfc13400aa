use std::error::Error;

use clap::Parser;
use env_logger::Env;

use airepo::{
    cli::args::{CacheCommand, CliArgs, Command, ImportFlags},
    import::{ImportOptions, ImportOutcome},
    repair::{FixOptions, FixStatus, SymlinkInstaller},
    resource::ResourceType,
    Airepo, PruneMode,
};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = CliArgs::parse();

    let mut builder = Airepo::builder().manifest_file_name(&cli_args.manifest);
    if let Some(repo) = &cli_args.repo {
        builder = builder.repo_dir(repo);
    }
    let airepo = builder.try_build()?;

    match cli_args.cmd {
        Command::Init => airepo.init(),
        Command::Import { paths, flags } => {
            let options = import_options(&airepo, flags, None);
            let outcome = airepo.import(&paths, &options)?;
            report(&outcome, options.dry_run)
        }
        Command::Add {
            source,
            name,
            save,
            flags,
        } => {
            let options = import_options(&airepo, flags, name);
            let dry_run = options.dry_run;
            let outcome = airepo.add(&source, options, save)?;
            report(&outcome, dry_run)
        }
        Command::Update { resources, dry_run } => {
            let update = airepo.update(&resources, dry_run)?;
            report(&update.outcome, dry_run)?;
            if !update.failed_sources.is_empty() {
                let failed = update.failed_sources.len();
                return Err(format!("{failed} source(s) could not be refreshed").into());
            }
            Ok(())
        }
        Command::Sync { dry_run } => {
            let sync = airepo.sync(dry_run)?;
            report(&sync.outcome, dry_run)?;
            if !sync.failed_sources.is_empty() {
                let failed = sync.failed_sources.len();
                return Err(format!("{failed} source(s) failed to sync").into());
            }
            Ok(())
        }
        Command::Remove { resource } => airepo.remove(&resource),
        Command::List { resource_type } => {
            for id in airepo.list(resource_type)? {
                println!("{id}");
            }
            Ok(())
        }
        Command::Cache { cmd } => match cmd {
            CacheCommand::List => {
                for url in airepo.cached_sources()? {
                    println!("{url}");
                }
                Ok(())
            }
            CacheCommand::Prune { dry_run, force } => {
                let mode = match (dry_run, force) {
                    (true, _) => PruneMode::DryRun,
                    (false, true) => PruneMode::Force,
                    (false, false) => {
                        return Err("cache prune needs --force, or --dry-run to preview".into())
                    }
                };
                let pruned = airepo.prune(mode)?;
                log::info!("{} cached source(s) unreferenced", pruned.len());
                Ok(())
            }
            CacheCommand::Remove { url } => airepo.remove_cached(&url).map(|_| ()),
        },
        Command::Repair {
            target,
            all,
            dry_run,
            force,
            reset,
        } => {
            let installer = SymlinkInstaller::new(airepo.root().to_path_buf(), target);
            let expected = if all {
                airepo
                    .list(None)?
                    .into_iter()
                    .filter(|id| id.resource_type != ResourceType::Package)
                    .collect()
            } else {
                Vec::new()
            };
            let options = FixOptions {
                dry_run,
                force,
                reset,
            };
            let (_, results) = airepo.repair(&installer, &expected, &options)?;
            let mut failed = 0;
            for result in &results {
                match result.status {
                    FixStatus::Failed => {
                        failed += 1;
                        log::warn!("{}: {}", result.issue, result.message)
                    }
                    _ => log::info!("{}: {}", result.issue, result.message),
                }
            }
            if failed > 0 {
                return Err(format!("{failed} issue(s) could not be fixed").into());
            }
            Ok(())
        }
    }
}

fn import_options(airepo: &Airepo, flags: ImportFlags, name: Option<String>) -> ImportOptions {
    ImportOptions {
        force: flags.force,
        skip_existing: flags.skip_existing,
        dry_run: flags.dry_run,
        mode: flags.mode.unwrap_or(airepo.import_mode()),
        source_alias: name,
        ..Default::default()
    }
}

fn report(outcome: &ImportOutcome, dry_run: bool) -> Result<(), Box<dyn Error>> {
    let verb = if dry_run { "Would import" } else { "Imported" };
    log::info!(
        "{} {} resource(s): {} added, {} updated, {} skipped",
        verb,
        outcome.changed(),
        outcome.added.len(),
        outcome.updated.len(),
        outcome.skipped.len()
    );
    for failure in &outcome.failed {
        log::warn!("{}: {}", failure.path.display(), failure.error);
    }
    if !outcome.failed.is_empty() {
        return Err(format!("{} resource(s) failed to import", outcome.failed.len()).into());
    }
    Ok(())
}
