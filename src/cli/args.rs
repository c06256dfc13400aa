use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{
    import::ImportMode,
    resource::{ResourceId, ResourceType},
};

/// Versioned repository for AI commands, skills, agents and packages.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct CliArgs {
    #[command(subcommand)]
    pub cmd: Command,
    /// Location of the resource repository [default: $HOME/.local/share/airepo/repo]
    #[arg(short, long)]
    pub repo: Option<PathBuf>,
    /// Name of the sources manifest inside the repository
    #[arg(short, long, env = "AIREPO_MANIFEST", default_value = "airepo.toml")]
    pub manifest: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Creates the repository layout and puts it under git
    Init,
    /// Imports resource files or directories into the repository
    Import {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[command(flatten)]
        flags: ImportFlags,
    },
    /// Imports every resource of a source (gh:owner/repo, git URL or directory)
    Add {
        source: String,
        /// Name recorded as the resource source
        #[arg(short, long)]
        name: Option<String>,
        /// Also record the source in the manifest
        #[arg(short, long)]
        save: bool,
        #[command(flatten)]
        flags: ImportFlags,
    },
    /// Refreshes resources from their recorded sources
    Update {
        /// Resources to refresh, as type/name [default: all]
        resources: Vec<ResourceId>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-imports every source listed in the manifest
    Sync {
        #[arg(long)]
        dry_run: bool,
    },
    /// Removes a resource, as type/name
    Remove { resource: ResourceId },
    /// Lists repository resources
    List {
        #[arg(short = 't', long = "type")]
        resource_type: Option<ResourceType>,
    },
    /// Manages the workspace cache of source checkouts
    Cache {
        #[command(subcommand)]
        cmd: CacheCommand,
    },
    /// Finds and fixes drift between the repository and an install target
    Repair {
        /// Directory resources are linked into, e.g. ~/.claude
        #[arg(short, long)]
        target: PathBuf,
        /// Expect every repository resource to be installed
        #[arg(short, long)]
        all: bool,
        #[arg(long)]
        dry_run: bool,
        /// Remove orphaned metadata
        #[arg(short, long)]
        force: bool,
        /// Remove unmanaged files from the target
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Lists cached source URLs
    List,
    /// Removes cached sources no resource or manifest entry refers to
    Prune {
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long)]
        force: bool,
    },
    /// Removes one cached source
    Remove { url: String },
}

#[derive(Debug, Args)]
pub struct ImportFlags {
    /// Overwrite resources that already exist
    #[arg(short, long)]
    pub force: bool,
    /// Leave resources that already exist untouched
    #[arg(long, conflicts_with = "force")]
    pub skip_existing: bool,
    #[arg(long)]
    pub dry_run: bool,
    /// copy or symlink [default: configured mode]
    #[arg(long)]
    pub mode: Option<ImportMode>,
}
