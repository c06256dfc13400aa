use std::path::{Path, PathBuf};

use log::{debug, trace};
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use super::{validate_name, Frontmatter, FrontmatterError, NameError, Resource, ResourceType};

const SKILL_FILE_NAME: &str = "SKILL.md";
const PACKAGE_SUFFIX: &str = ".package.json";
const AGENT_KEYS: [&str; 3] = ["type", "instructions", "capabilities"];

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{} does not exist", path.display())]
    NotFound { path: PathBuf },
    #[error("Cannot determine the resource type of {}", path.display())]
    UnknownType { path: PathBuf },
    #[error("Invalid frontmatter in {}: {source}", path.display())]
    Frontmatter {
        path: PathBuf,
        source: FrontmatterError,
    },
    #[error("Invalid package file {}: {source}", path.display())]
    Package {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{} is missing the required field `{field}`", path.display())]
    MissingField { path: PathBuf, field: &'static str },
    #[error("Skill name `{name}` does not match its directory `{directory}`")]
    SkillNameMismatch { name: String, directory: String },
    #[error("Invalid {resource_type} name `{name}`: {source}")]
    Name {
        resource_type: ResourceType,
        name: String,
        source: NameError,
    },
    #[error("Failed to read {}: {source}", path.display())]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Turns a candidate path into a typed, named resource.
pub trait ResourceLoader {
    fn detect_type(&self, path: &Path) -> Result<ResourceType, LoadError>;

    fn load(&self, path: &Path, resource_type: ResourceType) -> Result<Resource, LoadError>;
}

/// Loader for resources laid out as markdown files, skill directories and
/// `.package.json` documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLoader;

#[derive(Deserialize)]
struct PackageFile {
    name: Option<String>,
    description: Option<String>,
}

impl ResourceLoader for FsLoader {
    fn detect_type(&self, path: &Path) -> Result<ResourceType, LoadError> {
        let metadata = std::fs::metadata(path).map_err(|source| not_found_or_io(path, source))?;
        if metadata.is_dir() {
            return if path.join(SKILL_FILE_NAME).is_file() {
                Ok(ResourceType::Skill)
            } else {
                Err(LoadError::UnknownType {
                    path: path.to_path_buf(),
                })
            };
        }

        let file_name = file_name(path);
        if file_name == SKILL_FILE_NAME {
            return Ok(ResourceType::Skill);
        }
        if file_name.ends_with(PACKAGE_SUFFIX) {
            return Ok(ResourceType::Package);
        }
        if !file_name.ends_with(".md") {
            return Err(LoadError::UnknownType {
                path: path.to_path_buf(),
            });
        }

        // The nearest conventional directory wins, so `agents/x/commands/y.md` is a command.
        let conventional = path
            .parent()
            .into_iter()
            .flat_map(Path::ancestors)
            .find_map(|ancestor| match ancestor.file_name()?.to_str()? {
                "agents" => Some(ResourceType::Agent),
                "commands" => Some(ResourceType::Command),
                _ => None,
            });
        if let Some(resource_type) = conventional {
            return Ok(resource_type);
        }

        // Outside a conventional directory the frontmatter decides.
        let text = read(path)?;
        let resource_type = match Frontmatter::parse(&text) {
            Ok(frontmatter) if AGENT_KEYS.iter().any(|key| frontmatter.contains(key)) => {
                ResourceType::Agent
            }
            _ => ResourceType::Command,
        };
        trace!("Detected {} from frontmatter of {}", resource_type, path.display());
        Ok(resource_type)
    }

    fn load(&self, path: &Path, resource_type: ResourceType) -> Result<Resource, LoadError> {
        match resource_type {
            ResourceType::Command => load_markdown(path, resource_type, command_name(path)),
            ResourceType::Agent => load_markdown(path, resource_type, file_stem(path)),
            ResourceType::Skill => load_skill(path),
            ResourceType::Package => load_package(path),
        }
    }
}

fn load_markdown(
    path: &Path,
    resource_type: ResourceType,
    name: String,
) -> Result<Resource, LoadError> {
    let frontmatter = parse_frontmatter(path)?;
    checked_name(resource_type, &name)?;
    Ok(Resource {
        resource_type,
        name,
        description: frontmatter
            .get_str("description")
            .unwrap_or_default()
            .to_owned(),
        path: path.to_path_buf(),
    })
}

fn load_skill(path: &Path) -> Result<Resource, LoadError> {
    let directory = if file_name(path) == SKILL_FILE_NAME {
        path.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        path.to_path_buf()
    };
    let skill_file = directory.join(SKILL_FILE_NAME);
    if !skill_file.is_file() {
        return Err(LoadError::NotFound { path: skill_file });
    }
    let frontmatter = parse_frontmatter(&skill_file)?;

    let directory_name = file_name(&directory);
    let name = frontmatter
        .get_str("name")
        .unwrap_or(&directory_name)
        .to_owned();
    if name != directory_name {
        return Err(LoadError::SkillNameMismatch {
            name,
            directory: directory_name,
        });
    }
    checked_name(ResourceType::Skill, &name)?;

    Ok(Resource {
        resource_type: ResourceType::Skill,
        name,
        description: frontmatter
            .get_str("description")
            .unwrap_or_default()
            .to_owned(),
        path: directory,
    })
}

fn load_package(path: &Path) -> Result<Resource, LoadError> {
    let text = read(path)?;
    let package: PackageFile =
        serde_json::from_str(&text).map_err(|source| LoadError::Package {
            path: path.to_path_buf(),
            source,
        })?;
    let name = package
        .name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| LoadError::MissingField {
            path: path.to_path_buf(),
            field: "name",
        })?;
    let description = package
        .description
        .filter(|description| !description.trim().is_empty())
        .ok_or_else(|| LoadError::MissingField {
            path: path.to_path_buf(),
            field: "description",
        })?;
    checked_name(ResourceType::Package, &name)?;
    Ok(Resource {
        resource_type: ResourceType::Package,
        name,
        description,
        path: path.to_path_buf(),
    })
}

/// Path below the nearest `commands` ancestor, so `commands/api/deploy.md`
/// is `api/deploy`. Files outside such a directory use their stem.
fn command_name(path: &Path) -> String {
    let components: Vec<_> = path.components().collect();
    let anchor = components[..components.len().saturating_sub(1)]
        .iter()
        .rposition(|c| c.as_os_str() == "commands");
    match anchor {
        Some(index) => {
            let segments: Vec<_> = components[index + 1..]
                .iter()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect();
            let joined = segments.join("/");
            joined
                .strip_suffix(".md")
                .map(str::to_owned)
                .unwrap_or(joined)
        }
        None => file_stem(path),
    }
}

fn checked_name(resource_type: ResourceType, name: &str) -> Result<(), LoadError> {
    validate_name(resource_type, name).map_err(|source| LoadError::Name {
        resource_type,
        name: name.to_owned(),
        source,
    })
}

fn parse_frontmatter(path: &Path) -> Result<Frontmatter, LoadError> {
    Frontmatter::parse(&read(path)?).map_err(|source| LoadError::Frontmatter {
        path: path.to_path_buf(),
        source,
    })
}

fn read(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| not_found_or_io(path, source))
}

fn not_found_or_io(path: &Path, source: std::io::Error) -> LoadError {
    if source.kind() == std::io::ErrorKind::NotFound {
        LoadError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        LoadError::IO {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Candidate paths under `root` following the conventional layout:
/// `commands/**/*.md`, `skills/*/SKILL.md`, `agents/*.md` and
/// `packages/*.package.json`.
///
/// A `root` that is itself a single resource (a markdown or package file, or a
/// directory holding `SKILL.md`) yields just that path.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let metadata = std::fs::metadata(root).map_err(|source| not_found_or_io(root, source))?;
    if metadata.is_file() || root.join(SKILL_FILE_NAME).is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut found = Vec::new();
    walk(&root.join("commands"), None, &mut found, |path| {
        path.is_file() && file_name(path).ends_with(".md")
    })?;
    walk(&root.join("skills"), Some(1), &mut found, |path| {
        path.is_dir() && path.join(SKILL_FILE_NAME).is_file()
    })?;
    walk(&root.join("agents"), Some(1), &mut found, |path| {
        path.is_file() && file_name(path).ends_with(".md")
    })?;
    walk(&root.join("packages"), Some(1), &mut found, |path| {
        path.is_file() && file_name(path).ends_with(PACKAGE_SUFFIX)
    })?;
    debug!("Discovered {} candidate(s) under {}", found.len(), root.display());
    Ok(found)
}

fn walk(
    dir: &Path,
    max_depth: Option<usize>,
    found: &mut Vec<PathBuf>,
    accept: impl Fn(&Path) -> bool,
) -> Result<(), LoadError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let mut walker = WalkDir::new(dir).min_depth(1).sort_by_file_name();
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }
    let entries = walker
        .into_iter()
        .filter_entry(|entry| !entry.file_name().to_string_lossy().starts_with('.'));
    for entry in entries {
        let entry = entry.map_err(|error| LoadError::IO {
            path: dir.to_path_buf(),
            source: error.into(),
        })?;
        if accept(entry.path()) {
            found.push(entry.into_path());
        }
    }
    Ok(())
}
