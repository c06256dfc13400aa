mod frontmatter;
mod loader;

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use frontmatter::{Frontmatter, FrontmatterError};
pub use loader::{discover, FsLoader, LoadError, ResourceLoader};

pub const MAX_NAME_SEGMENT_LENGTH: usize = 64;

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize, Ord, PartialOrd)]
pub enum ResourceType {
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "skill")]
    Skill,
    #[serde(rename = "agent")]
    Agent,
    #[serde(rename = "package")]
    Package,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Command,
        ResourceType::Skill,
        ResourceType::Agent,
        ResourceType::Package,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Command => "command",
            ResourceType::Skill => "skill",
            ResourceType::Agent => "agent",
            ResourceType::Package => "package",
        }
    }

    /// Top level repository directory holding resources of this type.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ResourceType::Command => "commands",
            ResourceType::Skill => "skills",
            ResourceType::Agent => "agents",
            ResourceType::Package => "packages",
        }
    }

    /// Repository relative location of the resource `name`.
    ///
    /// Command names map their `/` separated segments onto nested directories.
    pub fn relative_path(&self, name: &str) -> PathBuf {
        let mut path = PathBuf::from(self.dir_name());
        match self {
            ResourceType::Command | ResourceType::Agent => {
                path.extend(name.split('/'));
                path.set_extension("md");
            }
            ResourceType::Skill => path.push(name),
            ResourceType::Package => path.push(format!("{name}.package.json")),
        }
        path
    }

    /// Inverse of [`ResourceType::relative_path`] for a path below the type directory.
    pub fn name_from_relative(&self, relative: &Path) -> Option<String> {
        let relative = relative.to_str()?.replace('\\', "/");
        match self {
            ResourceType::Command | ResourceType::Agent => {
                relative.strip_suffix(".md").map(str::to_owned)
            }
            ResourceType::Skill => Some(relative.trim_end_matches('/').to_owned()),
            ResourceType::Package => relative.strip_suffix(".package.json").map(str::to_owned),
        }
        .filter(|name| !name.is_empty())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "command" | "commands" => Ok(ResourceType::Command),
            "skill" | "skills" => Ok(ResourceType::Skill),
            "agent" | "agents" => Ok(ResourceType::Agent),
            "package" | "packages" => Ok(ResourceType::Package),
            other => Err(format!("unknown resource type `{other}`")),
        }
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a resource. Names are unique per type only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ResourceId {
    pub resource_type: ResourceType,
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: ResourceType, name: impl Into<String>) -> Self {
        Self {
            resource_type,
            name: name.into(),
        }
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    /// Parses `type/name`, e.g. `command/api/deploy`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (resource_type, name) = value
            .split_once('/')
            .ok_or_else(|| format!("expected `type/name`, got `{value}`"))?;
        let resource_type = resource_type.parse::<ResourceType>()?;
        validate_name(resource_type, name).map_err(|e| e.to_string())?;
        Ok(ResourceId::new(resource_type, name))
    }
}

/// A loaded candidate: identity plus the path it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub name: String,
    pub description: String,
    /// File, or directory for skills, to materialize.
    pub path: PathBuf,
}

impl Resource {
    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.resource_type, self.name.clone())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("segment `{0}` is longer than {MAX_NAME_SEGMENT_LENGTH} characters")]
    TooLong(String),
    #[error("segment `{0}` must be lowercase letters and digits separated by single hyphens")]
    InvalidSegment(String),
    #[error("only commands may be nested, {0} names cannot contain `/`")]
    Nested(ResourceType),
}

/// Each `/` separated segment must match `^[a-z0-9]+(-[a-z0-9]+)*$`.
pub fn validate_name(resource_type: ResourceType, name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.contains('/') && resource_type != ResourceType::Command {
        return Err(NameError::Nested(resource_type));
    }
    for segment in name.split('/') {
        if segment.len() > MAX_NAME_SEGMENT_LENGTH {
            return Err(NameError::TooLong(segment.to_owned()));
        }
        let valid = !segment.is_empty()
            && !segment.starts_with('-')
            && !segment.ends_with('-')
            && !segment.contains("--")
            && segment
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid {
            return Err(NameError::InvalidSegment(segment.to_owned()));
        }
    }
    Ok(())
}
