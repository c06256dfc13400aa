use std::{
    fmt::Display,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const OWNER_REPO_PATTERN: &str = r"^[a-zA-Z0-9_-]+/[a-zA-Z0-9_.-]+$";
const GITHUB_URL_PATTERN: &str = r"^https?://github\.com/[a-zA-Z0-9_-]+/[a-zA-Z0-9_.-]+";
const GITLAB_URL_PATTERN: &str = r"^https?://gitlab\.com/";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source cannot be empty")]
    Empty,
    #[error("Invalid GitHub source `{input}`: {reason}")]
    InvalidGithub { input: String, reason: &'static str },
    #[error("Invalid git URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: &'static str },
    #[error("Local path cannot be empty")]
    EmptyPath,
    #[error(
        "Unrecognized source `{0}`: expected gh:owner/repo, owner/repo, a git URL or a path starting with ./, ../ or /"
    )]
    Unrecognized(String),
    #[error("Local source {0} has no clone URL")]
    NotRemote(String),
    #[error("Invalid source pattern: {0}")]
    Pattern(String),
}

impl From<regex_lite::Error> for SourceError {
    fn from(error: regex_lite::Error) -> Self {
        SourceError::Pattern(error.to_string())
    }
}

/// Where a resource came from, as recorded in provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "github")]
    Github,
    #[serde(rename = "gitlab")]
    Gitlab,
    #[serde(rename = "git-url")]
    GitUrl,
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "file")]
    File,
}

impl SourceKind {
    /// Sources backed by a remote repository and therefore by a workspace cache entry.
    pub fn is_remote_git(self) -> bool {
        matches!(
            self,
            SourceKind::Github | SourceKind::Gitlab | SourceKind::GitUrl
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Github => "github",
            SourceKind::Gitlab => "gitlab",
            SourceKind::GitUrl => "git-url",
            SourceKind::Local => "local",
            SourceKind::File => "file",
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "github" => Ok(SourceKind::Github),
            "gitlab" => Ok(SourceKind::Gitlab),
            "git-url" => Ok(SourceKind::GitUrl),
            "local" => Ok(SourceKind::Local),
            "file" => Ok(SourceKind::File),
            other => Err(format!("unknown source kind `{other}`")),
        }
    }
}

/// A parsed source string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    Remote {
        kind: SourceKind,
        /// Canonical clone URL; the workspace cache keys on this.
        url: String,
        /// Empty means the provider default branch.
        reference: Option<String>,
        subpath: Option<String>,
    },
    Local {
        path: PathBuf,
    },
}

impl SourceDescriptor {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceDescriptor::Remote { kind, .. } => *kind,
            SourceDescriptor::Local { .. } => SourceKind::Local,
        }
    }

    /// The URL the workspace cache keys on.
    pub fn clone_url(&self) -> Result<&str, SourceError> {
        match self {
            SourceDescriptor::Remote { url, .. } => Ok(url),
            SourceDescriptor::Local { path } => {
                Err(SourceError::NotRemote(path.display().to_string()))
            }
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            SourceDescriptor::Remote { reference, .. } => reference.as_deref(),
            SourceDescriptor::Local { .. } => None,
        }
    }

    pub fn subpath(&self) -> Option<&str> {
        match self {
            SourceDescriptor::Remote { subpath, .. } => subpath.as_deref(),
            SourceDescriptor::Local { .. } => None,
        }
    }
}

impl Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SourceDescriptor::Remote {
                url,
                reference,
                subpath,
                ..
            } => {
                f.write_str(url)?;
                if let Some(reference) = reference {
                    write!(f, "@{reference}")?;
                }
                if let Some(subpath) = subpath {
                    write!(f, " ({subpath})")?;
                }
                Ok(())
            }
            SourceDescriptor::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for SourceDescriptor {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resolve(s)
    }
}

/// Parses a source string.
///
/// Recognized forms, in priority order:
/// - `gh:owner/repo[/subpath][@ref[/subpath]]` and `local:<path>`
/// - bare `owner/repo` (GitHub)
/// - `http(s)://`, `ssh://`, `git://`, `file://` URLs and `git@host:owner/repo`
/// - paths starting with `./`, `../` or `/`
pub fn resolve(input: &str) -> Result<SourceDescriptor, SourceError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SourceError::Empty);
    }

    if let Some(rest) = input.strip_prefix("gh:") {
        return parse_github_shorthand(rest);
    }
    if let Some(rest) = input.strip_prefix("local:") {
        return parse_local(rest);
    }
    if Regex::new(OWNER_REPO_PATTERN)?.is_match(input) {
        return parse_github_shorthand(input);
    }
    if input.starts_with("http://") || input.starts_with("https://") {
        return parse_http(input);
    }
    if input.starts_with("ssh://") || input.starts_with("git://") || input.starts_with("file://")
    {
        return Ok(SourceDescriptor::Remote {
            kind: SourceKind::GitUrl,
            url: input.trim_end_matches('/').to_owned(),
            reference: None,
            subpath: None,
        });
    }
    if let Some(rest) = input.strip_prefix("git@") {
        return parse_scp_like(input, rest);
    }
    if input.starts_with("./") || input.starts_with("../") || Path::new(input).is_absolute() {
        return parse_local(input);
    }

    Err(SourceError::Unrecognized(input.to_owned()))
}

fn parse_github_shorthand(input: &str) -> Result<SourceDescriptor, SourceError> {
    let invalid = |reason| SourceError::InvalidGithub {
        input: input.to_owned(),
        reason,
    };
    if input.is_empty() {
        return Err(invalid("source cannot be empty"));
    }

    let (repo_part, after_at) = match input.split_once('@') {
        Some((repo_part, after_at)) => (repo_part, Some(after_at)),
        None => (input, None),
    };

    let mut parts = repo_part.splitn(3, '/');
    let owner = parts.next().unwrap_or_default();
    let repo = parts
        .next()
        .ok_or_else(|| invalid("must be owner/repo"))?
        .trim_end_matches(".git");
    if owner.is_empty() || repo.is_empty() {
        return Err(invalid("owner and repo cannot be empty"));
    }
    let mut subpath = parts.next().map(str::to_owned);

    let mut reference = None;
    if let Some(after_at) = after_at {
        let (name, rest) = match after_at.split_once('/') {
            Some((name, rest)) => (name, Some(rest)),
            None => (after_at, None),
        };
        if name.is_empty() {
            return Err(invalid("ref after @ cannot be empty"));
        }
        reference = Some(name.to_owned());
        if let Some(rest) = rest {
            subpath = Some(rest.to_owned());
        }
    }

    Ok(SourceDescriptor::Remote {
        kind: SourceKind::Github,
        url: format!("https://github.com/{owner}/{repo}"),
        reference,
        subpath: subpath.filter(|s| !s.is_empty()),
    })
}

fn parse_local(input: &str) -> Result<SourceDescriptor, SourceError> {
    if input.trim().is_empty() {
        return Err(SourceError::EmptyPath);
    }
    Ok(SourceDescriptor::Local {
        path: clean_path(Path::new(input)),
    })
}

fn parse_http(input: &str) -> Result<SourceDescriptor, SourceError> {
    if Regex::new(GITHUB_URL_PATTERN)?.is_match(input) {
        return parse_github_url(input);
    }

    let (scheme, rest) = input.split_once("://").unwrap_or(("https", input));
    if rest.split('/').next().unwrap_or_default().is_empty() {
        return Err(SourceError::InvalidUrl {
            input: input.to_owned(),
            reason: "missing host",
        });
    }

    let url = format!("{scheme}://{}", rest.trim_end_matches('/'));
    if Regex::new(GITLAB_URL_PATTERN)?.is_match(input) {
        return Ok(SourceDescriptor::Remote {
            kind: SourceKind::Gitlab,
            url: url.trim_end_matches(".git").to_owned(),
            reference: None,
            subpath: None,
        });
    }

    Ok(SourceDescriptor::Remote {
        kind: SourceKind::GitUrl,
        url,
        reference: None,
        subpath: None,
    })
}

fn parse_github_url(input: &str) -> Result<SourceDescriptor, SourceError> {
    let trimmed = input.trim_end_matches('/').trim_end_matches(".git");
    let path = trimmed
        .split_once("github.com/")
        .map(|(_, path)| path)
        .unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(SourceError::InvalidGithub {
            input: input.to_owned(),
            reason: "URL must include owner and repo",
        });
    }

    let (reference, subpath) =
        if segments.len() >= 4 && (segments[2] == "tree" || segments[2] == "blob") {
            let subpath = (segments.len() > 4).then(|| segments[4..].join("/"));
            (Some(segments[3].to_owned()), subpath)
        } else {
            (None, None)
        };

    Ok(SourceDescriptor::Remote {
        kind: SourceKind::Github,
        url: format!("https://github.com/{}/{}", segments[0], segments[1]),
        reference,
        subpath,
    })
}

/// `git@host:owner/repo.git`, rewritten as `https://host/owner/repo`.
fn parse_scp_like(input: &str, rest: &str) -> Result<SourceDescriptor, SourceError> {
    let (host, path) = rest.split_once(':').ok_or_else(|| SourceError::InvalidUrl {
        input: input.to_owned(),
        reason: "expected git@host:owner/repo",
    })?;
    let path = path.trim_matches('/').trim_end_matches(".git");
    if host.is_empty() || path.is_empty() {
        return Err(SourceError::InvalidUrl {
            input: input.to_owned(),
            reason: "host and repository path cannot be empty",
        });
    }

    let kind = if host.contains("github.com") {
        SourceKind::Github
    } else if host.contains("gitlab.com") {
        SourceKind::Gitlab
    } else {
        SourceKind::GitUrl
    };

    Ok(SourceDescriptor::Remote {
        kind,
        url: format!("https://{host}/{path}"),
        reference: None,
        subpath: None,
    })
}

/// Lexically normalizes `.` and `..` components without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let ends_with_normal = matches!(
                    cleaned.components().next_back(),
                    Some(Component::Normal(_))
                );
                if ends_with_normal {
                    cleaned.pop();
                } else if !cleaned.has_root() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

/// Human readable source name used when no alias is configured.
///
/// - `gh:owner/repo` and `https://github.com/owner/repo` become `owner-repo`
/// - `file:///path/to/dir` and local paths become their last component
/// - other URLs become their last path segment
pub fn derive_source_name(source_url: &str) -> String {
    if source_url.is_empty() {
        return "unknown".to_owned();
    }

    if let Some(rest) = source_url.strip_prefix("gh:") {
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() >= 2 {
            return format!("{}-{}", parts[0], parts[1]);
        }
        return rest.replace('/', "-");
    }

    if let Some(path) = source_url.strip_prefix("file://") {
        return base_name(path);
    }

    if let Some(rest) = source_url.strip_prefix("https://github.com/") {
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() >= 2 {
            return format!("{}-{}", parts[0], parts[1].trim_end_matches(".git"));
        }
    }

    if source_url.starts_with("http://") || source_url.starts_with("https://") {
        if let Some(last) = source_url.trim_end_matches('/').rsplit('/').next() {
            return last.to_owned();
        }
    }

    if source_url.starts_with('/') || source_url.starts_with("./") || source_url.starts_with("../")
    {
        return base_name(source_url);
    }

    source_url.replace('/', "-")
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn remote(
        kind: SourceKind,
        url: &str,
        reference: Option<&str>,
        subpath: Option<&str>,
    ) -> SourceDescriptor {
        SourceDescriptor::Remote {
            kind,
            url: url.to_owned(),
            reference: reference.map(str::to_owned),
            subpath: subpath.map(str::to_owned),
        }
    }

    #[test]
    fn github_prefix() {
        assert_eq!(
            resolve("gh:anthropics/skills").unwrap(),
            remote(SourceKind::Github, "https://github.com/anthropics/skills", None, None)
        );
        assert_eq!(
            resolve("gh:anthropics/skills@v1.2/skills/pdf").unwrap(),
            remote(
                SourceKind::Github,
                "https://github.com/anthropics/skills",
                Some("v1.2"),
                Some("skills/pdf")
            )
        );
        assert_eq!(
            resolve("gh:owner/repo.git/commands").unwrap(),
            remote(SourceKind::Github, "https://github.com/owner/repo", None, Some("commands"))
        );
        assert_eq!(
            resolve("gh:owner/repo@main").unwrap().reference(),
            Some("main")
        );
    }

    #[test]
    fn bare_owner_repo_is_github() {
        assert_eq!(
            resolve("owner/repo").unwrap(),
            remote(SourceKind::Github, "https://github.com/owner/repo", None, None)
        );
    }

    #[test]
    fn github_urls() {
        assert_eq!(
            resolve("https://github.com/owner/repo.git").unwrap(),
            remote(SourceKind::Github, "https://github.com/owner/repo", None, None)
        );
        assert_eq!(
            resolve("https://github.com/owner/repo/tree/dev/agents/review").unwrap(),
            remote(
                SourceKind::Github,
                "https://github.com/owner/repo",
                Some("dev"),
                Some("agents/review")
            )
        );
    }

    #[test]
    fn other_urls() {
        assert_eq!(
            resolve("https://gitlab.com/group/project.git").unwrap(),
            remote(SourceKind::Gitlab, "https://gitlab.com/group/project", None, None)
        );
        assert_eq!(
            resolve("https://git.example.com/team/prompts/").unwrap(),
            remote(SourceKind::GitUrl, "https://git.example.com/team/prompts", None, None)
        );
        assert_eq!(
            resolve("file:///srv/git/prompts.git").unwrap(),
            remote(SourceKind::GitUrl, "file:///srv/git/prompts.git", None, None)
        );
    }

    #[test]
    fn scp_like_urls_become_https() {
        assert_eq!(
            resolve("git@github.com:owner/repo.git").unwrap(),
            remote(SourceKind::Github, "https://github.com/owner/repo", None, None)
        );
        assert_eq!(
            resolve("git@git.example.com:team/prompts.git").unwrap(),
            remote(SourceKind::GitUrl, "https://git.example.com/team/prompts", None, None)
        );
        assert!(resolve("git@nohost").is_err());
    }

    #[test]
    fn local_paths() {
        assert_eq!(
            resolve("./my/../resources").unwrap(),
            SourceDescriptor::Local {
                path: PathBuf::from("resources")
            }
        );
        assert_eq!(
            resolve("local:/opt/prompts/").unwrap(),
            SourceDescriptor::Local {
                path: PathBuf::from("/opt/prompts")
            }
        );
        assert_eq!(
            resolve("../shared").unwrap(),
            SourceDescriptor::Local {
                path: PathBuf::from("../shared")
            }
        );
    }

    #[test]
    fn invalid_sources() {
        assert_eq!(resolve("  ").unwrap_err(), SourceError::Empty);
        assert_eq!(resolve("local:").unwrap_err(), SourceError::EmptyPath);
        assert!(matches!(
            resolve("gh:justowner").unwrap_err(),
            SourceError::InvalidGithub { .. }
        ));
        assert!(matches!(
            resolve("gh:owner/repo@").unwrap_err(),
            SourceError::InvalidGithub { .. }
        ));
        assert!(matches!(
            resolve("not a source").unwrap_err(),
            SourceError::Unrecognized(_)
        ));
    }

    #[test]
    fn clone_url() {
        let descriptor: SourceDescriptor = "gh:owner/repo@main/sub".parse().unwrap();
        assert_eq!(descriptor.clone_url().unwrap(), "https://github.com/owner/repo");
        let local: SourceDescriptor = "./x".parse().unwrap();
        assert!(local.clone_url().is_err());
        assert_eq!(local.kind(), SourceKind::Local);
    }

    #[test]
    fn source_kind_serde() {
        assert_eq!(
            serde_json::to_string(&SourceKind::GitUrl).unwrap(),
            "\"git-url\""
        );
        assert!(SourceKind::Gitlab.is_remote_git());
        assert!(!SourceKind::File.is_remote_git());
        assert_eq!("GITHUB".parse::<SourceKind>().unwrap(), SourceKind::Github);
    }

    #[test]
    fn derived_names() {
        assert_eq!(derive_source_name("gh:owner/repo"), "owner-repo");
        assert_eq!(derive_source_name("https://github.com/owner/repo"), "owner-repo");
        assert_eq!(derive_source_name("file:///home/me/resources"), "resources");
        assert_eq!(derive_source_name("/home/me/prompts"), "prompts");
        assert_eq!(derive_source_name("https://git.example.com/team/kit"), "kit");
        assert_eq!(derive_source_name("team/kit"), "team-kit");
        assert_eq!(derive_source_name(""), "unknown");
    }
}
