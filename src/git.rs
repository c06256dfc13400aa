use std::{
    path::{Path, PathBuf},
    process::Command,
};

use log::trace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("git {args} failed in {dir}:\n{output}")]
    Failed {
        args: String,
        dir: PathBuf,
        output: String,
    },
}

impl GitError {
    /// Combined stdout and stderr of a failed invocation.
    pub fn output(&self) -> &str {
        match self {
            GitError::Spawn { .. } => "",
            GitError::Failed { output, .. } => output,
        }
    }
}

/// Thin wrapper over the system `git` binary.
///
/// Using the installed client means SSH agents, credential helpers and any
/// settings in `~/.gitconfig` apply without extra configuration.
#[derive(Debug, Clone)]
pub struct Git {
    program: String,
}

impl Default for Git {
    fn default() -> Self {
        Self::new("git")
    }
}

impl Git {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs `git <args>` with `dir` as the working directory and returns stdout.
    pub fn run<I, S>(&self, dir: &Path, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        trace!("Running {} {} in {}", self.program, args.join(" "), dir.display());

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|source| GitError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(GitError::Failed {
                args: args.join(" "),
                dir: dir.to_path_buf(),
                output: with_auth_hint(combined.trim_end().to_owned()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Full clone of `url` into `target`. `target` must not exist.
    pub fn clone_repo(&self, url: &str, target: &Path) -> Result<(), GitError> {
        let parent = target.parent().unwrap_or(Path::new("."));
        let target = target.to_string_lossy();
        self.run(parent, ["clone", "--quiet", url, target.as_ref()])?;
        Ok(())
    }

    pub fn fetch_all(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, ["fetch", "--all", "--prune", "--quiet"])?;
        Ok(())
    }

    pub fn checkout(&self, dir: &Path, reference: &str) -> Result<(), GitError> {
        self.run(dir, ["checkout", "--quiet", reference])?;
        Ok(())
    }

    /// Name of the checked out branch, or `None` for a detached HEAD.
    pub fn current_branch(&self, dir: &Path) -> Result<Option<String>, GitError> {
        match self.run(dir, ["symbolic-ref", "--quiet", "--short", "HEAD"]) {
            Ok(branch) => Ok(Some(branch.trim().to_owned())),
            Err(GitError::Failed { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// The branch `origin/HEAD` points at, when the clone recorded one.
    pub fn default_branch(&self, dir: &Path) -> Result<Option<String>, GitError> {
        let reference = "refs/remotes/origin/HEAD";
        match self.run(dir, ["symbolic-ref", "--quiet", "--short", reference]) {
            Ok(branch) => {
                let branch = branch.trim();
                Ok(Some(branch.strip_prefix("origin/").unwrap_or(branch).to_owned()))
            }
            Err(GitError::Failed { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub fn has_remote_branch(&self, dir: &Path, branch: &str) -> bool {
        let reference = format!("refs/remotes/origin/{branch}");
        self.run(dir, ["show-ref", "--verify", "--quiet", reference.as_str()])
            .is_ok()
    }

    pub fn fast_forward(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        let upstream = format!("origin/{branch}");
        self.run(dir, ["merge", "--ff-only", "--quiet", upstream.as_str()])?;
        Ok(())
    }

    pub fn remote_url(&self, dir: &Path) -> Result<String, GitError> {
        Ok(self
            .run(dir, ["config", "--get", "remote.origin.url"])?
            .trim()
            .to_owned())
    }

    pub fn init(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, ["init", "--quiet"])?;
        Ok(())
    }

    pub fn add_all(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, ["add", "."])?;
        Ok(())
    }

    pub fn status_porcelain(&self, dir: &Path) -> Result<String, GitError> {
        self.run(dir, ["status", "--porcelain"])
    }

    pub fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.run(dir, ["commit", "--quiet", "-m", message])?;
        Ok(())
    }
}

fn with_auth_hint(output: String) -> String {
    if output.contains("Authentication failed")
        || output.contains("Permission denied")
        || output.contains("could not read Username")
        || output.contains("Could not read from remote repository")
    {
        format!(
            "{output}\nhint: check that you have access to the repository \
            (ssh-agent key, credential helper or personal access token)"
        )
    } else {
        output
    }
}
