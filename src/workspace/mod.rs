//! Content-addressed cache of remote checkouts.
//!
//! Each canonical URL maps to exactly one directory, `<root>/<sha256(normalize(url))>`,
//! whatever ref is requested; switching refs happens by checkout inside that
//! directory. All mutation of an entry runs under a per-key lock, an in-process
//! mutex plus an advisory lock file, so concurrent callers queue instead of
//! racing in the same working tree.

mod index;

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use dashmap::DashMap;
use log::{debug, info, trace, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    flock::{self, FileLock},
    git::{Git, GitError},
};

pub use index::{CacheIndex, IndexEntry, IndexError, INDEX_FILE_NAME};

use index::Touch;

pub const WORKSPACE_DIR: &str = ".workspace";

const LOCKS_DIR: &str = ".locks";
const INDEX_LOCK_FILE_NAME: &str = ".cache-metadata.lock";

/// What `get_or_clone` does with an entry whose `.git` marker is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionPolicy {
    /// Remove the directory and clone again.
    #[default]
    Repair,
    /// Report `CacheError::Corrupt` and leave the directory alone.
    Fail,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache location {} is not a directory", location.display())]
    BadLocation { location: PathBuf },
    #[error("Repository URL cannot be empty")]
    EmptyUrl,
    #[error("Failed to fetch {url}:\n{output}")]
    RemoteFetch { url: String, output: String },
    #[error("Cache entry {} for {url} is corrupt: {reason}", path.display())]
    Corrupt {
        url: String,
        path: PathBuf,
        reason: String,
    },
    #[error("{url} is not cached")]
    NotCached { url: String },
    #[error("Failed to check out {reference} for {url}:\n{output}")]
    Checkout {
        url: String,
        reference: String,
        output: String,
    },
    #[error("Git error: {0}")]
    Git(#[from] GitError),
    #[error("Cache lock cannot be acquired: {0}")]
    Lock(#[from] flock::Error),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl CacheError {
    /// Network side failures a caller may retry; everything else needs local repair.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::RemoteFetch { .. })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum EntryState {
    Absent,
    Invalid(String),
    Valid,
}

pub struct WorkspaceCache {
    root: PathBuf,
    git: Git,
    corruption: CorruptionPolicy,
    lock_timeout: Duration,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    index_lock: Mutex<()>,
}

impl WorkspaceCache {
    /// Opens the cache rooted at `root`. The directory is created lazily.
    pub fn new(root: PathBuf, git: Git) -> Result<WorkspaceCache, CacheError> {
        if root.exists() && !root.is_dir() {
            return Err(CacheError::BadLocation { location: root });
        }
        Ok(WorkspaceCache {
            root,
            git,
            corruption: CorruptionPolicy::default(),
            lock_timeout: flock::DEFAULT_TIMEOUT,
            key_locks: DashMap::new(),
            index_lock: Mutex::new(()),
        })
    }

    pub fn with_corruption_policy(mut self, policy: CorruptionPolicy) -> Self {
        self.corruption = policy;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn location(&self) -> &Path {
        &self.root
    }

    /// Directory an URL is (or would be) checked out into.
    pub fn entry_path(&self, url: &str) -> PathBuf {
        self.root.join(cache_key(url))
    }

    /// Returns the checkout for `url`, cloning it first if needed.
    ///
    /// A valid entry is returned without contacting the remote; call
    /// [`WorkspaceCache::update`] to refresh it. When `reference` differs from
    /// the ref recorded for the entry it is checked out locally.
    pub fn get_or_clone(&self, url: &str, reference: Option<&str>) -> Result<PathBuf, CacheError> {
        let url = checked_url(url)?;
        let key = cache_key(url);
        let path = self.root.join(&key);
        std::fs::create_dir_all(&self.root)?;

        self.with_key_lock(&key, || {
            match entry_state(&path) {
                EntryState::Valid => {
                    match reference {
                        Some(reference) => {
                            let recorded = self.recorded_ref(&key);
                            if recorded.as_deref() != Some(reference) {
                                debug!("Switching {} to {}", url, reference);
                                self.checkout(url, &path, reference)?;
                            }
                        }
                        None => self.checkout_default(url, &path)?,
                    }
                    trace!("Cache hit for {} at {}", url, path.display());
                    self.touch_index(&key, url, &path, reference, Touch::Access);
                    return Ok(path.clone());
                }
                EntryState::Invalid(reason) => self.recover(url, &path, reason)?,
                EntryState::Absent => {}
            }

            self.clone_into(url, &path, reference)?;
            self.touch_index(&key, url, &path, reference, Touch::Update);
            Ok(path.clone())
        })
    }

    /// Refreshes an existing checkout in place: fetch, check out `reference`
    /// (the remote's default branch when `None`) and fast-forward when a
    /// branch is checked out. Never clones.
    pub fn update(&self, url: &str, reference: Option<&str>) -> Result<(), CacheError> {
        let url = checked_url(url)?;
        let key = cache_key(url);
        let path = self.root.join(&key);

        self.with_key_lock(&key, || {
            match entry_state(&path) {
                EntryState::Valid => {}
                EntryState::Absent => {
                    return Err(CacheError::NotCached {
                        url: url.to_owned(),
                    })
                }
                EntryState::Invalid(reason) => {
                    return Err(CacheError::Corrupt {
                        url: url.to_owned(),
                        path: path.clone(),
                        reason,
                    })
                }
            }

            info!("Updating cached repository {}", url);
            self.git
                .fetch_all(&path)
                .map_err(|error| remote_error(url, error))?;
            match reference {
                Some(reference) => self.checkout(url, &path, reference)?,
                None => self.checkout_default(url, &path)?,
            }
            if let Some(branch) = self.git.current_branch(&path)? {
                if self.git.has_remote_branch(&path, &branch) {
                    self.git.fast_forward(&path, &branch)?;
                }
            }

            self.touch_index(&key, url, &path, reference, Touch::Update);
            Ok(())
        })
    }

    /// URLs currently materialized in the cache.
    ///
    /// Index records whose directory vanished are dropped, and hash named
    /// directories missing from the index are registered from their remote URL.
    pub fn list_cached(&self) -> Result<Vec<String>, CacheError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut urls = self.with_index(|index| {
            index
                .caches
                .retain(|key, _| self.root.join(key).is_dir());

            for entry in std::fs::read_dir(&self.root)? {
                let entry = entry?;
                let key = entry.file_name().to_string_lossy().into_owned();
                if !is_cache_key(&key) || index.caches.contains_key(&key) {
                    continue;
                }
                let path = entry.path();
                if entry_state(&path) != EntryState::Valid {
                    continue;
                }
                match self.git.remote_url(&path) {
                    Ok(url) if cache_key(&url) == key => {
                        debug!("Registering unindexed cache entry {} for {}", key, url);
                        index.touch(&key, &url, "", Touch::Access);
                    }
                    Ok(url) => warn!(
                        "Cache entry {} has remote {} which does not match its key, ignoring",
                        path.display(),
                        url
                    ),
                    Err(error) => warn!(
                        "Cannot read the remote of cache entry {}: {}",
                        path.display(),
                        error
                    ),
                }
            }

            Ok(index
                .caches
                .values()
                .map(|entry| entry.url.clone())
                .collect::<Vec<_>>())
        })?;
        urls.sort();
        Ok(urls)
    }

    /// Cached URLs that are not in `live` after normalization.
    pub fn unreferenced<S: AsRef<str>>(&self, live: &[S]) -> Result<Vec<String>, CacheError> {
        let live: HashSet<String> = live.iter().map(|url| normalize_url(url.as_ref())).collect();
        Ok(self
            .list_cached()?
            .into_iter()
            .filter(|url| !live.contains(&normalize_url(url)))
            .collect())
    }

    /// Mark and sweep: removes every cached URL not present in `live` and
    /// returns the removed URLs. The caller computes `live`; the cache itself
    /// has no notion of what references an entry.
    pub fn prune<S: AsRef<str>>(&self, live: &[S]) -> Result<Vec<String>, CacheError> {
        let mut removed = Vec::new();
        for url in self.unreferenced(live)? {
            if self.remove(&url)? {
                info!("Pruned cached repository {}", url);
                removed.push(url);
            }
        }
        Ok(removed)
    }

    /// Deletes the entry for `url`. Returns `false` when nothing was cached.
    pub fn remove(&self, url: &str) -> Result<bool, CacheError> {
        let url = checked_url(url)?;
        let key = cache_key(url);
        let path = self.root.join(&key);

        let removed = self.with_key_lock(&key, || match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        })?;
        self.with_index(|index| {
            index.caches.remove(&key);
            Ok(())
        })?;
        Ok(removed)
    }

    fn clone_into(&self, url: &str, path: &Path, reference: Option<&str>) -> Result<(), CacheError> {
        info!("Cloning {} into {}", url, path.display());
        if let Err(error) = self.git.clone_repo(url, path) {
            if let Err(cleanup) = std::fs::remove_dir_all(path) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Failed to remove partial clone {}: {}",
                        path.display(),
                        cleanup
                    );
                }
            }
            return Err(remote_error(url, error));
        }
        if let Some(reference) = reference {
            self.checkout(url, path, reference)?;
        }
        Ok(())
    }

    fn checkout(&self, url: &str, path: &Path, reference: &str) -> Result<(), CacheError> {
        self.git
            .checkout(path, reference)
            .map_err(|error| match error {
                GitError::Failed { output, .. } => CacheError::Checkout {
                    url: url.to_owned(),
                    reference: reference.to_owned(),
                    output,
                },
                other => other.into(),
            })
    }

    /// Returns a checkout left on another ref to the remote's default branch.
    fn checkout_default(&self, url: &str, path: &Path) -> Result<(), CacheError> {
        let Some(branch) = self.git.default_branch(path)? else {
            return Ok(());
        };
        if self.git.current_branch(path)?.as_deref() != Some(branch.as_str()) {
            debug!("Switching {} back to its default branch {}", url, branch);
            self.checkout(url, path, &branch)?;
        }
        Ok(())
    }

    fn recover(&self, url: &str, path: &Path, reason: String) -> Result<(), CacheError> {
        match self.corruption {
            CorruptionPolicy::Fail => Err(CacheError::Corrupt {
                url: url.to_owned(),
                path: path.to_path_buf(),
                reason,
            }),
            CorruptionPolicy::Repair => {
                warn!(
                    "Cache entry {} for {} is corrupt ({}), cloning again",
                    path.display(),
                    url,
                    reason
                );
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(path)
                } else {
                    std::fs::remove_file(path)
                };
                result.map_err(|error| CacheError::Corrupt {
                    url: url.to_owned(),
                    path: path.to_path_buf(),
                    reason: format!("{reason}; removing it failed: {error}"),
                })
            }
        }
    }

    fn recorded_ref(&self, key: &str) -> Option<String> {
        let index = CacheIndex::load(&self.root.join(INDEX_FILE_NAME)).ok()?;
        index
            .caches
            .get(key)
            .map(|entry| entry.r#ref.clone())
            .filter(|reference| !reference.is_empty())
    }

    /// The checkout is usable even when the index cannot be written, and
    /// `list_cached` re-registers unindexed entries, so failures only warn.
    fn touch_index(
        &self,
        key: &str,
        url: &str,
        path: &Path,
        reference: Option<&str>,
        touch: Touch,
    ) {
        let reference = match reference {
            Some(reference) => reference.to_owned(),
            None => self
                .git
                .current_branch(path)
                .ok()
                .flatten()
                .unwrap_or_default(),
        };
        let result = self.with_index(|index| {
            index.touch(key, url, &reference, touch);
            Ok(())
        });
        if let Err(error) = result {
            warn!("Failed to update cache index: {}", error);
        }
    }

    fn with_key_lock<T>(
        &self,
        key: &str,
        f: impl FnOnce() -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mutex = self
            .key_locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        let lock_path = self.root.join(LOCKS_DIR).join(format!("{key}.lock"));
        debug!("Acquiring cache lock {}", lock_path.display());
        let _lock = FileLock::with_timeout(&lock_path, self.lock_timeout)?;
        f()
    }

    fn with_index<T>(
        &self,
        f: impl FnOnce(&mut CacheIndex) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let _guard = self
            .index_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::fs::create_dir_all(&self.root)?;
        let _lock =
            FileLock::with_timeout(&self.root.join(INDEX_LOCK_FILE_NAME), self.lock_timeout)?;
        let path = self.root.join(INDEX_FILE_NAME);
        let mut index = match CacheIndex::load(&path) {
            Ok(index) => index,
            Err(error @ (IndexError::Json(_) | IndexError::UnsupportedVersion(_))) => {
                warn!("Discarding unreadable cache index: {}", error);
                CacheIndex::default()
            }
            Err(error) => return Err(error.into()),
        };
        let result = f(&mut index)?;
        index.save(&path)?;
        Ok(result)
    }
}

/// Lower-cases, trims whitespace and strips trailing `/` and `.git`, so that
/// spelling variants of one repository share a cache entry.
pub fn normalize_url(url: &str) -> String {
    let normalized = url.trim().to_lowercase();
    let normalized = normalized.trim_end_matches('/');
    normalized
        .strip_suffix(".git")
        .unwrap_or(normalized)
        .to_owned()
}

/// Hex encoded SHA-256 of the normalized URL.
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(normalize_url(url).as_bytes()))
}

fn is_cache_key(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn checked_url(url: &str) -> Result<&str, CacheError> {
    let url = url.trim();
    if url.is_empty() {
        Err(CacheError::EmptyUrl)
    } else {
        Ok(url)
    }
}

fn entry_state(path: &Path) -> EntryState {
    if !path.exists() && path.symlink_metadata().is_err() {
        return EntryState::Absent;
    }
    if !path.is_dir() {
        return EntryState::Invalid("not a directory".to_owned());
    }
    if !path.join(".git").is_dir() {
        return EntryState::Invalid("missing .git".to_owned());
    }
    EntryState::Valid
}

fn remote_error(url: &str, error: GitError) -> CacheError {
    match error {
        GitError::Failed { output, .. } => CacheError::RemoteFetch {
            url: url.to_owned(),
            output,
        },
        other => CacheError::Git(other),
    }
}
