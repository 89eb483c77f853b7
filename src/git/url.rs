//! Git remote URL recognition.
//!
//! Maps a remote URL to the canonical location of its bare clone inside the
//! repository (`git/<host>/<user>/<repo>`). The recognizer is pure: it
//! never touches the filesystem or the network.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Parsed git remote URL with host, user, and repository components.
///
/// # Supported URL formats
///
/// - `https://<host>/<user>/<repo>(.git)?`
/// - `git@<host>:<user>/<repo>(.git)?`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitUrl {
    host: String,
    user: String,
    repo: String,
}

impl GitUrl {
    /// Parse a git remote URL into structured components.
    ///
    /// Unrecognized URLs are `Invalid` errors: the derived cache path is
    /// part of the dependency hash, so silently accepting an unknown shape
    /// would corrupt the format.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();

        let (host, user, repo_with_suffix) = if let Some(rest) = url.strip_prefix("https://") {
            // https://github.com/user/repo.git
            let mut parts = rest.split('/');
            let host = parts.next().unwrap_or_default();
            let user = parts.next().unwrap_or_default();
            let repo = parts.next().unwrap_or_default();
            if parts.next().is_some() {
                return Err(unrecognized(url));
            }
            (host, user, repo)
        } else if let Some(rest) = url.strip_prefix("git@") {
            // git@github.com:user/repo.git
            let Some((host, path)) = rest.split_once(':') else {
                return Err(unrecognized(url));
            };
            let mut parts = path.split('/');
            let user = parts.next().unwrap_or_default();
            let repo = parts.next().unwrap_or_default();
            if parts.next().is_some() {
                return Err(unrecognized(url));
            }
            (host, user, repo)
        } else {
            return Err(unrecognized(url));
        };

        let repo = repo_with_suffix
            .strip_suffix(".git")
            .unwrap_or(repo_with_suffix);

        if host.is_empty() || user.is_empty() || repo.is_empty() {
            return Err(unrecognized(url));
        }

        Ok(Self {
            host: host.to_string(),
            user: user.to_string(),
            repo: repo.to_string(),
        })
    }

    /// The hostname (e.g., "github.com").
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The repository owner or organization.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The repository name without the `.git` suffix.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Bare-clone location relative to the repository root.
    pub fn repository_path(&self) -> PathBuf {
        PathBuf::from("git")
            .join(&self.host)
            .join(&self.user)
            .join(&self.repo)
    }
}

fn unrecognized(url: &str) -> Error {
    Error::Invalid(format!("unrecognized git url: {url}"))
}
