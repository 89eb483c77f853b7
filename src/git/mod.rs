//! Thin adapter over the `git` executable.
//!
//! All VCS access goes through this module: probing commits and paths,
//! resolving refs, cloning and fetching the bare caches, and creating the
//! lightweight pin tags. Failures carry the failing subcommand and git's
//! stderr; unknown exit codes are never silently mapped to `false`.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

mod url;

pub use url::GitUrl;

/// Handle on a git repository directory (bare or not).
#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    /// Create a handle for the repository at the given path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The repository directory this handle operates on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the repository directory exists on disk.
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Run a git command in this repository and return its stdout.
    pub fn run(&self, args: &[&str]) -> Result<String> {
        log::debug!("git {} (in {})", args.join(" "), self.path.display());

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .map_err(|e| Error::io("invoking git", e))?;

        if !output.status.success() {
            return Err(Error::Git {
                command: args.join(" "),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Check whether a commit object exists in this repository.
    pub fn commit_exists(&self, commit: &str) -> Result<bool> {
        match self.run(&["cat-file", "-t", commit]) {
            Ok(object_type) => Ok(object_type.trim() == "commit"),
            Err(Error::Git { message, .. }) if is_missing_object(&message) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Check whether a path exists in the tree of the given commit.
    ///
    /// `.` degenerates to a commit existence check. Matching is a literal
    /// prefix match over the recursive tree listing, so a directory path
    /// matches via any file below it.
    pub fn path_exists_at(&self, commit: &str, path: &Path) -> Result<bool> {
        let path_str = path.to_string_lossy();
        if path_str == "." {
            return self.commit_exists(commit);
        }

        let listing = self.run(&["ls-tree", "-r", "--name-only", commit])?;
        Ok(listing
            .lines()
            .any(|line| line == path_str || line.starts_with(&format!("{path_str}/"))))
    }

    /// Resolve a ref to a commit sha, or `None` if the ref does not exist.
    pub fn rev_parse(&self, refname: &str) -> Result<Option<String>> {
        // --quiet makes a missing ref a silent exit 1 instead of a fatal
        // error, which is the one failure we intentionally interpret.
        match self.run(&["rev-parse", "--verify", "--quiet", refname]) {
            Ok(stdout) => {
                let sha = stdout.trim();
                Ok((!sha.is_empty()).then(|| sha.to_string()))
            }
            Err(Error::Git { message, .. }) if message.is_empty() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Commit currently at the tip of a branch.
    pub fn branch_commit(&self, branch: &str) -> Result<Option<String>> {
        self.rev_parse(&format!("refs/heads/{branch}"))
    }

    /// Commit a tag points at (peeling annotated tags).
    pub fn tag_commit(&self, tag: &str) -> Result<Option<String>> {
        self.rev_parse(&format!("refs/tags/{tag}^{{commit}}"))
    }

    /// Commit at HEAD.
    pub fn head_commit(&self) -> Result<Option<String>> {
        self.rev_parse("HEAD")
    }

    /// Force-fetch all refs from origin.
    ///
    /// Deliberately not pruning: the `r3/<job_id>` pin tags exist only
    /// locally and must survive fetches.
    pub fn fetch_all(&self) -> Result<()> {
        self.run(&["fetch", "--force", "origin", "+refs/*:refs/*"])?;
        Ok(())
    }

    /// Create a lightweight tag pointing at a commit.
    pub fn create_tag(&self, name: &str, commit: &str) -> Result<()> {
        self.run(&["tag", name, commit])?;
        Ok(())
    }
}

/// Clone a repository as a bare clone at the target path.
pub fn clone_bare(origin: &str, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io_path("creating directory", parent, e))?;
    }

    log::debug!("git clone --bare {origin} {}", target.display());

    let output = Command::new("git")
        .arg("clone")
        .arg("--bare")
        .arg(origin)
        .arg(target)
        .output()
        .map_err(|e| Error::io("invoking git", e))?;

    if !output.status.success() {
        return Err(Error::Git {
            command: format!("clone --bare {origin}"),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Clone a repository (with a working tree) at the target path.
///
/// Only used by the full-clone fallback for ancient git installations.
pub fn clone(origin: &str, target: &Path) -> Result<()> {
    log::debug!("git clone {origin} {}", target.display());

    let output = Command::new("git")
        .arg("clone")
        .arg(origin)
        .arg(target)
        .output()
        .map_err(|e| Error::io("invoking git", e))?;

    if !output.status.success() {
        return Err(Error::Git {
            command: format!("clone {origin}"),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Installed git version as (major, minor).
pub fn version() -> Result<(u32, u32)> {
    let output = Command::new("git")
        .arg("version")
        .output()
        .map_err(|e| Error::io("invoking git", e))?;

    if !output.status.success() {
        return Err(Error::Git {
            command: "version".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_version(&String::from_utf8_lossy(&output.stdout))
}

/// Whether the installed git supports `fetch --depth` against a local
/// transport (added in git 2.5).
pub fn supports_shallow_fetch() -> Result<bool> {
    Ok(version()? >= (2, 5))
}

fn parse_version(output: &str) -> Result<(u32, u32)> {
    // "git version 2.39.2" or "git version 2.39.2.windows.1"
    let rest = output
        .trim()
        .strip_prefix("git version ")
        .ok_or_else(|| Error::Invalid(format!("unexpected git version output: {output:?}")))?;

    let mut parts = rest.split('.');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());

    match (major, minor) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => Err(Error::Invalid(format!(
            "unexpected git version output: {output:?}"
        ))),
    }
}

fn is_missing_object(stderr: &str) -> bool {
    stderr.contains("Not a valid object name")
        || stderr.contains("could not get object info")
        || stderr.contains("bad file")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_plain() {
        assert_eq!(parse_version("git version 2.39.2\n").unwrap(), (2, 39));
    }

    #[test]
    fn parse_version_with_platform_suffix() {
        assert_eq!(
            parse_version("git version 2.45.1.windows.1\n").unwrap(),
            (2, 45)
        );
    }

    #[test]
    fn parse_version_two_components() {
        assert_eq!(parse_version("git version 2.5").unwrap(), (2, 5));
    }

    #[test]
    fn parse_version_garbage_is_invalid() {
        assert!(matches!(
            parse_version("not git at all"),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn version_ordering_for_shallow_support() {
        assert!((2, 5) >= (2, 5));
        assert!((2, 39) >= (2, 5));
        assert!((1, 9) < (2, 5));
        assert!((2, 4) < (2, 5));
    }
}
