//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use r3::job::Job;
use r3::repository::Repository;

/// A scratch repository plus a scratch area for job directories, removed on
/// drop.
pub struct TestEnv {
    dir: TempDir,
    pub repository: Repository,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("creating temp directory");
        let repository =
            Repository::init(dir.path().join("repository")).expect("initializing repository");
        Self { dir, repository }
    }

    /// Root of the repository under test.
    pub fn root(&self) -> &Path {
        self.repository.root()
    }

    /// Scratch path outside the repository.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Create a job directory with the given files (paths relative to the
    /// job root) and return the uncommitted job.
    pub fn job(&self, name: &str, files: &[(&str, &str)]) -> Job {
        let dir = self.dir.path().join("jobs-src").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (file, contents) in files {
            let path = dir.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        Job::from_dir(&dir).expect("opening job directory")
    }

    /// Like [`TestEnv::job`], with a `metadata.yaml` carrying the given tags.
    pub fn tagged_job(&self, name: &str, tags: &[&str]) -> Job {
        let tag_lines: String = tags.iter().map(|tag| format!("- {tag}\n")).collect();
        self.job(
            name,
            &[
                ("run.py", "print(1)\n"),
                ("metadata.yaml", &format!("tags:\n{tag_lines}")),
            ],
        )
    }
}

/// Run git in a directory, panicking on failure. Test-fixture plumbing only.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("running git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Create a local origin repository with one commit on `main`; returns the
/// commit sha.
pub fn create_origin(path: &Path, file: &str, contents: &str) -> String {
    std::fs::create_dir_all(path).unwrap();
    git(path, &["init", "--quiet", "-b", "main"]);
    std::fs::write(path.join(file), contents).unwrap();
    git(path, &["add", "."]);
    git(path, &["commit", "--quiet", "-m", "initial"]);
    git(path, &["rev-parse", "HEAD"]).trim().to_string()
}

/// Add a commit to an origin repository; returns the new sha.
pub fn add_commit(path: &Path, file: &str, contents: &str) -> String {
    std::fs::write(path.join(file), contents).unwrap();
    git(path, &["add", "."]);
    git(path, &["commit", "--quiet", "-m", "update"]);
    git(path, &["rev-parse", "HEAD"]).trim().to_string()
}

/// Seed the repository's VCS cache with a bare clone of a local origin, at
/// the cache path the given remote URL maps to.
pub fn seed_bare_cache(repo_root: &Path, origin: &Path, cache_subpath: &str) -> PathBuf {
    let cache = repo_root.join("git").join(cache_subpath);
    std::fs::create_dir_all(cache.parent().unwrap()).unwrap();
    let output = Command::new("git")
        .arg("clone")
        .arg("--quiet")
        .arg("--bare")
        .arg(origin)
        .arg(&cache)
        .output()
        .expect("running git clone");
    assert!(
        output.status.success(),
        "bare clone failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    cache
}
