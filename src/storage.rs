//! Immutable, id-addressed job storage.
//!
//! The storage layer owns the committed-jobs directory (`jobs/`) and the
//! VCS cache (`git/`). Committing copies a fully resolved job into
//! `jobs/<id>` and strips write permissions from everything except the
//! metadata document; the permission bits are the immutability mechanism,
//! not a security boundary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use chrono::{Timelike, Utc};

use crate::error::{Error, Result};
use crate::git::{self, GitRepo};
use crate::job::{CONFIG_FILE, Dependency, GitDependency, Job, METADATA_FILE, OUTPUT_DIR};

/// Storage rooted at a repository directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open the storage at an existing repository root.
    ///
    /// The root is canonicalized so that symlinks created on checkout are
    /// absolute and containment checks are stable under relative paths.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            return Err(Error::NotFound(format!(
                "no such directory: {}",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(Error::Invalid(format!(
                "not a directory: {}",
                root.display()
            )));
        }
        let root = root
            .canonicalize()
            .map_err(|e| Error::io_path("resolving", &root, e))?;
        Ok(Self { root })
    }

    /// Create the storage directories under a fresh repository root.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["jobs", "git"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| Error::io_path("creating directory", &dir, e))?;
        }
        Self::open(root)
    }

    /// The repository root this storage operates on.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    /// Directory of the bare clone backing a git dependency.
    pub fn git_cache_path(&self, dependency: &GitDependency) -> Result<PathBuf> {
        Ok(self.root.join(dependency.repository_path()?))
    }

    /// Membership test by job id.
    pub fn contains_id(&self, id: &str) -> bool {
        self.jobs_dir().join(id).is_dir()
    }

    /// Membership test by path equality against the jobs root.
    pub fn contains(&self, job: &Job) -> bool {
        let Ok(path) = job.path().canonicalize() else {
            return false;
        };
        let Ok(jobs_dir) = self.jobs_dir().canonicalize() else {
            return false;
        };
        path.parent() == Some(jobs_dir.as_path())
    }

    /// Construct the job bound to a stored directory.
    pub fn get(&self, id: &str) -> Result<Job> {
        if !self.contains_id(id) {
            return Err(Error::NotFound(format!("job: {id}")));
        }
        Ok(Job::committed(
            self.jobs_dir().join(id),
            id.to_string(),
            None,
            None,
        ))
    }

    /// Like [`Storage::get`], but carrying cached index data to avoid
    /// filesystem reads.
    pub(crate) fn get_cached(
        &self,
        id: &str,
        timestamp: chrono::NaiveDateTime,
        metadata: serde_json::Value,
    ) -> Job {
        Job::committed(
            self.jobs_dir().join(id),
            id.to_string(),
            Some(timestamp),
            Some(metadata),
        )
    }

    /// Lazy enumeration of all committed jobs.
    pub fn jobs(&self) -> Result<impl Iterator<Item = Result<Job>> + use<>> {
        let jobs_dir = self.jobs_dir();
        let entries = fs::read_dir(&jobs_dir)
            .map_err(|e| Error::io_path("reading directory", &jobs_dir, e))?;

        Ok(entries.filter_map(move |entry| match entry {
            Ok(entry) => {
                let path = entry.path();
                if !path.is_dir() {
                    return None;
                }
                let id = entry.file_name().to_string_lossy().into_owned();
                Some(Ok(Job::committed(path, id, None, None)))
            }
            Err(e) => Some(Err(Error::io_path("reading directory", &jobs_dir, e))),
        }))
    }

    /// Commit a fully resolved job into the storage.
    ///
    /// Assigns a fresh id, stamps timestamp and hash table into the config,
    /// pins referenced git commits with `r3/<id>` tags, and copies the
    /// source tree write-protected. Returns the committed job.
    pub fn add(&self, job: &Job) -> Result<Job> {
        if !job.is_resolved()? {
            return Err(Error::Unresolved(
                "only resolved jobs can be committed".to_string(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let job_path = self.jobs_dir().join(&id);
        if job_path.exists() {
            // Ids are UUIDv4; a collision means something is deeply wrong.
            return Err(Error::AlreadyExists(format!("job directory: {id}")));
        }

        let timestamp = Utc::now()
            .naive_utc()
            .with_nanosecond(0)
            .expect("zero nanoseconds is valid");
        let stamped = job.stamped(timestamp)?;

        // Pin referenced commits before anything hits the jobs directory.
        // The tags keep the commits alive across `git gc` and origin
        // force-pushes; they are not rolled back if a later step fails.
        for dependency in stamped.dependencies()? {
            if let Dependency::Git(git_dependency) = dependency {
                self.pin_commit(git_dependency, &id)?;
            }
        }

        let result = self.write_job_directory(&stamped, &job_path);
        if let Err(err) = result {
            best_effort_remove(&job_path);
            return Err(err);
        }

        let metadata = stamped.metadata()?.clone();
        Ok(Job::committed(job_path, id, Some(timestamp), Some(metadata)))
    }

    fn pin_commit(&self, dependency: &GitDependency, job_id: &str) -> Result<()> {
        let commit = dependency.commit.as_deref().ok_or_else(|| {
            Error::Unresolved(format!(
                "git dependency on {} has no commit",
                dependency.repository
            ))
        })?;

        let cache = GitRepo::at(self.git_cache_path(dependency)?);
        if !cache.exists() {
            return Err(Error::NotFound(format!(
                "bare clone for {}",
                dependency.repository
            )));
        }
        cache.create_tag(&format!("r3/{job_id}"), commit)
    }

    fn write_job_directory(&self, job: &Job, job_path: &Path) -> Result<()> {
        fs::create_dir(job_path).map_err(|e| Error::io_path("creating", job_path, e))?;
        let output_dir = job_path.join(OUTPUT_DIR);
        fs::create_dir(&output_dir).map_err(|e| Error::io_path("creating", &output_dir, e))?;

        // Config first, synced before anything else becomes visible.
        let config_path = job_path.join(CONFIG_FILE);
        let config_text = serde_yaml::to_string(job.config()?)?;
        write_synced(&config_path, config_text.as_bytes())?;
        remove_write_permissions(&config_path)?;

        // The metadata document stays writable.
        let metadata_path = job_path.join(METADATA_FILE);
        let metadata_text = serde_yaml::to_string(job.metadata()?)?;
        fs::write(&metadata_path, metadata_text)
            .map_err(|e| Error::io_path("writing", &metadata_path, e))?;

        for (destination, source) in job.files()? {
            let name = destination.to_string_lossy();
            if name == CONFIG_FILE || name == METADATA_FILE {
                continue;
            }

            let target = job_path.join(destination);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io_path("creating directory", parent, e))?;
            }
            fs::copy(source, &target).map_err(|e| Error::io_path("copying to", &target, e))?;
            remove_write_permissions(&target)?;
        }

        // The directory itself loses its write bit last, so partial
        // failures leave a tree the cleanup path can still delete.
        remove_write_permissions(job_path)
    }

    /// Delete a committed job from disk.
    ///
    /// The caller (the repository facade) is responsible for checking that
    /// no other job depends on this one.
    pub fn remove(&self, job: &Job) -> Result<()> {
        if !self.contains(job) {
            return Err(Error::NotFound(format!(
                "job: {}",
                job.id().unwrap_or("<uncommitted>")
            )));
        }

        restore_write_permissions(job.path())?;
        fs::remove_dir_all(job.path())
            .map_err(|e| Error::io_path("removing", job.path(), e))?;
        Ok(())
    }

    /// Materialize a committed job at the given path.
    ///
    /// Source files are copied, `output/` is symlinked back into the
    /// repository, and every dependency is checked out into the same path
    /// at its declared destination.
    pub fn checkout_job(&self, job: &Job, path: &Path) -> Result<()> {
        if !self.contains(job) {
            return Err(Error::NotFound(format!(
                "job: {}",
                job.id().unwrap_or("<uncommitted>")
            )));
        }

        if path.exists() {
            return Err(Error::AlreadyExists(format!("{}", path.display())));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io_path("creating directory", parent, e))?;
        }
        fs::create_dir(path).map_err(|e| Error::io_path("creating", path, e))?;

        for entry in
            fs::read_dir(job.path()).map_err(|e| Error::io_path("reading", job.path(), e))?
        {
            let entry = entry.map_err(|e| Error::io_path("reading", job.path(), e))?;
            let name = entry.file_name();
            if name == CONFIG_FILE || name == METADATA_FILE || name == OUTPUT_DIR {
                continue;
            }

            let target = path.join(&name);
            if entry.path().is_dir() {
                copy_tree(&entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), &target)
                    .map_err(|e| Error::io_path("copying to", &target, e))?;
            }
        }

        let output_link = path.join(OUTPUT_DIR);
        symlink(job.path().join(OUTPUT_DIR), &output_link)
            .map_err(|e| Error::io_path("linking", &output_link, e))?;

        for dependency in job.dependencies()? {
            self.checkout_dependency(dependency, path)?;
        }

        Ok(())
    }

    /// Materialize a resolved dependency under the given checkout path.
    pub fn checkout_dependency(&self, dependency: &Dependency, path: &Path) -> Result<()> {
        match dependency {
            Dependency::Job(dep) => {
                let destination = path.join(&dep.destination);
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| Error::io_path("creating directory", parent, e))?;
                }

                let whole_job = dep.source == Path::new(".");
                if whole_job && dep.recursive_checkout {
                    let job = self.get(&dep.job)?;
                    self.checkout_job(&job, &destination)
                } else {
                    let mut target = self.jobs_dir().join(&dep.job);
                    if !whole_job {
                        target = target.join(&dep.source);
                    }
                    symlink(target, &destination)
                        .map_err(|e| Error::io_path("linking", &destination, e))?;
                    Ok(())
                }
            }
            Dependency::Git(dep) => self.checkout_git_dependency(dep, path),
            Dependency::FindLatest(_)
            | Dependency::FindAll(_)
            | Dependency::Query(_)
            | Dependency::QueryAll(_) => Err(Error::Unresolved(format!(
                "cannot checkout deferred dependency for {}",
                dependency.destination().display()
            ))),
        }
    }

    fn checkout_git_dependency(&self, dependency: &GitDependency, path: &Path) -> Result<()> {
        let commit = dependency.commit.as_deref().ok_or_else(|| {
            Error::Unresolved(format!(
                "git dependency on {} has no commit",
                dependency.repository
            ))
        })?;

        let cache = self.git_cache_path(dependency)?;
        if !cache.is_dir() {
            return Err(Error::NotFound(format!(
                "bare clone for {}",
                dependency.repository
            )));
        }

        let destination = path.join(&dependency.destination);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io_path("creating directory", parent, e))?;
        }

        // Stage the commit in a temporary directory; the directory is
        // cleaned up on every exit path.
        let staging = tempfile::tempdir().map_err(|e| Error::io("creating temp directory", e))?;
        let cache_str = cache.to_string_lossy();

        if git::supports_shallow_fetch()? {
            let repo = GitRepo::at(staging.path());
            repo.run(&["init", "--quiet"])?;
            repo.run(&["remote", "add", "origin", &cache_str])?;
            repo.run(&["fetch", "--quiet", "--depth", "1", "origin", commit])?;
            repo.run(&["checkout", "--quiet", commit])?;
        } else {
            log::warn!("installed git predates shallow fetch; falling back to a full clone");
            git::clone(&cache_str, staging.path())?;
            GitRepo::at(staging.path()).run(&["checkout", "--quiet", commit])?;
        }

        let staged = if dependency.source == Path::new(".") {
            staging.path().to_path_buf()
        } else {
            staging.path().join(&dependency.source)
        };
        if !staged.exists() {
            return Err(Error::NotFound(format!(
                "{} at {}@{}",
                dependency.source.display(),
                dependency.repository,
                commit
            )));
        }

        move_tree(&staged, &destination)
    }
}

fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut file = fs::File::create(path).map_err(|e| Error::io_path("creating", path, e))?;
    file.write_all(contents)
        .map_err(|e| Error::io_path("writing", path, e))?;
    file.sync_all()
        .map_err(|e| Error::io_path("syncing", path, e))?;
    Ok(())
}

/// Strip the write bit for user, group, and other; read/execute bits are
/// left unchanged.
fn remove_write_permissions(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path).map_err(|e| Error::io_path("inspecting", path, e))?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() & !0o222);
    fs::set_permissions(path, permissions)
        .map_err(|e| Error::io_path("changing permissions of", path, e))
}

fn add_write_permission(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path).map_err(|e| Error::io_path("inspecting", path, e))?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o200);
    fs::set_permissions(path, permissions)
        .map_err(|e| Error::io_path("changing permissions of", path, e))
}

/// Restore write permissions on a tree, directories before their contents
/// so the traversal itself is permitted.
fn restore_write_permissions(path: &Path) -> Result<()> {
    add_write_permission(path)?;
    if path.is_dir() && !path.is_symlink() {
        for entry in fs::read_dir(path).map_err(|e| Error::io_path("reading", path, e))? {
            let entry = entry.map_err(|e| Error::io_path("reading", path, e))?;
            restore_write_permissions(&entry.path())?;
        }
    }
    Ok(())
}

fn best_effort_remove(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(err) = restore_write_permissions(path) {
        log::warn!("cleanup of partial job directory failed: {err}");
        return;
    }
    if let Err(err) = fs::remove_dir_all(path) {
        log::warn!("cleanup of partial job directory failed: {err}");
    }
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target).map_err(|e| Error::io_path("creating directory", target, e))?;
    for entry in fs::read_dir(source).map_err(|e| Error::io_path("reading", source, e))? {
        let entry = entry.map_err(|e| Error::io_path("reading", source, e))?;
        let entry_target = target.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &entry_target)?;
        } else {
            fs::copy(entry.path(), &entry_target)
                .map_err(|e| Error::io_path("copying to", &entry_target, e))?;
        }
    }
    Ok(())
}

fn move_tree(source: &Path, target: &Path) -> Result<()> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        // Rename fails across filesystems; fall back to copying.
        Err(_) => {
            if source.is_dir() {
                copy_tree(source, target)?;
                fs::remove_dir_all(source)
                    .map_err(|e| Error::io_path("removing", source, e))?;
            } else {
                fs::copy(source, target).map_err(|e| Error::io_path("copying to", target, e))?;
                fs::remove_file(source).map_err(|e| Error::io_path("removing", source, e))?;
            }
            Ok(())
        }
    }
}
