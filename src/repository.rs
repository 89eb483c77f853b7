//! Repository facade: resolve → validate → commit / checkout / remove.
//!
//! Binds [`Storage`] and [`Index`] together with the dependency resolver.
//! Mutating operations take an advisory lock on the repository's `r3.yaml`
//! so concurrent writers cannot tear the index or race id creation;
//! readers proceed without locking.

use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::error::{Error, Result};
use crate::git::{self, GitRepo};
use crate::index::Index;
use crate::job::{
    Dependency, FindAllDependency, FindLatestDependency, GitDependency, Job, JobDependency,
    QueryAllDependency, QueryDependency,
};
use crate::storage::Storage;

/// Name of the repository config document at the root.
pub const REPOSITORY_CONFIG_FILE: &str = "r3.yaml";

/// On-disk format version written by this build.
pub const FORMAT_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
struct RepositoryConfig {
    version: String,
}

/// A repository of committed jobs.
#[derive(Debug)]
pub struct Repository {
    root: PathBuf,
    storage: Storage,
    index: Index,
}

impl Repository {
    /// Create a new repository at the given path.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        if root.exists() {
            return Err(Error::AlreadyExists(format!("{}", root.display())));
        }

        fs::create_dir_all(&root).map_err(|e| Error::io_path("creating", &root, e))?;
        let storage = Storage::init(&root)?;
        let root = storage.root().to_path_buf();

        let config = RepositoryConfig {
            version: FORMAT_VERSION.to_string(),
        };
        let config_path = root.join(REPOSITORY_CONFIG_FILE);
        fs::write(&config_path, serde_yaml::to_string(&config)?)
            .map_err(|e| Error::io_path("writing", &config_path, e))?;

        let index = Index::open(storage.clone())?;
        Ok(Self {
            root,
            storage,
            index,
        })
    }

    /// Open an existing repository, verifying the on-disk format version.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        let config_path = root.join(REPOSITORY_CONFIG_FILE);
        if !config_path.is_file() {
            return Err(Error::NotFound(format!(
                "no r3 repository at {}",
                root.display()
            )));
        }

        let contents = fs::read_to_string(&config_path)
            .map_err(|e| Error::io_path("reading", &config_path, e))?;
        let config: RepositoryConfig = serde_yaml::from_str(&contents)?;
        if config.version != FORMAT_VERSION {
            return Err(Error::Version {
                found: config.version,
                supported: FORMAT_VERSION.to_string(),
            });
        }

        let storage = Storage::open(&root)?;
        let root = storage.root().to_path_buf();
        let index = Index::open(storage.clone())?;
        Ok(Self {
            root,
            storage,
            index,
        })
    }

    /// The repository root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazy enumeration of all committed jobs.
    pub fn jobs(&self) -> Result<impl Iterator<Item = Result<Job>> + use<>> {
        self.storage.jobs()
    }

    /// Fetch a committed job by id.
    pub fn job(&self, id: &str) -> Result<Job> {
        self.index.get(id)
    }

    /// Membership test by job id.
    pub fn contains_id(&self, id: &str) -> bool {
        self.storage.contains_id(id)
    }

    /// Membership test for a job instance.
    pub fn contains_job(&self, job: &Job) -> bool {
        self.storage.contains(job)
    }

    /// Evaluate a metadata query; see [`Index::find`].
    pub fn find(&self, query: &JsonValue, latest: bool) -> Result<Vec<Job>> {
        self.index.find(query, latest)
    }

    /// All jobs depending on the given job; see [`Index::find_dependents`].
    pub fn find_dependents(&self, job: &Job, recursive: bool) -> Result<Vec<Job>> {
        self.index.find_dependents(job, recursive)
    }

    /// Rebuild the index from storage.
    pub fn rebuild_index(&self) -> Result<()> {
        let _lock = self.lock()?;
        self.index.rebuild()
    }

    /// Commit a job: resolve its dependencies, verify each one is present,
    /// copy it into storage, and record it in the index.
    pub fn commit(&self, job: &Job) -> Result<Job> {
        let _lock = self.lock()?;

        let resolved = self.resolve_job(job)?;
        for dependency in resolved.dependencies()? {
            if !self.contains_dependency(dependency)? {
                return Err(Error::NotFound(format!(
                    "dependency for {}: {}",
                    dependency.destination().display(),
                    describe(dependency)
                )));
            }
        }

        // Storage first: the index only ever references durable jobs.
        let committed = self.storage.add(&resolved)?;
        self.index.add(&committed)?;
        Ok(committed)
    }

    /// Materialize a committed job at the given path.
    pub fn checkout_job(&self, job: &Job, path: &Path) -> Result<()> {
        self.storage.checkout_job(job, path)
    }

    /// Resolve a dependency and materialize the result(s) under `path`.
    pub fn checkout_dependency(&self, dependency: &Dependency, path: &Path) -> Result<()> {
        for resolved in self.resolve_dependency(dependency)? {
            self.storage.checkout_dependency(&resolved, path)?;
        }
        Ok(())
    }

    /// Remove a committed job.
    ///
    /// Fails with a conflict while other jobs depend on it.
    pub fn remove(&self, job: &Job) -> Result<()> {
        let _lock = self.lock()?;

        let dependents = self.index.find_dependents(job, false)?;
        if !dependents.is_empty() {
            let mut ids: Vec<&str> = dependents.iter().filter_map(Job::id).collect();
            ids.sort_unstable();
            return Err(Error::Conflict(format!(
                "job {} has dependents: {}",
                job.id().unwrap_or("<uncommitted>"),
                ids.join(", ")
            )));
        }

        self.storage.remove(job)?;
        self.index.remove(job)?;
        Ok(())
    }

    /// Write a job's metadata document back to disk and refresh the index
    /// record.
    pub fn save_metadata(&self, job: &Job) -> Result<()> {
        job.save_metadata()?;
        self.index.update(job)
    }

    /// Re-read a job's metadata from disk (e.g. after an external edit) and
    /// refresh the index record.
    pub fn refresh_metadata(&self, id: &str) -> Result<Job> {
        let job = self.storage.get(id)?;
        self.index.update(&job)?;
        Ok(job)
    }

    // -- Resolver -----------------------------------------------------------

    /// Replace every deferred dependency of a job with concrete ones.
    pub fn resolve_job(&self, job: &Job) -> Result<Job> {
        if job.is_resolved()? {
            return Ok(job.clone());
        }

        let mut resolved = Vec::new();
        for dependency in job.dependencies()? {
            resolved.extend(self.resolve_dependency(dependency)?);
        }
        job.with_dependencies(resolved)
    }

    /// Resolve a single dependency.
    ///
    /// Most variants resolve to exactly one dependency; a find-all resolves
    /// to one job dependency per match, in index order.
    pub fn resolve_dependency(&self, dependency: &Dependency) -> Result<Vec<Dependency>> {
        match dependency {
            Dependency::Job(_) => Ok(vec![dependency.clone()]),
            Dependency::Git(dep) if dep.commit.is_some() => Ok(vec![dependency.clone()]),
            Dependency::Git(dep) => Ok(vec![self.resolve_git(dep)?]),
            Dependency::FindLatest(dep) => Ok(vec![self.resolve_find_latest(dep)?]),
            Dependency::FindAll(dep) => self.resolve_find_all(dep),
            Dependency::Query(dep) => Ok(vec![self.resolve_legacy_query(dep)?]),
            Dependency::QueryAll(dep) => self.resolve_legacy_query_all(dep),
        }
    }

    fn resolve_find_latest(&self, dependency: &FindLatestDependency) -> Result<Dependency> {
        let matches = self.index.find(&dependency.query, true)?;
        let Some(job) = matches.first() else {
            return Err(Error::NotFound(format!(
                "no job matches query: {}",
                dependency.query
            )));
        };
        let id = job.id().expect("indexed jobs carry ids");

        Ok(Dependency::Job(JobDependency {
            job: id.to_string(),
            source: dependency.source.clone(),
            destination: dependency.destination.clone(),
            query: Some(dependency.query.clone()),
            query_all: None,
            recursive_checkout: dependency.recursive_checkout,
        }))
    }

    fn resolve_find_all(&self, dependency: &FindAllDependency) -> Result<Vec<Dependency>> {
        let matches = self.index.find(&dependency.query, false)?;
        if matches.is_empty() {
            return Err(Error::NotFound(format!(
                "no job matches query: {}",
                dependency.query
            )));
        }

        Ok(matches
            .iter()
            .map(|job| {
                let id = job.id().expect("indexed jobs carry ids");
                Dependency::Job(JobDependency {
                    job: id.to_string(),
                    source: PathBuf::from("."),
                    destination: dependency.destination.join(id),
                    query: None,
                    query_all: Some(dependency.query.clone()),
                    recursive_checkout: false,
                })
            })
            .collect())
    }

    fn resolve_legacy_query(&self, dependency: &QueryDependency) -> Result<Dependency> {
        log::warn!(
            "hash-tag queries are deprecated, use a find document instead: {}",
            dependency.query
        );
        self.resolve_find_latest(&FindLatestDependency {
            query: parse_tag_query(&dependency.query)?,
            source: dependency.source.clone(),
            destination: dependency.destination.clone(),
            recursive_checkout: false,
        })
    }

    fn resolve_legacy_query_all(&self, dependency: &QueryAllDependency) -> Result<Vec<Dependency>> {
        log::warn!(
            "hash-tag queries are deprecated, use a find_all document instead: {}",
            dependency.query_all
        );
        self.resolve_find_all(&FindAllDependency {
            query: parse_tag_query(&dependency.query_all)?,
            destination: dependency.destination.clone(),
        })
    }

    fn resolve_git(&self, dependency: &GitDependency) -> Result<Dependency> {
        if dependency.branch.is_some() && dependency.tag.is_some() {
            return Err(Error::Invalid(format!(
                "git dependency on {} sets both branch and tag",
                dependency.repository
            )));
        }

        let cache = self.git_cache(dependency)?;
        if cache.exists() {
            // Branch heads move; resolve against the remote's current state.
            cache.fetch_all()?;
        } else {
            git::clone_bare(&dependency.repository, cache.path())?;
        }

        let commit = if let Some(branch) = &dependency.branch {
            cache.branch_commit(branch)?.ok_or_else(|| {
                Error::NotFound(format!("branch {branch} in {}", dependency.repository))
            })?
        } else if let Some(tag) = &dependency.tag {
            cache.tag_commit(tag)?.ok_or_else(|| {
                Error::NotFound(format!("tag {tag} in {}", dependency.repository))
            })?
        } else {
            cache.head_commit()?.ok_or_else(|| {
                Error::NotFound(format!("HEAD of {}", dependency.repository))
            })?
        };

        let mut resolved = dependency.clone();
        resolved.commit = Some(commit);
        Ok(Dependency::Git(resolved))
    }

    // -- Containment --------------------------------------------------------

    /// Whether a dependency's target is present in this repository.
    ///
    /// Deferred dependencies are resolved first. Git dependencies clone and
    /// fetch the bare cache on demand.
    pub fn contains_dependency(&self, dependency: &Dependency) -> Result<bool> {
        match dependency {
            Dependency::Job(dep) => {
                let mut target = self.root.join("jobs").join(&dep.job);
                if dep.source != Path::new(".") {
                    target = target.join(&dep.source);
                }
                Ok(target.exists())
            }
            Dependency::Git(dep) => {
                let Some(commit) = dep.commit.as_deref() else {
                    for resolved in self.resolve_dependency(dependency)? {
                        if !self.contains_dependency(&resolved)? {
                            return Ok(false);
                        }
                    }
                    return Ok(true);
                };

                let cache = self.git_cache(dep)?;
                if !cache.exists() {
                    git::clone_bare(&dep.repository, cache.path())?;
                }
                if !cache.commit_exists(commit)? {
                    cache.fetch_all()?;
                    if !cache.commit_exists(commit)? {
                        return Ok(false);
                    }
                }
                cache.path_exists_at(commit, &dep.source)
            }
            Dependency::FindLatest(_)
            | Dependency::FindAll(_)
            | Dependency::Query(_)
            | Dependency::QueryAll(_) => {
                for resolved in self.resolve_dependency(dependency)? {
                    if !self.contains_dependency(&resolved)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn git_cache(&self, dependency: &GitDependency) -> Result<GitRepo> {
        Ok(GitRepo::at(self.storage.git_cache_path(dependency)?))
    }

    fn lock(&self) -> Result<RepositoryLock> {
        let config_path = self.root.join(REPOSITORY_CONFIG_FILE);
        let file =
            fs::File::open(&config_path).map_err(|e| Error::io_path("opening", &config_path, e))?;
        file.lock_exclusive()
            .map_err(|e| Error::io_path("locking", &config_path, e))?;
        Ok(RepositoryLock { file })
    }
}

/// Advisory lock held for the duration of a mutating operation.
struct RepositoryLock {
    file: fs::File,
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Parse a legacy hash-tag query (`"#tag1 #tag2"`) into the equivalent
/// `{tags: {$all: [...]}}` document.
fn parse_tag_query(query: &str) -> Result<JsonValue> {
    let mut tags = Vec::new();
    for token in query.split_whitespace() {
        let tag = token.strip_prefix('#').filter(|tag| !tag.is_empty());
        let Some(tag) = tag else {
            return Err(Error::Invalid(format!(
                "hash-tag query tokens must start with '#': {token}"
            )));
        };
        tags.push(JsonValue::String(tag.to_string()));
    }
    Ok(json!({"tags": {"$all": tags}}))
}

fn describe(dependency: &Dependency) -> String {
    match dependency {
        Dependency::Job(dep) => format!("job {} ({})", dep.job, dep.source.display()),
        Dependency::Git(dep) => match &dep.commit {
            Some(commit) => format!("{}@{}", dep.repository, commit),
            None => dep.repository.clone(),
        },
        Dependency::FindLatest(dep) => format!("find {}", dep.query),
        Dependency::FindAll(dep) => format!("find_all {}", dep.query),
        Dependency::Query(dep) => format!("query {}", dep.query),
        Dependency::QueryAll(dep) => format!("query_all {}", dep.query_all),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_query_parses_into_all_document() {
        assert_eq!(
            parse_tag_query("#test #mnist").unwrap(),
            json!({"tags": {"$all": ["test", "mnist"]}})
        );
        assert_eq!(
            parse_tag_query("").unwrap(),
            json!({"tags": {"$all": []}})
        );
    }

    #[test]
    fn tag_query_rejects_untagged_tokens() {
        assert!(matches!(
            parse_tag_query("#ok missing"),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(parse_tag_query("#"), Err(Error::Invalid(_))));
    }
}
