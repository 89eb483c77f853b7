//! Jobs and their dependencies.
//!
//! A [`Job`] is a directory of source files plus a config document
//! (`r3.yaml`) declaring dependencies, and a free-form metadata document
//! (`metadata.yaml`). Uncommitted jobs live wherever the user keeps them;
//! committed jobs live under the repository's `jobs/` directory, named by
//! their id.
//!
//! [`Dependency`] is a sum type discriminated by which keys are present in
//! the on-disk config: `job`, `repository`, `find`, `find_all`, or the
//! legacy `query` / `query_all` hash-tag forms. Only resolved dependencies
//! (a concrete job id, or a git dependency pinned to a commit) can be
//! hashed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value as YamlValue};

use crate::error::{Error, Result};
use crate::git::GitUrl;
use crate::hash::{hash_file, hash_str};
use crate::walk::find_files;

/// Name of the job config document.
pub const CONFIG_FILE: &str = "r3.yaml";

/// Name of the user-editable metadata document.
pub const METADATA_FILE: &str = "metadata.yaml";

/// Name of the output directory inside a committed job.
pub const OUTPUT_DIR: &str = "output";

/// Timestamp format used in config documents and the index. Lexicographic
/// order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Canonical on-disk projection of a job's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Ordered dependency list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    /// Absolute-style ignore patterns; only consulted pre-commit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,

    /// Commit time, set by the storage layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Merkle hash table (`path -> sha256`, plus the `"."` job hash entry),
    /// set by the storage layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<IndexMap<String, String>>,
}

/// A job that may or may not be part of a repository.
#[derive(Debug, Clone)]
pub struct Job {
    path: PathBuf,
    id: Option<String>,
    config: OnceCell<JobConfig>,
    metadata: OnceCell<JsonValue>,
    files: OnceCell<Vec<(PathBuf, PathBuf)>>,
    cached_timestamp: Option<NaiveDateTime>,
}

impl Job {
    /// Open an uncommitted job from its source directory.
    pub fn from_dir(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(Error::NotFound(format!(
                "no such job directory: {}",
                path.display()
            )));
        }
        let path = std::path::absolute(&path).map_err(|e| Error::io_path("resolving", &path, e))?;

        Ok(Self {
            path,
            id: None,
            config: OnceCell::new(),
            metadata: OnceCell::new(),
            files: OnceCell::new(),
            cached_timestamp: None,
        })
    }

    /// Construct a committed job bound to its stored directory.
    ///
    /// `cached_timestamp` and `cached_metadata` come from the index and
    /// avoid filesystem reads when present.
    pub(crate) fn committed(
        path: PathBuf,
        id: String,
        cached_timestamp: Option<NaiveDateTime>,
        cached_metadata: Option<JsonValue>,
    ) -> Self {
        let metadata = OnceCell::new();
        if let Some(cached) = cached_metadata {
            let _ = metadata.set(cached);
        }

        Self {
            path,
            id: Some(id),
            config: OnceCell::new(),
            metadata,
            files: OnceCell::new(),
            cached_timestamp,
        }
    }

    /// The job's root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Job id, assigned on commit.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The job's configuration, loaded lazily from `r3.yaml`.
    pub fn config(&self) -> Result<&JobConfig> {
        self.config.get_or_try_init(|| {
            let config_path = self.path.join(CONFIG_FILE);
            if !config_path.is_file() {
                return Ok(JobConfig::default());
            }
            let contents = std::fs::read_to_string(&config_path)
                .map_err(|e| Error::io_path("reading", &config_path, e))?;
            Ok(serde_yaml::from_str(&contents)?)
        })
    }

    /// Dependencies of this job, in config order.
    pub fn dependencies(&self) -> Result<&[Dependency]> {
        Ok(&self.config()?.dependencies)
    }

    /// Whether every dependency names a concrete target.
    pub fn is_resolved(&self) -> Result<bool> {
        Ok(self
            .dependencies()?
            .iter()
            .all(|dependency| dependency.is_resolved()))
    }

    /// Job metadata, loaded lazily from `metadata.yaml`.
    ///
    /// Changes made via [`Job::metadata_mut`] are only written back by
    /// [`Job::save_metadata`].
    pub fn metadata(&self) -> Result<&JsonValue> {
        self.metadata.get_or_try_init(|| {
            let metadata_path = self.path.join(METADATA_FILE);
            if !metadata_path.is_file() {
                return Ok(JsonValue::Object(serde_json::Map::new()));
            }
            let contents = std::fs::read_to_string(&metadata_path)
                .map_err(|e| Error::io_path("reading", &metadata_path, e))?;
            let yaml: YamlValue = serde_yaml::from_str(&contents)?;
            if yaml.is_null() {
                return Ok(JsonValue::Object(serde_json::Map::new()));
            }
            yaml_to_json(&yaml)
        })
    }

    /// Mutable access to the metadata document.
    pub fn metadata_mut(&mut self) -> Result<&mut JsonValue> {
        self.metadata()?;
        Ok(self
            .metadata
            .get_mut()
            .expect("metadata was just initialized"))
    }

    /// Write the metadata document back to `metadata.yaml`.
    pub fn save_metadata(&self) -> Result<()> {
        let metadata = self.metadata()?;
        let metadata_path = self.path.join(METADATA_FILE);
        let contents = serde_yaml::to_string(metadata)?;
        std::fs::write(&metadata_path, contents)
            .map_err(|e| Error::io_path("writing", &metadata_path, e))?;
        Ok(())
    }

    /// Commit time, if the job has been committed.
    pub fn timestamp(&self) -> Result<Option<NaiveDateTime>> {
        if let Some(cached) = self.cached_timestamp {
            return Ok(Some(cached));
        }

        match &self.config()?.timestamp {
            Some(raw) => {
                let parsed = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
                    .map_err(|e| Error::Invalid(format!("bad timestamp {raw:?}: {e}")))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// Source files of this job as `(relative path, absolute path)` pairs,
    /// in stable sorted order.
    ///
    /// Honors the config's ignore patterns and skips each dependency's
    /// destination, so a previously checked-out dependency tree is never
    /// treated as source.
    pub fn files(&self) -> Result<&[(PathBuf, PathBuf)]> {
        self.files
            .get_or_try_init(|| {
                let config = self.config()?;
                let mut ignore = config.ignore.clone();
                for dependency in &config.dependencies {
                    ignore.push(format!("/{}", dependency.destination().display()));
                }

                Ok(find_files(&self.path, &ignore)?
                    .into_iter()
                    .map(|relative| {
                        let absolute = self.path.join(&relative);
                        (relative, absolute)
                    })
                    .collect())
            })
            .map(Vec::as_slice)
    }

    /// The job hash.
    ///
    /// For committed jobs this is the recorded `"."` entry of the hash
    /// table; otherwise the Merkle digest is computed from disk.
    pub fn hash(&self) -> Result<String> {
        if let Some(hashes) = &self.config()?.hashes
            && let Some(recorded) = hashes.get(".")
        {
            return Ok(recorded.clone());
        }
        Ok(self.compute_hashes()?.job_hash)
    }

    /// Recompute the Merkle hash table from file contents and resolved
    /// dependencies.
    ///
    /// The hash depends only on file contents, resolved dependency
    /// identities, and destination paths. Metadata, timestamps, ignore
    /// patterns, and provenance queries do not contribute.
    pub fn compute_hashes(&self) -> Result<JobHashes> {
        let mut hashes = BTreeMap::new();

        for (destination, source) in self.files()? {
            let name = destination.to_string_lossy();
            if name == CONFIG_FILE || name == METADATA_FILE {
                continue;
            }
            hashes.insert(name.into_owned(), hash_file(source)?);
        }

        for dependency in self.dependencies()? {
            hashes.insert(
                dependency.destination().to_string_lossy().into_owned(),
                dependency.hash()?,
            );
        }

        let mut index = String::new();
        for (destination, hash) in &hashes {
            index.push_str(destination);
            index.push(' ');
            index.push_str(hash);
            index.push('\n');
        }
        let job_hash = hash_str(&index);

        let mut table: IndexMap<String, String> = hashes.into_iter().collect();
        table.insert(".".to_string(), job_hash.clone());

        Ok(JobHashes { table, job_hash })
    }

    /// A copy of this job with its dependency list (and config projection)
    /// replaced by resolved dependencies.
    pub(crate) fn with_dependencies(&self, dependencies: Vec<Dependency>) -> Result<Job> {
        let mut config = self.config()?.clone();
        config.dependencies = dependencies;

        let seeded = OnceCell::new();
        let _ = seeded.set(config);

        Ok(Job {
            path: self.path.clone(),
            id: self.id.clone(),
            config: seeded,
            metadata: self.metadata.clone(),
            // Dependency destinations feed the ignore list, so the file
            // listing must be recomputed.
            files: OnceCell::new(),
            cached_timestamp: self.cached_timestamp,
        })
    }

    /// A copy of this job with timestamp and hash table stamped into the
    /// config, ready to be written to storage.
    pub(crate) fn stamped(&self, timestamp: NaiveDateTime) -> Result<Job> {
        let mut config = self.config()?.clone();
        config.timestamp = Some(timestamp.format(TIMESTAMP_FORMAT).to_string());
        config.hashes = Some(self.compute_hashes()?.table);

        let seeded = OnceCell::new();
        let _ = seeded.set(config);

        Ok(Job {
            path: self.path.clone(),
            id: self.id.clone(),
            config: seeded,
            metadata: self.metadata.clone(),
            files: self.files.clone(),
            cached_timestamp: Some(timestamp),
        })
    }
}

/// Result of a Merkle hash computation.
pub struct JobHashes {
    /// `path -> sha256` for every hashed entry, plus `"."` mapping to the
    /// job hash, sorted by path.
    pub table: IndexMap<String, String>,
    /// The job hash (the `"."` entry).
    pub job_hash: String,
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// A typed reference from a job to another artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Dependency {
    /// Symlink into a committed job. Resolved.
    Job(JobDependency),
    /// Pinned snapshot of an external git repository. Resolved iff a commit
    /// is set.
    Git(GitDependency),
    /// Deferred: resolves to the single latest job matching a query.
    FindLatest(FindLatestDependency),
    /// Deferred: resolves to one job dependency per query match.
    FindAll(FindAllDependency),
    /// Deferred, deprecated hash-tag form of [`Dependency::FindLatest`].
    Query(QueryDependency),
    /// Deferred, deprecated hash-tag form of [`Dependency::FindAll`].
    QueryAll(QueryAllDependency),
}

/// Dependency on a committed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDependency {
    /// Target job id.
    pub job: String,
    /// Path inside the target job; `.` is the whole job.
    pub source: PathBuf,
    /// Path relative to the depending job's root.
    pub destination: PathBuf,
    /// Query that produced this dependency, if it came from a find.
    pub query: Option<JsonValue>,
    /// Query that produced this dependency, if it came from a find-all.
    pub query_all: Option<JsonValue>,
    /// Materialize a full checkout instead of a symlink.
    pub recursive_checkout: bool,
}

impl JobDependency {
    pub fn new(job: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            job: job.into(),
            source: PathBuf::from("."),
            destination: destination.into(),
            query: None,
            query_all: None,
            recursive_checkout: false,
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = source.into();
        self
    }

    /// Dependency hash; independent of destination and provenance.
    pub fn hash(&self) -> String {
        hash_str(&format!("jobs/{}/{}", self.job, self.source.display()))
    }
}

/// Dependency on a commit of an external git repository.
#[derive(Debug, Clone, PartialEq)]
pub struct GitDependency {
    /// Remote URL as given in the config.
    pub repository: String,
    /// Pinned commit; `None` until resolved.
    pub commit: Option<String>,
    /// Branch to resolve the commit from.
    pub branch: Option<String>,
    /// Tag to resolve the commit from. Mutually exclusive with `branch`.
    pub tag: Option<String>,
    /// Path inside the repository; `.` is the whole tree.
    pub source: PathBuf,
    /// Path relative to the depending job's root.
    pub destination: PathBuf,
}

impl GitDependency {
    pub fn new(repository: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            commit: None,
            branch: None,
            tag: None,
            source: PathBuf::from("."),
            destination: destination.into(),
        }
    }

    pub fn at_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    /// Canonical location of the bare clone, relative to the repository
    /// root.
    pub fn repository_path(&self) -> Result<PathBuf> {
        Ok(GitUrl::parse(&self.repository)?.repository_path())
    }

    /// Dependency hash; requires the commit to be resolved.
    pub fn hash(&self) -> Result<String> {
        let commit = self.commit.as_deref().ok_or_else(|| {
            Error::Unresolved(format!(
                "git dependency on {} has no commit",
                self.repository
            ))
        })?;
        Ok(hash_str(&format!(
            "{}@{}/{}",
            self.repository_path()?.display(),
            commit,
            self.source.display()
        )))
    }
}

/// Deferred dependency on the latest job matching a document query.
#[derive(Debug, Clone, PartialEq)]
pub struct FindLatestDependency {
    pub query: JsonValue,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub recursive_checkout: bool,
}

impl FindLatestDependency {
    pub fn new(query: JsonValue, destination: impl Into<PathBuf>) -> Self {
        Self {
            query,
            source: PathBuf::from("."),
            destination: destination.into(),
            recursive_checkout: false,
        }
    }
}

/// Deferred dependency on every job matching a document query.
#[derive(Debug, Clone, PartialEq)]
pub struct FindAllDependency {
    pub query: JsonValue,
    pub destination: PathBuf,
}

impl FindAllDependency {
    pub fn new(query: JsonValue, destination: impl Into<PathBuf>) -> Self {
        Self {
            query,
            destination: destination.into(),
        }
    }
}

/// Deprecated hash-tag query (`"#tag1 #tag2"`), kept for old configs.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDependency {
    pub query: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Deprecated hash-tag query resolving to all matches.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAllDependency {
    pub query_all: String,
    pub destination: PathBuf,
}

impl Dependency {
    /// Path relative to the depending job where this dependency is checked
    /// out.
    pub fn destination(&self) -> &Path {
        match self {
            Dependency::Job(dep) => &dep.destination,
            Dependency::Git(dep) => &dep.destination,
            Dependency::FindLatest(dep) => &dep.destination,
            Dependency::FindAll(dep) => &dep.destination,
            Dependency::Query(dep) => &dep.destination,
            Dependency::QueryAll(dep) => &dep.destination,
        }
    }

    /// Path inside the referenced item; `.` is the whole item.
    pub fn source(&self) -> &Path {
        match self {
            Dependency::Job(dep) => &dep.source,
            Dependency::Git(dep) => &dep.source,
            Dependency::FindLatest(dep) => &dep.source,
            Dependency::Query(dep) => &dep.source,
            Dependency::FindAll(_) | Dependency::QueryAll(_) => Path::new("."),
        }
    }

    /// Whether this dependency names a concrete target.
    pub fn is_resolved(&self) -> bool {
        match self {
            Dependency::Job(_) => true,
            Dependency::Git(dep) => dep.commit.is_some(),
            Dependency::FindLatest(_)
            | Dependency::FindAll(_)
            | Dependency::Query(_)
            | Dependency::QueryAll(_) => false,
        }
    }

    /// Dependency hash. Only resolved dependencies can be hashed.
    pub fn hash(&self) -> Result<String> {
        match self {
            Dependency::Job(dep) => Ok(dep.hash()),
            Dependency::Git(dep) => dep.hash(),
            Dependency::FindLatest(_)
            | Dependency::FindAll(_)
            | Dependency::Query(_)
            | Dependency::QueryAll(_) => Err(Error::Unresolved(format!(
                "cannot hash deferred dependency for {}",
                self.destination().display()
            ))),
        }
    }

    /// Parse a dependency from its config mapping.
    ///
    /// The variant is discriminated by which keys are present; unknown keys
    /// are rejected.
    pub fn from_config(value: &YamlValue) -> Result<Dependency> {
        let Some(mapping) = value.as_mapping() else {
            return Err(Error::Invalid(format!(
                "dependency must be a mapping: {value:?}"
            )));
        };

        if mapping.contains_key("job") {
            Self::job_from_config(mapping)
        } else if mapping.contains_key("repository") {
            Self::git_from_config(mapping)
        } else if mapping.contains_key("find") {
            Self::find_latest_from_config(mapping)
        } else if mapping.contains_key("find_all") {
            Self::find_all_from_config(mapping)
        } else if mapping.contains_key("query") {
            Self::query_from_config(mapping)
        } else if mapping.contains_key("query_all") {
            Self::query_all_from_config(mapping)
        } else {
            Err(Error::Invalid(format!(
                "invalid dependency config: {value:?}"
            )))
        }
    }

    fn job_from_config(mapping: &Mapping) -> Result<Dependency> {
        ensure_known_keys(
            mapping,
            &[
                "job",
                "source",
                "destination",
                "query",
                "query_all",
                "recursive_checkout",
            ],
        )?;
        Ok(Dependency::Job(JobDependency {
            job: require_str(mapping, "job")?,
            source: optional_path(mapping, "source")?.unwrap_or_else(|| PathBuf::from(".")),
            destination: require_path(mapping, "destination")?,
            query: optional_document(mapping, "query")?,
            query_all: optional_document(mapping, "query_all")?,
            recursive_checkout: optional_bool(mapping, "recursive_checkout")?.unwrap_or(false),
        }))
    }

    fn git_from_config(mapping: &Mapping) -> Result<Dependency> {
        ensure_known_keys(
            mapping,
            &[
                "repository",
                "commit",
                "branch",
                "tag",
                "source",
                "destination",
            ],
        )?;
        let dependency = GitDependency {
            repository: require_str(mapping, "repository")?,
            commit: optional_str(mapping, "commit")?,
            branch: optional_str(mapping, "branch")?,
            tag: optional_str(mapping, "tag")?,
            source: optional_path(mapping, "source")?.unwrap_or_else(|| PathBuf::from(".")),
            destination: require_path(mapping, "destination")?,
        };
        if dependency.branch.is_some() && dependency.tag.is_some() {
            return Err(Error::Invalid(format!(
                "git dependency on {} sets both branch and tag",
                dependency.repository
            )));
        }
        Ok(Dependency::Git(dependency))
    }

    fn find_latest_from_config(mapping: &Mapping) -> Result<Dependency> {
        ensure_known_keys(
            mapping,
            &["find", "source", "destination", "recursive_checkout"],
        )?;
        Ok(Dependency::FindLatest(FindLatestDependency {
            query: require_document(mapping, "find")?,
            source: optional_path(mapping, "source")?.unwrap_or_else(|| PathBuf::from(".")),
            destination: require_path(mapping, "destination")?,
            recursive_checkout: optional_bool(mapping, "recursive_checkout")?.unwrap_or(false),
        }))
    }

    fn find_all_from_config(mapping: &Mapping) -> Result<Dependency> {
        ensure_known_keys(mapping, &["find_all", "destination"])?;
        Ok(Dependency::FindAll(FindAllDependency {
            query: require_document(mapping, "find_all")?,
            destination: require_path(mapping, "destination")?,
        }))
    }

    fn query_from_config(mapping: &Mapping) -> Result<Dependency> {
        ensure_known_keys(mapping, &["query", "source", "destination"])?;
        Ok(Dependency::Query(QueryDependency {
            query: require_str(mapping, "query")?,
            source: optional_path(mapping, "source")?.unwrap_or_else(|| PathBuf::from(".")),
            destination: require_path(mapping, "destination")?,
        }))
    }

    fn query_all_from_config(mapping: &Mapping) -> Result<Dependency> {
        ensure_known_keys(mapping, &["query_all", "destination"])?;
        Ok(Dependency::QueryAll(QueryAllDependency {
            query_all: require_str(mapping, "query_all")?,
            destination: require_path(mapping, "destination")?,
        }))
    }

    /// Canonical config mapping for this dependency.
    pub fn to_config(&self) -> Mapping {
        let mut mapping = Mapping::new();
        match self {
            Dependency::Job(dep) => {
                insert_str(&mut mapping, "job", &dep.job);
                insert_path(&mut mapping, "source", &dep.source);
                insert_path(&mut mapping, "destination", &dep.destination);
                if let Some(query) = &dep.query {
                    insert_document(&mut mapping, "query", query);
                }
                if let Some(query_all) = &dep.query_all {
                    insert_document(&mut mapping, "query_all", query_all);
                }
                if dep.recursive_checkout {
                    mapping.insert("recursive_checkout".into(), YamlValue::Bool(true));
                }
            }
            Dependency::Git(dep) => {
                insert_str(&mut mapping, "repository", &dep.repository);
                if let Some(commit) = &dep.commit {
                    insert_str(&mut mapping, "commit", commit);
                }
                if let Some(branch) = &dep.branch {
                    insert_str(&mut mapping, "branch", branch);
                }
                if let Some(tag) = &dep.tag {
                    insert_str(&mut mapping, "tag", tag);
                }
                insert_path(&mut mapping, "source", &dep.source);
                insert_path(&mut mapping, "destination", &dep.destination);
            }
            Dependency::FindLatest(dep) => {
                insert_document(&mut mapping, "find", &dep.query);
                insert_path(&mut mapping, "source", &dep.source);
                insert_path(&mut mapping, "destination", &dep.destination);
                if dep.recursive_checkout {
                    mapping.insert("recursive_checkout".into(), YamlValue::Bool(true));
                }
            }
            Dependency::FindAll(dep) => {
                insert_document(&mut mapping, "find_all", &dep.query);
                insert_path(&mut mapping, "destination", &dep.destination);
            }
            Dependency::Query(dep) => {
                insert_str(&mut mapping, "query", &dep.query);
                insert_path(&mut mapping, "source", &dep.source);
                insert_path(&mut mapping, "destination", &dep.destination);
            }
            Dependency::QueryAll(dep) => {
                insert_str(&mut mapping, "query_all", &dep.query_all);
                insert_path(&mut mapping, "destination", &dep.destination);
            }
        }
        mapping
    }
}

impl Serialize for Dependency {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_config().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Dependency {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = YamlValue::deserialize(deserializer)?;
        Dependency::from_config(&value).map_err(serde::de::Error::custom)
    }
}

// Config mapping helpers. serde_yaml mappings are stringly keyed; these
// centralize the type checks and error texts.

fn ensure_known_keys(mapping: &Mapping, allowed: &[&str]) -> Result<()> {
    for key in mapping.keys() {
        let Some(name) = key.as_str() else {
            return Err(Error::Invalid(format!(
                "dependency config key must be a string: {key:?}"
            )));
        };
        if !allowed.contains(&name) {
            return Err(Error::Invalid(format!(
                "unknown dependency config key: {name}"
            )));
        }
    }
    Ok(())
}

fn optional_str(mapping: &Mapping, key: &str) -> Result<Option<String>> {
    match mapping.get(key) {
        None | Some(YamlValue::Null) => Ok(None),
        Some(YamlValue::String(text)) => Ok(Some(text.clone())),
        Some(other) => Err(Error::Invalid(format!(
            "dependency config key {key} must be a string, got: {other:?}"
        ))),
    }
}

fn require_str(mapping: &Mapping, key: &str) -> Result<String> {
    optional_str(mapping, key)?
        .ok_or_else(|| Error::Invalid(format!("dependency config is missing key: {key}")))
}

fn optional_path(mapping: &Mapping, key: &str) -> Result<Option<PathBuf>> {
    Ok(optional_str(mapping, key)?.map(PathBuf::from))
}

fn require_path(mapping: &Mapping, key: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(require_str(mapping, key)?))
}

fn optional_bool(mapping: &Mapping, key: &str) -> Result<Option<bool>> {
    match mapping.get(key) {
        None | Some(YamlValue::Null) => Ok(None),
        Some(YamlValue::Bool(flag)) => Ok(Some(*flag)),
        Some(other) => Err(Error::Invalid(format!(
            "dependency config key {key} must be a boolean, got: {other:?}"
        ))),
    }
}

fn optional_document(mapping: &Mapping, key: &str) -> Result<Option<JsonValue>> {
    match mapping.get(key) {
        None | Some(YamlValue::Null) => Ok(None),
        Some(value) => Ok(Some(yaml_to_json(value)?)),
    }
}

fn require_document(mapping: &Mapping, key: &str) -> Result<JsonValue> {
    optional_document(mapping, key)?
        .ok_or_else(|| Error::Invalid(format!("dependency config is missing key: {key}")))
}

fn insert_str(mapping: &mut Mapping, key: &str, value: &str) {
    mapping.insert(key.into(), YamlValue::String(value.to_string()));
}

fn insert_path(mapping: &mut Mapping, key: &str, value: &Path) {
    insert_str(mapping, key, &value.to_string_lossy());
}

fn insert_document(mapping: &mut Mapping, key: &str, value: &JsonValue) {
    let yaml = serde_yaml::to_value(value).expect("JSON value converts to YAML");
    mapping.insert(key.into(), yaml);
}

/// Convert a YAML document into the JSON value model used by queries and
/// the index.
pub(crate) fn yaml_to_json(value: &YamlValue) -> Result<JsonValue> {
    serde_json::to_value(value)
        .map_err(|e| Error::Invalid(format!("document is not JSON-compatible: {e}")))
}
