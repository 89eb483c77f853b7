//! Persistent metadata and dependency-edge index.
//!
//! The index is a cache over the canonical on-disk jobs: every query it
//! answers can be reproduced by walking the storage, and [`Index::rebuild`]
//! does exactly that. It lives in `index.sqlite` at the repository root
//! with one `jobs` table (id, timestamp, JSON metadata) and one
//! `job_dependencies` edge table. Only job-to-job edges are indexed; other
//! dependency variants can never produce `find_dependents` results.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use rusqlite::{Connection, params};

use crate::error::{Error, Result};
use crate::job::{Dependency, Job, TIMESTAMP_FORMAT};
use crate::query::Query;
use crate::storage::Storage;

/// Name of the index file under the repository root.
pub const INDEX_FILE: &str = "index.sqlite";

const SCHEMA: &str = "
CREATE TABLE jobs (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    metadata JSON NOT NULL
);
CREATE TABLE job_dependencies (
    child_id TEXT NOT NULL,
    parent_id TEXT NOT NULL,
    FOREIGN KEY (child_id) REFERENCES jobs (id),
    FOREIGN KEY (parent_id) REFERENCES jobs (id)
);
";

/// Metadata index over a storage.
#[derive(Debug)]
pub struct Index {
    storage: Storage,
    path: PathBuf,
}

impl Index {
    /// Open the index for a storage, building it from scratch if the index
    /// file does not exist yet.
    pub fn open(storage: Storage) -> Result<Self> {
        let path = storage.root().join(INDEX_FILE);
        let index = Self { storage, path };
        if !index.path.exists() {
            index.rebuild()?;
        }
        Ok(index)
    }

    fn connect(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    /// Drop the index and repopulate it from storage.
    pub fn rebuild(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| Error::io_path("removing", &self.path, e))?;
        }

        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        transaction.execute_batch(SCHEMA)?;

        for job in self.storage.jobs()? {
            let job = job?;
            insert_job(&transaction, &job)?;
        }

        transaction.commit()?;
        Ok(())
    }

    /// Number of indexed jobs.
    pub fn len(&self) -> Result<usize> {
        let connection = self.connect()?;
        let count: i64 = connection.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Whether the index holds no jobs.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Membership test by job id.
    pub fn contains_id(&self, id: &str) -> Result<bool> {
        let connection = self.connect()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM jobs WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record a freshly committed job and its outgoing edges.
    pub fn add(&self, job: &Job) -> Result<()> {
        if !self.storage.contains(job) {
            return Err(Error::Invalid(format!(
                "job is not in storage: {}",
                job.path().display()
            )));
        }

        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        insert_job(&transaction, job)?;
        transaction.commit()?;
        Ok(())
    }

    /// Refresh a job's timestamp and metadata.
    ///
    /// Dependency edges are immutable after commit and are not touched.
    pub fn update(&self, job: &Job) -> Result<()> {
        if !self.storage.contains(job) {
            return Err(Error::Invalid(format!(
                "job is not in storage: {}",
                job.path().display()
            )));
        }
        let (id, timestamp, metadata) = record_fields(job)?;

        let connection = self.connect()?;
        connection.execute(
            "UPDATE jobs SET timestamp = ?1, metadata = ?2 WHERE id = ?3",
            params![timestamp, metadata, id],
        )?;
        Ok(())
    }

    /// Drop a job and all edges touching it.
    pub fn remove(&self, job: &Job) -> Result<()> {
        let id = require_id(job)?;

        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        transaction.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        transaction.execute(
            "DELETE FROM job_dependencies WHERE child_id = ?1 OR parent_id = ?1",
            params![id],
        )?;
        transaction.commit()?;
        Ok(())
    }

    /// Fetch a job by id, carrying cached timestamp and metadata.
    pub fn get(&self, id: &str) -> Result<Job> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                "SELECT timestamp, metadata FROM jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::Index(other)),
            })?;

        let Some((timestamp, metadata)) = row else {
            return Err(Error::NotFound(format!("job: {id}")));
        };

        Ok(self
            .storage
            .get_cached(id, parse_timestamp(&timestamp)?, parse_metadata(&metadata)?))
    }

    /// Evaluate a query document over the indexed metadata.
    ///
    /// With `latest`, only the record with the maximum timestamp is
    /// returned (the empty query is allowed and matches everything).
    pub fn find(&self, query: &serde_json::Value, latest: bool) -> Result<Vec<Job>> {
        let predicate = Query::parse(query)?.to_sql()?;
        let sql = format!(
            "SELECT id, timestamp, metadata FROM jobs WHERE {predicate} ORDER BY timestamp{}",
            if latest { " DESC LIMIT 1" } else { ", id" }
        );
        log::debug!("find: {sql}");

        let connection = self.connect()?;
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, timestamp, metadata) = row?;
            jobs.push(self.storage.get_cached(
                &id,
                parse_timestamp(&timestamp)?,
                parse_metadata(&metadata)?,
            ));
        }
        Ok(jobs)
    }

    /// All jobs whose outgoing edges include this job.
    ///
    /// With `recursive`, the transitive closure; cycles terminate through
    /// the seen-set, so a self-loop yields the job itself exactly once.
    pub fn find_dependents(&self, job: &Job, recursive: bool) -> Result<Vec<Job>> {
        let id = require_id(job)?;

        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT child_id, timestamp, metadata
             FROM job_dependencies JOIN jobs ON child_id = id
             WHERE parent_id = ?1",
        )?;

        let mut dependents: HashMap<String, Job> = HashMap::new();
        let mut queue = vec![id.to_string()];
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(parent) = queue.pop() {
            if !visited.insert(parent.clone()) {
                continue;
            }

            let rows = statement.query_map(params![parent], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            for row in rows {
                let (child, timestamp, metadata) = row?;
                if recursive {
                    queue.push(child.clone());
                }
                if !dependents.contains_key(&child) {
                    let job = self.storage.get_cached(
                        &child,
                        parse_timestamp(&timestamp)?,
                        parse_metadata(&metadata)?,
                    );
                    dependents.insert(child, job);
                }
            }
        }

        Ok(dependents.into_values().collect())
    }
}

fn insert_job(connection: &Connection, job: &Job) -> Result<()> {
    let (id, timestamp, metadata) = record_fields(job)?;

    connection.execute(
        "INSERT INTO jobs (id, timestamp, metadata) VALUES (?1, ?2, ?3)",
        params![id, timestamp, metadata],
    )?;

    for dependency in job.dependencies()? {
        if let Dependency::Job(dep) = dependency {
            connection.execute(
                "INSERT INTO job_dependencies (child_id, parent_id) VALUES (?1, ?2)",
                params![id, dep.job],
            )?;
        }
    }

    Ok(())
}

fn record_fields(job: &Job) -> Result<(String, String, String)> {
    let id = require_id(job)?.to_string();
    let timestamp = job
        .timestamp()?
        .ok_or_else(|| Error::Invalid(format!("committed job {id} has no timestamp")))?
        .format(TIMESTAMP_FORMAT)
        .to_string();
    let metadata = serde_json::to_string(job.metadata()?)
        .map_err(|e| Error::Invalid(format!("metadata of job {id} is not serializable: {e}")))?;
    Ok((id, timestamp, metadata))
}

fn require_id(job: &Job) -> Result<&str> {
    job.id()
        .ok_or_else(|| Error::Invalid("job id is not set".to_string()))
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| Error::Invalid(format!("bad timestamp in index: {raw:?}: {e}")))
}

fn parse_metadata(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| Error::Invalid(format!("bad metadata in index: {e}")))
}
