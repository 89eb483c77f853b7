//! Error types shared across the crate.

use std::io;
use std::path::Path;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A job, dependency target, branch, tag, or source path does not exist.
    NotFound(String),
    /// An init target or job directory exists already.
    AlreadyExists(String),
    /// Malformed dependency document, unknown query operator, bad ignore
    /// pattern, unrecognized git URL, or similar caller error.
    Invalid(String),
    /// Hashing or checkout was attempted on a deferred dependency.
    Unresolved(String),
    /// Removal of a job with dependents, or a commit with an unmet dependency.
    Conflict(String),
    /// On-disk format version differs from what this build supports.
    Version { found: String, supported: String },
    /// A git subprocess failed.
    Git { command: String, message: String },
    /// Filesystem I/O failure.
    Io { context: String, source: io::Error },
    /// Index (SQLite) failure.
    Index(rusqlite::Error),
    /// YAML (de)serialization failure.
    Config(serde_yaml::Error),
}

impl Error {
    /// Attach a human-readable context to an I/O error.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// I/O error context naming the affected path.
    pub fn io_path(action: &str, path: &Path, source: io::Error) -> Self {
        Error::Io {
            context: format!("{} {}", action, path.display()),
            source,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Error::Invalid(msg) => write!(f, "invalid: {msg}"),
            Error::Unresolved(msg) => write!(f, "unresolved dependency: {msg}"),
            Error::Conflict(msg) => write!(f, "conflict: {msg}"),
            Error::Version { found, supported } => write!(
                f,
                "repository format version {found} is not supported by this build \
                 (supports {supported}); migration required"
            ),
            Error::Git { command, message } => {
                if message.is_empty() {
                    write!(f, "git {command} failed")
                } else {
                    write!(f, "git {command} failed: {message}")
                }
            }
            Error::Io { context, source } => {
                if context.is_empty() {
                    write!(f, "{source}")
                } else {
                    write!(f, "{context}: {source}")
                }
            }
            Error::Index(source) => write!(f, "index error: {source}"),
            Error::Config(source) => write!(f, "config error: {source}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            Error::Index(source) => Some(source),
            Error::Config(source) => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io {
            context: String::new(),
            source,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(source: rusqlite::Error) -> Self {
        Error::Index(source)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(source: serde_yaml::Error) -> Self {
        Error::Config(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_error_mentions_migration() {
        let err = Error::Version {
            found: "0.9.0".to_string(),
            supported: "1.0.0".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("0.9.0"));
        assert!(message.contains("migration required"));
    }

    #[test]
    fn io_error_with_context_includes_both() {
        let err = Error::io_path(
            "reading",
            Path::new("/tmp/x"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        let message = err.to_string();
        assert!(message.contains("reading /tmp/x"));
        assert!(message.contains("gone"));
    }
}
