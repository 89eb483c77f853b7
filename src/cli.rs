//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "r3", version, about = "Repository of reproducible research")]
pub struct Cli {
    /// Enable debug logging (same as RUST_LOG=debug)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a new repository
    Init {
        /// Path of the repository to create
        path: PathBuf,
    },

    /// Commit a job directory to the repository
    Commit {
        /// Path of the job directory
        job: PathBuf,

        /// Repository path
        #[arg(long, env = "R3_REPOSITORY")]
        repository: PathBuf,
    },

    /// Check out a committed job to a working directory
    Checkout {
        /// Id of the job to check out
        id: String,

        /// Target path (must not exist)
        path: PathBuf,

        /// Repository path
        #[arg(long, env = "R3_REPOSITORY")]
        repository: PathBuf,
    },

    /// Remove a committed job
    Remove {
        /// Id of the job to remove
        id: String,

        /// Repository path
        #[arg(long, env = "R3_REPOSITORY")]
        repository: PathBuf,
    },

    /// Search committed jobs by metadata tags
    Find {
        /// Require a tag (may be given multiple times)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Only print the most recently committed match
        #[arg(long)]
        latest: bool,

        /// Print timestamps and tags along with the ids
        #[arg(long)]
        long: bool,

        /// Repository path
        #[arg(long, env = "R3_REPOSITORY")]
        repository: PathBuf,
    },

    /// Rebuild the metadata index from the stored jobs
    RebuildIndex {
        /// Repository path
        #[arg(long, env = "R3_REPOSITORY")]
        repository: PathBuf,
    },

    /// Edit a committed job's metadata in $EDITOR
    Edit {
        /// Id of the job to edit
        id: String,

        /// Repository path
        #[arg(long, env = "R3_REPOSITORY")]
        repository: PathBuf,
    },
}
