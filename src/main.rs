use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use serde_json::json;

use r3::job::{Job, METADATA_FILE, TIMESTAMP_FORMAT};
use r3::repository::Repository;

mod cli;

use cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "warn" }),
    )
    .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Init { path } => {
            Repository::init(&path)?;
            println!("Initialized empty repository in {}", path.display());
            Ok(())
        }

        Command::Commit { job, repository } => {
            let repository = Repository::open(&repository)?;
            let job = Job::from_dir(&job)?;
            let committed = repository.commit(&job)?;
            println!("{}", committed.path().display());
            Ok(())
        }

        Command::Checkout {
            id,
            path,
            repository,
        } => {
            let repository = Repository::open(&repository)?;
            let job = repository.job(&id)?;
            repository.checkout_job(&job, &path)?;
            Ok(())
        }

        Command::Remove { id, repository } => {
            let repository = Repository::open(&repository)?;
            let job = repository.job(&id)?;
            repository.remove(&job)?;
            Ok(())
        }

        Command::Find {
            tags,
            latest,
            long,
            repository,
        } => {
            let repository = Repository::open(&repository)?;
            let query = if tags.is_empty() {
                json!({})
            } else {
                json!({"tags": {"$all": tags}})
            };

            for job in repository.find(&query, latest)? {
                print_job(&job, long)?;
            }
            Ok(())
        }

        Command::RebuildIndex { repository } => {
            let repository = Repository::open(&repository)?;
            repository.rebuild_index()?;
            Ok(())
        }

        Command::Edit { id, repository } => {
            let repository = Repository::open(&repository)?;
            let job = repository.job(&id)?;
            edit_file(&job.path().join(METADATA_FILE))?;
            repository.refresh_metadata(&id)?;
            Ok(())
        }
    }
}

fn print_job(job: &Job, long: bool) -> anyhow::Result<()> {
    let id = job.id().context("job without id in find results")?;
    if !long {
        println!("{id}");
        return Ok(());
    }

    let timestamp = job
        .timestamp()?
        .map(|timestamp| timestamp.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string());

    let tags = job
        .metadata()?
        .get("tags")
        .and_then(|tags| tags.as_array())
        .map(|tags| {
            tags.iter()
                .filter_map(|tag| tag.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    println!("{id}  {timestamp}  {tags}");
    Ok(())
}

fn edit_file(path: &Path) -> anyhow::Result<()> {
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = std::process::Command::new(&editor)
        .arg(path)
        .status()
        .with_context(|| format!("failed to launch editor: {editor}"))?;

    if !status.success() {
        anyhow::bail!("editor exited with {status}");
    }
    Ok(())
}
