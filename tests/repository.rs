//! End-to-end tests for the repository facade.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::thread::sleep;
use std::time::Duration;

use serde_json::json;

use r3::error::Error;
use r3::job::{Dependency, Job};
use r3::repository::{FORMAT_VERSION, Repository};

mod common;

use common::TestEnv;

/// One second is the timestamp resolution of the on-disk format.
fn next_second() {
    sleep(Duration::from_millis(1100));
}

#[test]
fn init_fails_if_path_exists() {
    let dir = tempfile::tempdir().unwrap();
    let result = Repository::init(dir.path());
    assert!(matches!(result, Err(Error::AlreadyExists(_))));
}

#[test]
fn init_creates_layout_and_version_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repository");
    Repository::init(&root).unwrap();

    assert!(root.join("jobs").is_dir());
    assert!(root.join("git").is_dir());
    assert!(root.join("index.sqlite").is_file());

    let config = fs::read_to_string(root.join("r3.yaml")).unwrap();
    assert!(config.contains(&format!("version: {FORMAT_VERSION}")));

    // The freshly created repository opens cleanly.
    Repository::open(&root).unwrap();
}

#[test]
fn open_rejects_other_format_versions() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repository");
    Repository::init(&root).unwrap();
    fs::write(root.join("r3.yaml"), "version: 0.1.0\n").unwrap();

    let result = Repository::open(&root);
    assert!(matches!(result, Err(Error::Version { .. })));
}

#[test]
fn open_rejects_directories_without_config() {
    let dir = tempfile::tempdir().unwrap();
    let result = Repository::open(dir.path());
    assert!(matches!(result, Err(Error::NotFound(_))));
}

// Scenario 1: committing a simple job.
#[test]
fn commit_assigns_id_write_protects_and_records_hash() {
    let env = TestEnv::new();

    let job = env.job("simple", &[("run.py", "print(1)\n")]);
    let committed = env.repository.commit(&job).unwrap();

    let id = committed.id().expect("id assigned");
    assert!(env.repository.contains_id(id));
    assert!(env.repository.contains_job(&committed));

    let stored = env.root().join("jobs").join(id).join("run.py");
    let mode = fs::metadata(&stored).unwrap().permissions().mode();
    assert_eq!(mode & 0o222, 0, "run.py must be read-only");

    let config = committed.config().unwrap();
    assert_eq!(
        config.hashes.as_ref().unwrap().get("."),
        Some(&committed.compute_hashes().unwrap().job_hash)
    );
}

#[test]
fn commit_of_empty_job_succeeds_with_empty_index_hash() {
    let env = TestEnv::new();
    let job = env.job("empty", &[]);
    let committed = env.repository.commit(&job).unwrap();

    // sha256 of the empty Merkle index string.
    assert_eq!(
        committed.hash().unwrap(),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

// Scenario 2: find-latest dependencies resolve to the newest match.
#[test]
fn find_latest_dependency_resolves_to_job_dependency() {
    let env = TestEnv::new();

    let first = env.repository.commit(&env.tagged_job("first", &["test"])).unwrap();
    next_second();
    let second = env.repository.commit(&env.tagged_job("second", &["test"])).unwrap();

    let job = env.job(
        "downstream",
        &[
            ("run.py", "print(2)\n"),
            (
                "r3.yaml",
                "dependencies: [{find: {tags: {$all: [test]}}, destination: prev}]\n",
            ),
        ],
    );
    let committed = env.repository.commit(&job).unwrap();

    let dependencies = committed.dependencies().unwrap();
    assert_eq!(dependencies.len(), 1);
    let Dependency::Job(dep) = &dependencies[0] else {
        panic!("expected a resolved job dependency");
    };
    assert_eq!(dep.job, second.id().unwrap());
    assert_ne!(dep.job, first.id().unwrap());
    assert_eq!(dep.source.to_str(), Some("."));
    assert_eq!(dep.destination.to_str(), Some("prev"));
    // Provenance is recorded but does not affect the dependency hash.
    assert_eq!(dep.query, Some(json!({"tags": {"$all": ["test"]}})));
}

#[test]
fn find_all_dependency_resolves_to_one_dependency_per_match() {
    let env = TestEnv::new();

    let a = env.repository.commit(&env.tagged_job("a", &["batch"])).unwrap();
    let b = env.repository.commit(&env.tagged_job("b", &["batch"])).unwrap();

    let job = env.job(
        "collector",
        &[
            ("run.py", ""),
            (
                "r3.yaml",
                "dependencies: [{find_all: {tags: {$all: [batch]}}, destination: runs}]\n",
            ),
        ],
    );
    let committed = env.repository.commit(&job).unwrap();

    let dependencies = committed.dependencies().unwrap();
    assert_eq!(dependencies.len(), 2);

    let mut targets = Vec::new();
    for dependency in dependencies {
        let Dependency::Job(dep) = dependency else {
            panic!("expected resolved job dependencies");
        };
        // Destination is suffixed with the job id.
        assert_eq!(
            dep.destination,
            std::path::Path::new("runs").join(&dep.job)
        );
        assert_eq!(dep.query_all, Some(json!({"tags": {"$all": ["batch"]}})));
        targets.push(dep.job.clone());
    }
    targets.sort_unstable();
    let mut expected = vec![
        a.id().unwrap().to_string(),
        b.id().unwrap().to_string(),
    ];
    expected.sort_unstable();
    assert_eq!(targets, expected);
}

#[test]
fn deferred_dependency_with_no_match_is_an_error() {
    let env = TestEnv::new();

    let job = env.job(
        "orphan",
        &[
            ("run.py", ""),
            (
                "r3.yaml",
                "dependencies: [{find: {tags: {$all: [nothing]}}, destination: prev}]\n",
            ),
        ],
    );
    let result = env.repository.commit(&job);
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
fn legacy_hash_tag_query_resolves_like_find() {
    let env = TestEnv::new();

    let tagged = env.repository.commit(&env.tagged_job("tagged", &["legacy"])).unwrap();

    let job = env.job(
        "downstream",
        &[
            ("run.py", ""),
            (
                "r3.yaml",
                "dependencies: [{query: '#legacy', destination: prev}]\n",
            ),
        ],
    );
    let committed = env.repository.commit(&job).unwrap();

    let Dependency::Job(dep) = &committed.dependencies().unwrap()[0] else {
        panic!("expected a resolved job dependency");
    };
    assert_eq!(dep.job, tagged.id().unwrap());
    assert_eq!(dep.query, Some(json!({"tags": {"$all": ["legacy"]}})));
}

// Scenario 3: dependency on a missing source path inside a job.
#[test]
fn commit_fails_when_dependency_source_is_missing() {
    let env = TestEnv::new();

    let base = env.repository.commit(&env.job("base", &[("run.py", "")])).unwrap();
    let base_id = base.id().unwrap();

    let job = env.job(
        "broken",
        &[
            ("run.py", ""),
            (
                "r3.yaml",
                &format!(
                    "dependencies: [{{job: {base_id}, source: does/not/exist, destination: x}}]\n"
                ),
            ),
        ],
    );
    let result = env.repository.commit(&job);
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
fn commit_fails_when_dependency_job_is_missing() {
    let env = TestEnv::new();

    let job = env.job(
        "broken",
        &[
            ("run.py", ""),
            (
                "r3.yaml",
                "dependencies: [{job: 00000000-0000-0000-0000-000000000000, destination: x}]\n",
            ),
        ],
    );
    let result = env.repository.commit(&job);
    assert!(matches!(result, Err(Error::NotFound(_))));
}

// Scenario 4: removal order is enforced by reverse dependencies.
#[test]
fn remove_refuses_jobs_with_dependents() {
    let env = TestEnv::new();

    let base = env.repository.commit(&env.job("base", &[("run.py", "")])).unwrap();
    let base_id = base.id().unwrap();

    let dependent = env.job(
        "dependent",
        &[
            ("run.py", ""),
            (
                "r3.yaml",
                &format!("dependencies: [{{job: {base_id}, destination: prev}}]\n"),
            ),
        ],
    );
    let dependent = env.repository.commit(&dependent).unwrap();

    let result = env.repository.remove(&base);
    assert!(matches!(result, Err(Error::Conflict(_))));
    assert!(env.repository.contains_id(base_id));

    env.repository.remove(&dependent).unwrap();
    env.repository.remove(&base).unwrap();

    assert!(!env.repository.contains_id(base_id));
    assert!(env.repository.find(&json!({}), false).unwrap().is_empty());
}

// Scenario 5: combined tag and scalar query.
#[test]
fn find_filters_on_tags_and_numeric_metadata() {
    let env = TestEnv::new();

    for (name, size) in [("s28", 28), ("s32", 32), ("s64", 64)] {
        let job = env.job(
            name,
            &[
                ("run.py", ""),
                (
                    "metadata.yaml",
                    &format!("tags: [a, b]\nimage_size: {size}\n"),
                ),
            ],
        );
        env.repository.commit(&job).unwrap();
    }

    let matches = env
        .repository
        .find(&json!({"tags": {"$all": ["a"]}, "image_size": {"$gt": 28}}), false)
        .unwrap();
    assert_eq!(matches.len(), 2);
    for job in &matches {
        assert!(job.metadata().unwrap()["image_size"].as_i64().unwrap() > 28);
    }
}

#[test]
fn checkout_materializes_job_dependencies_as_symlinks() {
    let env = TestEnv::new();

    let base = env
        .repository
        .commit(&env.job("base", &[("model.bin", "weights")]))
        .unwrap();
    let base_id = base.id().unwrap();

    let job = env.job(
        "train",
        &[
            ("run.py", "print(3)\n"),
            (
                "r3.yaml",
                &format!("dependencies: [{{job: {base_id}, destination: prev}}]\n"),
            ),
        ],
    );
    let committed = env.repository.commit(&job).unwrap();

    let target = env.scratch("checkout");
    env.repository.checkout_job(&committed, &target).unwrap();

    assert!(target.join("run.py").is_file());
    let link = target.join("prev");
    assert!(link.is_symlink());
    assert_eq!(
        fs::read_link(&link).unwrap(),
        env.root().join("jobs").join(base_id)
    );
    // The link resolves into the committed base job.
    assert_eq!(
        fs::read_to_string(link.join("model.bin")).unwrap(),
        "weights"
    );
}

#[test]
fn checkout_with_recursive_flag_copies_the_dependency() {
    let env = TestEnv::new();

    let base = env
        .repository
        .commit(&env.job("base", &[("model.bin", "weights")]))
        .unwrap();
    let base_id = base.id().unwrap();

    let job = env.job(
        "train",
        &[
            ("run.py", ""),
            (
                "r3.yaml",
                &format!(
                    "dependencies: [{{job: {base_id}, destination: prev, \
                     recursive_checkout: true}}]\n"
                ),
            ),
        ],
    );
    let committed = env.repository.commit(&job).unwrap();

    let target = env.scratch("checkout");
    env.repository.checkout_job(&committed, &target).unwrap();

    let prev = target.join("prev");
    assert!(!prev.is_symlink(), "recursive checkout copies the job");
    assert_eq!(fs::read_to_string(prev.join("model.bin")).unwrap(), "weights");
    assert!(prev.join("output").is_symlink());
}

// Round-trip law: commit → checkout → hash of the checked-out tree.
#[test]
fn checked_out_tree_hashes_to_the_original_job_hash() {
    let env = TestEnv::new();

    let job = env.job(
        "roundtrip",
        &[("run.py", "print(1)\n"), ("data/input.txt", "12345\n")],
    );
    let committed = env.repository.commit(&job).unwrap();

    let target = env.scratch("checkout");
    env.repository.checkout_job(&committed, &target).unwrap();

    // The output symlink is not part of the source tree.
    fs::remove_file(target.join("output")).unwrap();

    let checked_out = Job::from_dir(&target).unwrap();
    assert_eq!(checked_out.hash().unwrap(), committed.hash().unwrap());
}

#[test]
fn save_metadata_updates_disk_and_index() {
    let env = TestEnv::new();

    let mut committed = env.repository.commit(&env.tagged_job("a", &["before"])).unwrap();
    *committed.metadata_mut().unwrap() = json!({"tags": ["after"]});
    env.repository.save_metadata(&committed).unwrap();

    // Metadata is mutable on disk even though the job is write-protected.
    let reloaded = env.repository.job(committed.id().unwrap()).unwrap();
    assert_eq!(reloaded.metadata().unwrap(), &json!({"tags": ["after"]}));

    let found = env
        .repository
        .find(&json!({"tags": {"$all": ["after"]}}), false)
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn metadata_changes_do_not_affect_the_job_hash() {
    let env = TestEnv::new();

    let mut committed = env.repository.commit(&env.tagged_job("a", &["x"])).unwrap();
    let original = committed.hash().unwrap();

    *committed.metadata_mut().unwrap() = json!({"tags": ["y"], "note": "edited"});
    env.repository.save_metadata(&committed).unwrap();

    let reloaded = env.repository.job(committed.id().unwrap()).unwrap();
    assert_eq!(reloaded.compute_hashes().unwrap().job_hash, original);
}

#[test]
fn rebuild_index_reproduces_incremental_state() {
    let env = TestEnv::new();

    let a = env.repository.commit(&env.tagged_job("a", &["one"])).unwrap();
    env.repository.commit(&env.tagged_job("b", &["two"])).unwrap();

    env.repository.rebuild_index().unwrap();

    let found = env
        .repository
        .find(&json!({"tags": {"$all": ["one"]}}), false)
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), a.id());
    assert_eq!(env.repository.find(&json!({}), false).unwrap().len(), 2);
}

#[test]
fn jobs_enumerates_committed_jobs() {
    let env = TestEnv::new();
    env.repository.commit(&env.job("a", &[("run.py", "")])).unwrap();
    env.repository.commit(&env.job("b", &[("run.py", "")])).unwrap();

    let count = env.repository.jobs().unwrap().count();
    assert_eq!(count, 2);
}
