//! Deterministic file walk with absolute-only ignore patterns.
//!
//! Patterns are anchored at the walk root and always start with `/`
//! (`/name`, `/dir/name`). A pattern matches the entry whose name sits at
//! the level implied by its position: as the walk descends into a
//! directory, patterns scoped to that directory lose one leading component
//! and apply one level down. Relative patterns and globbing are not
//! supported.
//!
//! The result is sorted by path string so that anything derived from it
//! (in particular the Merkle index over job files) is stable.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// List all files under `root`, as paths relative to `root`.
pub fn find_files(root: &Path, ignore_patterns: &[String]) -> Result<Vec<PathBuf>> {
    for pattern in ignore_patterns {
        if !pattern.starts_with('/') {
            return Err(Error::Invalid(format!(
                "ignore pattern must be absolute (start with '/'): {pattern}"
            )));
        }
    }

    let patterns: Vec<&str> = ignore_patterns.iter().map(String::as_str).collect();
    let mut files = Vec::new();
    walk(root, &patterns, PathBuf::new(), &mut files)?;
    files.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
    Ok(files)
}

fn walk(dir: &Path, patterns: &[&str], prefix: PathBuf, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| Error::io_path("reading directory", dir, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::io_path("reading directory", dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(Error::Invalid(format!(
                "non-UTF-8 file name under {}",
                dir.display()
            )));
        };

        if patterns.iter().any(|pattern| {
            pattern
                .strip_prefix('/')
                .is_some_and(|stripped| stripped == name)
        }) {
            continue;
        }

        let file_type = entry
            .file_type()
            .map_err(|e| Error::io_path("inspecting", &entry.path(), e))?;

        if file_type.is_dir() {
            let scope = format!("/{name}");
            // "/dir/sub" scoped to "dir" becomes "/sub"; "/dirother" must not
            // match, so the remainder has to start with a separator.
            let descended: Vec<&str> = patterns
                .iter()
                .filter_map(|pattern| pattern.strip_prefix(scope.as_str()))
                .filter(|rest| rest.starts_with('/'))
                .collect();
            walk(&entry.path(), &descended, prefix.join(name), files)?;
        } else {
            files.push(prefix.join(name));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn lists_files_recursively_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("b.txt"));
        touch(&dir.path().join("a.txt"));
        touch(&dir.path().join("sub/c.txt"));

        let files = find_files(dir.path(), &[]).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b.txt"),
                PathBuf::from("sub/c.txt"),
            ]
        );
    }

    #[test]
    fn top_level_pattern_ignores_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("keep.txt"));
        touch(&dir.path().join("skip.txt"));
        touch(&dir.path().join("skipdir/inner.txt"));

        let files = find_files(
            dir.path(),
            &["/skip.txt".to_string(), "/skipdir".to_string()],
        )
        .unwrap();
        assert_eq!(files, vec![PathBuf::from("keep.txt")]);
    }

    #[test]
    fn nested_pattern_applies_one_level_down() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("data/skip.txt"));
        touch(&dir.path().join("data/keep.txt"));
        // A same-named file at the root is not matched by the nested pattern.
        touch(&dir.path().join("skip.txt"));

        let files = find_files(dir.path(), &["/data/skip.txt".to_string()]).unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("data/keep.txt"), PathBuf::from("skip.txt")]
        );
    }

    #[test]
    fn pattern_does_not_leak_into_sibling_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a/target.txt"));
        touch(&dir.path().join("b/target.txt"));

        let files = find_files(dir.path(), &["/a/target.txt".to_string()]).unwrap();
        assert_eq!(files, vec![PathBuf::from("b/target.txt")]);
    }

    #[test]
    fn prefix_of_a_directory_name_does_not_match() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("data-extra/file.txt"));

        let files = find_files(dir.path(), &["/data/file.txt".to_string()]).unwrap();
        assert_eq!(files, vec![PathBuf::from("data-extra/file.txt")]);
    }

    #[test]
    fn relative_pattern_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = find_files(dir.path(), &["skip.txt".to_string()]);
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn empty_directory_yields_no_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        let files = find_files(dir.path(), &[]).unwrap();
        assert!(files.is_empty());
    }
}
