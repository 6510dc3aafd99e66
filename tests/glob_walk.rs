//! Pattern matching and traversal over the path index.

use std::path::Path;

use tempfile::tempdir;

use barecat::{Barecat, BarecatError, OpenMode};

fn archive_with(paths: &[&str]) -> (Barecat, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = Barecat::builder(&base)
        .mode(OpenMode::CreateNew)
        .open()
        .unwrap();
    for path in paths {
        archive.write(path, path.as_bytes()).unwrap();
    }
    (archive, dir)
}

fn reopen(archive: Barecat, dir: &tempfile::TempDir) -> Barecat {
    archive.close().unwrap();
    Barecat::open(Path::new(&dir.path().join("arch"))).unwrap()
}

#[test]
fn double_star_matches_any_depth() {
    let (archive, dir) = archive_with(&["a/x1", "a/b/x2", "a/b/y3"]);
    let archive = reopen(archive, &dir);

    assert_eq!(archive.glob("**/x*").unwrap(), vec!["a/b/x2", "a/x1"]);
    archive.close().unwrap();
}

#[test]
fn single_star_stays_within_a_segment() {
    let (archive, dir) = archive_with(&["d/one.bin", "d/two.bin", "d/sub/three.bin", "e/four.bin"]);
    let archive = reopen(archive, &dir);

    assert_eq!(
        archive.glob("d/*.bin").unwrap(),
        vec!["d/one.bin", "d/two.bin"]
    );
    assert_eq!(archive.glob("d/*/*.bin").unwrap(), vec!["d/sub/three.bin"]);
    archive.close().unwrap();
}

#[test]
fn question_mark_and_classes() {
    let (archive, dir) = archive_with(&["s/a1", "s/a2", "s/b1", "s/a12"]);
    let archive = reopen(archive, &dir);

    assert_eq!(archive.glob("s/a?").unwrap(), vec!["s/a1", "s/a2"]);
    assert_eq!(archive.glob("s/[ab]1").unwrap(), vec!["s/a1", "s/b1"]);
    assert_eq!(archive.glob("s/[!a]1").unwrap(), vec!["s/b1"]);
    archive.close().unwrap();
}

#[test]
fn literal_pattern_is_an_exact_lookup() {
    let (archive, dir) = archive_with(&["exact/path", "exact/path2"]);
    let archive = reopen(archive, &dir);

    assert_eq!(archive.glob("exact/path").unwrap(), vec!["exact/path"]);
    assert!(archive.glob("exact/nope").unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn bare_double_star_lists_every_file() {
    let (archive, dir) = archive_with(&["a/1", "b/c/2", "3"]);
    let archive = reopen(archive, &dir);

    assert_eq!(archive.glob("**").unwrap(), vec!["3", "a/1", "b/c/2"]);
    archive.close().unwrap();
}

#[test]
fn invalid_pattern_is_reported() {
    let (archive, _dir) = archive_with(&["a/x"]);
    let err = archive.glob("a/[unterminated").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::InvalidPattern(_))
    ));
    archive.close().unwrap();
}

#[test]
fn walk_yields_preorder_with_names() {
    let (archive, dir) = archive_with(&["a/x", "a/b/y", "a/b/c/z", "d/w"]);
    let archive = reopen(archive, &dir);

    let visited: Vec<(String, Vec<String>, Vec<String>)> = archive
        .walk_names("")
        .unwrap()
        .collect::<eyre::Result<_>>()
        .unwrap();

    let dirs: Vec<&str> = visited.iter().map(|(d, _, _)| d.as_str()).collect();
    assert_eq!(dirs, vec!["", "a", "a/b", "a/b/c", "d"]);

    let (_, root_subdirs, root_files) = &visited[0];
    assert_eq!(root_subdirs, &["a", "d"]);
    assert!(root_files.is_empty());

    let (_, ab_subdirs, ab_files) = &visited[2];
    assert_eq!(ab_subdirs, &["c"]);
    assert_eq!(ab_files, &["y"]);
    archive.close().unwrap();
}

#[test]
fn walk_of_subtree_only_sees_that_subtree() {
    let (archive, dir) = archive_with(&["a/x", "a/b/y", "other/z"]);
    let archive = reopen(archive, &dir);

    let dirs: Vec<String> = archive
        .walk("a")
        .unwrap()
        .map(|item| item.unwrap().0.path)
        .collect();
    assert_eq!(dirs, vec!["a", "a/b"]);
    archive.close().unwrap();
}

#[test]
fn walk_of_missing_or_file_path_fails() {
    let (archive, _dir) = archive_with(&["a/x"]);
    assert!(matches!(
        archive.walk("missing").unwrap_err().downcast_ref::<BarecatError>(),
        Some(BarecatError::NotFound(_))
    ));
    assert!(matches!(
        archive.walk("a/x").unwrap_err().downcast_ref::<BarecatError>(),
        Some(BarecatError::NotADirectory(_))
    ));
    archive.close().unwrap();
}

#[test]
fn listdir_splits_kinds_and_checks_existence() {
    let (archive, _dir) = archive_with(&["top/sub/leaf", "top/file1", "top/file2"]);

    let (subdirs, files) = archive.listdir("top").unwrap();
    assert_eq!(subdirs, vec!["sub"]);
    assert_eq!(files, vec!["file1", "file2"]);

    assert!(archive.exists("top/sub").unwrap());
    assert!(archive.isdir("top/sub").unwrap());
    assert!(!archive.isfile("top/sub").unwrap());
    assert!(archive.isfile("top/file1").unwrap());
    assert!(!archive.exists("top/none").unwrap());
    archive.close().unwrap();
}
