use assert_cmd::Command;
use git2::{Repository, Signature, Time};
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Two commits on `main`: `tracked.txt`, then `.gitignore` ignoring `*.log`.
fn create_test_repository() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().canonicalize().unwrap();
    let repo = Repository::init(&root).unwrap();

    std::fs::write(root.join("tracked.txt"), "tracked\n").unwrap();
    std::fs::write(root.join("untracked.txt"), "loose\n").unwrap();
    std::fs::write(root.join("build.log"), "noise\n").unwrap();
    std::fs::write(root.join(".gitignore"), "*.log\n").unwrap();

    let mut parent = None;
    for (file, time) in [("tracked.txt", 1_000), (".gitignore", 2_000)] {
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(file)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let signature = Signature::new("Test User", "test@example.com", &Time::new(time, 0)).unwrap();
        let parents: Vec<git2::Commit> = parent.iter().map(|id| repo.find_commit(*id).unwrap()).collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        let id = repo
            .commit(
                Some("refs/heads/main"),
                &signature,
                &signature,
                &format!("Add {}", file),
                &tree,
                &parent_refs,
            )
            .unwrap();
        parent = Some(id);
    }
    repo.set_head("refs/heads/main").unwrap();
    (temp_dir, root)
}

fn revgraph() -> Command {
    Command::cargo_bin("revgraph").unwrap()
}

#[test]
fn is_versioned_reports_tracked_files() {
    let (_temp_dir, root) = create_test_repository();

    revgraph()
        .args(["is-versioned"])
        .arg(root.join("tracked.txt"))
        .assert()
        .code(1)
        .stdout("versioned\n");

    revgraph()
        .args(["is-versioned"])
        .arg(root.join("untracked.txt"))
        .assert()
        .code(0)
        .stdout("not versioned\n");
}

#[test]
fn is_ignored_applies_ignore_rules() {
    let (_temp_dir, root) = create_test_repository();

    revgraph()
        .args(["is-ignored"])
        .arg(root.join("build.log"))
        .assert()
        .code(1)
        .stdout("ignored\n");

    revgraph()
        .args(["is-ignored"])
        .arg(root.join("tracked.txt"))
        .assert()
        .code(0)
        .stdout("not ignored\n");
}

#[test]
fn quiet_flag_silences_stdout() {
    let (_temp_dir, root) = create_test_repository();

    revgraph()
        .args(["is-versioned", "-q"])
        .arg(root.join("tracked.txt"))
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());

    revgraph()
        .args(["is-ignored", "--quiet"])
        .arg(root.join("tracked.txt"))
        .assert()
        .code(0)
        .stdout(predicate::str::is_empty());
}

#[test]
fn paths_outside_a_working_tree_exit_with_error() {
    let temp_dir = TempDir::new().unwrap();
    let loose = temp_dir.path().join("loose.txt");
    std::fs::write(&loose, "x").unwrap();

    revgraph()
        .arg("is-versioned")
        .arg(&loose)
        .assert()
        .code(3)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("revgraph:"));

    revgraph().arg("is-ignored").arg(&loose).assert().code(3);
}

#[test]
fn layout_prints_frame_json() {
    let (_temp_dir, root) = create_test_repository();

    let output = revgraph()
        .arg("layout")
        .arg("--repo")
        .arg(&root)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let frame: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let rows = frame["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["labels"][0], "main");
    assert_eq!(rows[0]["column"], 0);
    assert_eq!(frame["edges"][0]["kind"], "direct");
    assert_eq!(frame["more_available"], false);
}

#[test]
fn layout_respects_limit() {
    let (_temp_dir, root) = create_test_repository();

    revgraph()
        .arg("layout")
        .arg("--repo")
        .arg(&root)
        .args(["--limit", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"more_available\": true"));
}

#[test]
fn layout_outside_a_repository_fails() {
    let temp_dir = TempDir::new().unwrap();

    revgraph()
        .arg("layout")
        .arg("--repo")
        .arg(temp_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("revgraph:"));
}
