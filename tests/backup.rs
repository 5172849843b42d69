// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use ringstore::repo::{store::CommitOutcome, Repo};

use git2::Repository;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::{fs, path::PathBuf};

/// Scratch source tree beside the store under test.
struct SourceFixture {
    root: PathBuf,
}

impl SourceFixture {
    fn new(name: &str) -> Self {
        fs::create_dir_all(name).unwrap();
        Self {
            root: fs::canonicalize(name).unwrap(),
        }
    }

    fn entry(&self) -> String {
        self.root.display().to_string()
    }

    fn write(&self, filename: &str, contents: &str) {
        let path = self.root.join(filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn remove(&self, filename: &str) {
        fs::remove_file(self.root.join(filename)).unwrap();
    }
}

fn repo_with_entry(source: &SourceFixture) -> Repo {
    let mut repo = Repo::init("store.git", None).unwrap();

    // INVARIANT: Always provide valid name and email.
    //   - Git will complain if this is not set in CI/CD environments.
    let git = Repository::open("store.git").unwrap();
    let mut config = git.config().unwrap();
    config.set_str("user.name", "John Doe").unwrap();
    config.set_str("user.email", "john@doe.com").unwrap();

    repo.add_entries([source.entry()]);
    repo.save_entries().unwrap();
    repo
}

fn master_history(gitdir: &str) -> Vec<git2::Oid> {
    let git = Repository::open(gitdir).unwrap();
    let mut walk = git.revwalk().unwrap();
    walk.push_ref("refs/heads/master").unwrap();
    walk.map(|id| id.unwrap()).collect()
}

#[sealed_test]
fn backup_cycle_commits_entry_contents() {
    let source = SourceFixture::new("data");
    source.write("notes.txt", "first");
    source.write("nested/deep.txt", "second");
    let mut repo = repo_with_entry(&source);

    let report = repo.backup(None).unwrap();
    assert!(matches!(report.outcome, CommitOutcome::Committed(_)));
    assert!(report.changes >= 2);

    // The snapshot holds both files under the entry's absolute path.
    let git = Repository::open("store.git").unwrap();
    let head = git.head().unwrap().peel_to_commit().unwrap();
    let tree = head.tree().unwrap();
    let rel = source.root.strip_prefix("/").unwrap();
    assert!(tree.get_path(&rel.join("notes.txt")).is_ok());
    assert!(tree.get_path(&rel.join("nested/deep.txt")).is_ok());
    assert!(head.message().unwrap().starts_with("Backup "));
}

#[sealed_test]
fn unchanged_cycle_reports_no_changes() {
    let source = SourceFixture::new("data");
    source.write("notes.txt", "same");
    let mut repo = repo_with_entry(&source);

    assert!(matches!(
        repo.backup(None).unwrap().outcome,
        CommitOutcome::Committed(_)
    ));
    assert_eq!(repo.backup(None).unwrap().outcome, CommitOutcome::NoChanges);
    assert_eq!(master_history("store.git").len(), 1);
}

#[sealed_test]
fn modified_and_deleted_files_land_in_the_next_snapshot() {
    let source = SourceFixture::new("data");
    source.write("keep.txt", "v1");
    source.write("drop.txt", "gone soon");
    let mut repo = repo_with_entry(&source);
    repo.backup(None).unwrap();

    source.write("keep.txt", "v2");
    source.remove("drop.txt");
    let report = repo.backup(Some("second pass")).unwrap();
    assert!(matches!(report.outcome, CommitOutcome::Committed(_)));

    let git = Repository::open("store.git").unwrap();
    let head = git.head().unwrap().peel_to_commit().unwrap();
    let rel = source.root.strip_prefix("/").unwrap();
    let tree = head.tree().unwrap();
    assert!(tree.get_path(&rel.join("keep.txt")).is_ok());
    assert!(tree.get_path(&rel.join("drop.txt")).is_err());
    assert!(head.message().unwrap().starts_with("second pass\n\n"));
}

#[sealed_test]
fn removed_entry_leaves_the_next_snapshot() {
    let kept = SourceFixture::new("kept");
    kept.write("a.txt", "stay");
    let dropped = SourceFixture::new("dropped");
    dropped.write("b.txt", "leave");

    let mut repo = repo_with_entry(&kept);
    repo.add_entries([dropped.entry()]);
    repo.save_entries().unwrap();
    repo.backup(None).unwrap();

    repo.remove_entries([dropped.entry()]);
    repo.save_entries().unwrap();
    let report = repo.backup(None).unwrap();
    assert!(matches!(report.outcome, CommitOutcome::Committed(_)));

    let git = Repository::open("store.git").unwrap();
    let tree = git.head().unwrap().peel_to_commit().unwrap().tree().unwrap();
    let kept_rel = kept.root.strip_prefix("/").unwrap();
    let dropped_rel = dropped.root.strip_prefix("/").unwrap();
    assert!(tree.get_path(&kept_rel.join("a.txt")).is_ok());
    assert!(tree.get_path(&dropped_rel.join("b.txt")).is_err());
}

#[sealed_test]
fn rotation_reroots_master_and_fills_the_ring() {
    let source = SourceFixture::new("data");
    source.write("counter.txt", "0");
    let mut repo = repo_with_entry(&source);
    repo.set_config_value("increment_backup_number", "1").unwrap();
    repo.set_config_value("full_backup_number", "3").unwrap();

    // Two snapshots stay under the limit, the third cycle rotates first.
    repo.backup(None).unwrap();
    source.write("counter.txt", "1");
    repo.backup(None).unwrap();
    let before = master_history("store.git");
    assert_eq!(before.len(), 2);

    source.write("counter.txt", "2");
    repo.backup(None).unwrap();

    let git = Repository::open("store.git").unwrap();
    let slot = git
        .find_branch("ringstore/1", git2::BranchType::Local)
        .unwrap();
    assert_eq!(slot.get().target(), Some(before[0]));

    // Master was re-rooted: a parentless full-backup commit with the
    // rotated tree, plus the snapshot the cycle committed on top.
    let history = master_history("store.git");
    assert_eq!(history.len(), 2);
    let root = git.find_commit(history[1]).unwrap();
    assert_eq!(root.parent_count(), 0);
    assert!(root.message().unwrap().starts_with("Full backup of "));
    assert_eq!(
        root.tree_id(),
        git.find_commit(before[0]).unwrap().tree_id()
    );

    // One graft pair per surviving slot.
    let grafts = fs::read_to_string("store.git/info/grafts").unwrap();
    let pairs = grafts.lines().collect::<Vec<_>>();
    assert_eq!(pairs.len(), 1);
    assert_eq!(
        pairs[0],
        format!("{} {}", history[1], before[1])
    );
}

#[sealed_test]
fn repeated_rotations_keep_every_slot_restorable() {
    let source = SourceFixture::new("data");
    let mut repo = repo_with_entry(&source);
    repo.set_config_value("increment_backup_number", "1").unwrap();
    repo.set_config_value("full_backup_number", "2").unwrap();

    for round in 0..8 {
        source.write("counter.txt", &round.to_string());
        repo.backup(None).unwrap();
    }

    let git = Repository::open("store.git").unwrap();
    let slots = git
        .branches(Some(git2::BranchType::Local))
        .unwrap()
        .filter_map(|branch| branch.ok())
        .filter_map(|(branch, _)| branch.name().ok().flatten().map(str::to_string))
        .filter(|name| name.starts_with("ringstore/"))
        .collect::<Vec<_>>();
    assert_eq!(slots.len(), 2);

    // Every slot still resolves to a commit whose tree can be read back.
    for name in slots {
        let branch = git.find_branch(&name, git2::BranchType::Local).unwrap();
        let commit = git.find_commit(branch.get().target().unwrap()).unwrap();
        assert!(commit.tree().is_ok());
    }

    let grafts = fs::read_to_string("store.git/info/grafts").unwrap();
    assert_eq!(grafts.lines().count(), 2);
}

#[sealed_test]
fn nested_repository_is_backed_up_as_plain_content() {
    let source = SourceFixture::new("data");
    source.write("top.txt", "top");
    let nested = source.root.join("vendored");
    fs::create_dir_all(&nested).unwrap();
    Repository::init(&nested).unwrap();
    fs::write(nested.join("inner.txt"), "inner").unwrap();

    let mut repo = repo_with_entry(&source);
    repo.backup(None).unwrap();

    let git = Repository::open("store.git").unwrap();
    let tree = git.head().unwrap().peel_to_commit().unwrap().tree().unwrap();
    let rel = source.root.strip_prefix("/").unwrap();
    let inner = tree.get_path(&rel.join("vendored/inner.txt")).unwrap();
    assert_eq!(inner.filemode(), 0o100644);

    let index = git.index().unwrap();
    assert!(index.iter().all(|entry| entry.mode != 0o160000));
}

#[sealed_test]
fn status_lists_pending_changes_before_a_cycle() {
    let source = SourceFixture::new("data");
    source.write("new.txt", "pending");
    let repo = repo_with_entry(&source);

    let changes = repo.changes().unwrap();
    let rel = source
        .root
        .strip_prefix("/")
        .unwrap()
        .join("new.txt")
        .display()
        .to_string();
    assert!(changes.iter().any(|(_, path)| path == &rel));
}

#[sealed_test]
fn reopened_repo_sees_persisted_entries() {
    let source = SourceFixture::new("data");
    source.write("a.txt", "a");
    {
        let mut repo = repo_with_entry(&source);
        repo.backup(None).unwrap();
    }

    let repo = Repo::open("store.git").unwrap();
    assert_eq!(repo.backups().entries, vec![source.entry()]);
    assert_eq!(repo.config().backups, vec![source.entry()]);

    // The derived filter was refreshed at open.
    let exclude = fs::read_to_string("store.git/info/exclude").unwrap();
    assert!(exclude.starts_with("*\n"));
    assert!(exclude.contains(&format!("!{}/**", source.entry())));
}
