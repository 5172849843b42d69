// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Versioned object store access.
//!
//! Everything the backup core needs from the underlying object store is
//! expressed through the [`ObjectStore`] trait, and [`Git2Store`] is its
//! libgit2 implementation over a bare repository whose work tree is
//! aliased to the filesystem root. Although bare repositories lack a work
//! tree by definition, one can be forced onto them, which lets the store
//! stage any absolute path on the machine without initializing the
//! filesystem as a repository. The exclude filter keeps the aliased work
//! tree down to the backup set.
//!
//! Keeping the seam here means nothing above this module ever spawns a
//! process, parses command output, or mutates ambient environment state:
//! history reads, staging, branch moves, and configuration are all
//! structured calls, and "expected failure" outcomes surface as values
//! (see [`CommitOutcome`]) instead of matched message text.
//!
//! Graft overrides are the one piece of state libgit2 does not model: the
//! override table is written whole to `$gitdir/info/grafts` for restore
//! tooling to consult. libgit2 itself never reads that file, which is
//! exactly what the rotation engine wants — every history walk through
//! this module reports true ancestry.

use git2::{
    BranchType, ErrorCode, IndexAddOption, Oid, Repository, RepositoryInitOptions, Signature,
    Sort, StatusOptions, Time,
};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read_dir, write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Gitlink entry mode in the index.
const FILEMODE_COMMIT: u32 = 0o160000;

/// Structured commit content.
///
/// Owned mirror of a stored commit, complete enough to create a new
/// commit object from. The rotation engine edits these values (stripping
/// parents, prefixing the message) without touching raw object bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author: Person,
    pub committer: Person,
    pub message: String,
}

/// One identity line of a commit, timestamp included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Person {
    pub name: String,
    pub email: String,
    pub when_secs: i64,
    pub when_offset_min: i32,
}

/// Commit identity for new snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub email: String,
}

/// Outcome of committing the staged state.
///
/// "Nothing to commit" is an expected, tolerable outcome of a backup
/// cycle, so it is a value rather than an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Oid),
    NoChanges,
}

/// Classified status of one path, index state taking priority over work
/// tree state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusCode {
    Added,
    Modified,
    Deleted,
    Renamed,
    TypeChange,
    Untracked,
    Other,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Added => "A",
            StatusCode::Modified => "M",
            StatusCode::Deleted => "D",
            StatusCode::Renamed => "R",
            StatusCode::TypeChange => "T",
            StatusCode::Untracked => "??",
            StatusCode::Other => "X",
        }
    }
}

impl Display for StatusCode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Layer of indirection for object store access.
pub trait ObjectStore {
    /// List commits reachable from a branch, newest first, true ancestry
    /// (graft overrides never apply). Missing branch yields an empty
    /// listing.
    fn list_reachable_commits(&self, branch: &str) -> Result<Vec<Oid>>;

    /// Read a commit into structured form.
    fn read_commit(&self, id: Oid) -> Result<CommitInfo>;

    /// Create a new commit object from structured form.
    ///
    /// The returned id is verified to resolve to a commit before it is
    /// handed back; an unresolvable id is an invariant violation.
    fn create_commit(&self, info: &CommitInfo) -> Result<Oid>;

    /// Current tip of a branch, or [`None`] when it does not exist.
    fn branch_tip(&self, name: &str) -> Result<Option<Oid>>;

    /// Point a branch at a commit, creating it when missing.
    fn move_branch(&self, name: &str, target: Oid) -> Result<()>;

    /// Delete a branch.
    fn delete_branch(&self, name: &str) -> Result<()>;

    /// List local branch names starting with a prefix.
    fn list_branches(&self, prefix: &str) -> Result<Vec<String>>;

    /// Replace the whole graft override table.
    fn set_grafts(&self, grafts: &[(Oid, Oid)]) -> Result<()>;

    /// Force-stage one absolute path, recursively, bypassing the exclude
    /// filter.
    fn stage(&self, path: &str) -> Result<()>;

    /// Drop one absolute path from the index, recursively. Unmatched
    /// paths are not an error.
    fn unstage(&self, path: &str) -> Result<()>;

    /// Sweep pass: stage new files honoring the exclude filter, record
    /// modifications and deletions of everything already tracked.
    fn stage_all_changes(&self) -> Result<()>;

    /// Replace gitlink index entries with the plain content beneath them,
    /// so a nested repository is backed up as files rather than as a
    /// submodule pointer. Returns the flattened paths.
    fn flatten_nested_repos(&self) -> Result<Vec<String>>;

    /// Classified status of the staged state, limited to pathspecs.
    fn read_status(&self, pathspecs: &[String]) -> Result<Vec<(StatusCode, String)>>;

    /// Commit the staged state onto `master`.
    fn commit_staged(&self, message: &str, identity: &Ident) -> Result<CommitOutcome>;

    /// Raw object store configuration access.
    fn config_get(&self, key: &str) -> Result<Option<String>>;
    fn config_set(&self, key: &str, value: &str) -> Result<()>;
    fn config_unset(&self, key: &str) -> Result<()>;
}

/// Object store access through libgit2.
pub struct Git2Store {
    repository: Repository,
}

impl Git2Store {
    /// Initialize a new bare store with `master` as its initial branch.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if the path already holds a repository or
    ///   initialization fails.
    pub fn init(gitdir: impl AsRef<Path>) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.bare(true);
        opts.no_reinit(true);
        opts.initial_head("master");
        let repository = Repository::init_opts(gitdir.as_ref(), &opts)?;
        repository.set_workdir(Path::new("/"), false)?;

        Ok(Self { repository })
    }

    /// Open an existing store.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if the path is not a repository.
    pub fn open(gitdir: impl AsRef<Path>) -> Result<Self> {
        let repository = Repository::open(gitdir.as_ref())?;
        repository.set_workdir(Path::new("/"), false)?;

        Ok(Self { repository })
    }

    /// Absolute path of the store directory.
    pub fn gitdir(&self) -> &Path {
        self.repository.path()
    }

    fn add_tree_contents(&self, index: &mut git2::Index, dir: &Path) -> Result<()> {
        let entries = read_dir(dir).map_err(|err| Error::Io {
            source: err,
            path: dir.to_path_buf(),
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| Error::Io {
                source: err,
                path: dir.to_path_buf(),
            })?;
            if entry.file_name() == ".git" {
                continue;
            }
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                self.add_tree_contents(index, &path)?;
            } else {
                let rel = path.strip_prefix("/").unwrap_or(&path);
                if let Err(error) = index.add_path(rel) {
                    warn!("skip unreadable file {}: {error}", path.display());
                }
            }
        }

        Ok(())
    }
}

impl ObjectStore for Git2Store {
    fn list_reachable_commits(&self, branch: &str) -> Result<Vec<Oid>> {
        let mut walk = self.repository.revwalk()?;
        walk.set_sorting(Sort::NONE)?;
        if let Err(error) = walk.push_ref(&format!("refs/heads/{branch}")) {
            if error.code() == ErrorCode::NotFound {
                return Ok(Vec::new());
            }
            return Err(error.into());
        }

        let mut ids = Vec::new();
        for id in walk {
            ids.push(id?);
        }

        Ok(ids)
    }

    fn read_commit(&self, id: Oid) -> Result<CommitInfo> {
        let commit = self.repository.find_commit(id)?;

        let author = commit.author();
        let committer = commit.committer();
        Ok(CommitInfo {
            tree: commit.tree_id(),
            parents: commit.parent_ids().collect(),
            author: person(&author),
            committer: person(&committer),
            message: commit.message().unwrap_or_default().to_string(),
        })
    }

    fn create_commit(&self, info: &CommitInfo) -> Result<Oid> {
        let tree = self.repository.find_tree(info.tree)?;
        let parents = info
            .parents
            .iter()
            .map(|id| self.repository.find_commit(*id))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let parents = parents.iter().collect::<Vec<_>>();
        let author = signature(&info.author)?;
        let committer = signature(&info.committer)?;

        let id = self
            .repository
            .commit(None, &author, &committer, &info.message, &tree, &parents)?;

        // INVARIANT: Never hand out an id no ref may safely move to.
        self.repository
            .find_commit(id)
            .map_err(|_| Error::UnresolvableCommit(id))?;

        Ok(id)
    }

    fn branch_tip(&self, name: &str) -> Result<Option<Oid>> {
        match self.repository.find_branch(name, BranchType::Local) {
            Ok(branch) => Ok(branch.get().target()),
            Err(error) if error.code() == ErrorCode::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn move_branch(&self, name: &str, target: Oid) -> Result<()> {
        let commit = self.repository.find_commit(target)?;
        self.repository.branch(name, &commit, true)?;

        Ok(())
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        let mut branch = self.repository.find_branch(name, BranchType::Local)?;
        branch.delete()?;

        Ok(())
    }

    fn list_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for branch in self.repository.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }

        Ok(names)
    }

    fn set_grafts(&self, grafts: &[(Oid, Oid)]) -> Result<()> {
        let grafts_path = self.repository.path().join("info").join("grafts");
        let mut out = String::new();
        for (child, parent) in grafts {
            out.push_str(&format!("{child} {parent}\n"));
        }
        write(&grafts_path, out.as_bytes()).map_err(|err| Error::Io {
            source: err,
            path: grafts_path,
        })?;

        Ok(())
    }

    fn stage(&self, path: &str) -> Result<()> {
        let rel = path.trim_start_matches('/');
        let mut index = self.repository.index()?;
        index.add_all([rel], IndexAddOption::FORCE, None)?;
        index.write()?;

        Ok(())
    }

    fn unstage(&self, path: &str) -> Result<()> {
        let rel = path.trim_start_matches('/');
        let mut index = self.repository.index()?;
        index.remove_all([rel], None)?;
        index.write()?;

        Ok(())
    }

    fn stage_all_changes(&self) -> Result<()> {
        let mut index = self.repository.index()?;
        index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"], None)?;
        index.write()?;

        Ok(())
    }

    fn flatten_nested_repos(&self) -> Result<Vec<String>> {
        let mut index = self.repository.index()?;
        let gitlinks = index
            .iter()
            .filter(|entry| entry.mode == FILEMODE_COMMIT)
            .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
            .collect::<Vec<_>>();

        for link in &gitlinks {
            debug!("flatten nested repository at /{link}");
            index.remove_path(Path::new(link))?;
            self.add_tree_contents(&mut index, &PathBuf::from("/").join(link))?;
        }
        if !gitlinks.is_empty() {
            index.write()?;
        }

        Ok(gitlinks)
    }

    fn read_status(&self, pathspecs: &[String]) -> Result<Vec<(StatusCode, String)>> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .exclude_submodules(true);
        for spec in pathspecs {
            opts.pathspec(spec.trim_start_matches('/'));
        }

        let statuses = self.repository.statuses(Some(&mut opts))?;
        let mut out = Vec::new();
        for entry in statuses.iter() {
            let status = entry.status();
            let code = if status.is_index_new() {
                StatusCode::Added
            } else if status.is_index_modified() {
                StatusCode::Modified
            } else if status.is_index_deleted() {
                StatusCode::Deleted
            } else if status.is_index_renamed() {
                StatusCode::Renamed
            } else if status.is_index_typechange() {
                StatusCode::TypeChange
            } else if status.is_wt_new() {
                StatusCode::Untracked
            } else {
                StatusCode::Other
            };
            out.push((code, entry.path().unwrap_or_default().to_string()));
        }

        Ok(out)
    }

    fn commit_staged(&self, message: &str, identity: &Ident) -> Result<CommitOutcome> {
        let mut index = self.repository.index()?;
        let tree_id = index.write_tree()?;

        let parent_id = self.branch_tip("master")?;
        match parent_id {
            Some(parent_id) => {
                let parent = self.repository.find_commit(parent_id)?;
                if parent.tree_id() == tree_id {
                    return Ok(CommitOutcome::NoChanges);
                }
            }
            None if index.is_empty() => return Ok(CommitOutcome::NoChanges),
            None => {}
        }

        let tree = self.repository.find_tree(tree_id)?;
        let sig = Signature::now(&identity.name, &identity.email)?;
        let parents = parent_id
            .map(|id| self.repository.find_commit(id))
            .transpose()?;
        let parents = parents.iter().collect::<Vec<_>>();

        let id = self
            .repository
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        Ok(CommitOutcome::Committed(id))
    }

    fn config_get(&self, key: &str) -> Result<Option<String>> {
        match self.repository.config()?.get_string(key) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.code() == ErrorCode::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.repository.config()?.set_str(key, value)?;

        Ok(())
    }

    fn config_unset(&self, key: &str) -> Result<()> {
        match self.repository.config()?.remove(key) {
            Ok(()) => Ok(()),
            Err(error) if error.code() == ErrorCode::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

fn person(sig: &Signature<'_>) -> Person {
    Person {
        name: sig.name().unwrap_or("unknown").to_string(),
        email: sig.email().unwrap_or("unknown").to_string(),
        when_secs: sig.when().seconds(),
        when_offset_min: sig.when().offset_minutes(),
    }
}

fn signature(person: &Person) -> Result<Signature<'static>> {
    Ok(Signature::new(
        &person.name,
        &person.email,
        &Time::new(person.when_secs, person.when_offset_min),
    )?)
}

/// Object store access error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// Filesystem access around the store fails.
    #[error("failed to access {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Created commit id does not resolve. Nothing may move a ref to it.
    #[error("object store returned unresolvable commit id {0}")]
    UnresolvableCommit(Oid),
}

/// Friendly result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
