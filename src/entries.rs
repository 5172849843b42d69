// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup entry set handling.
//!
//! A backup __entry__ is a normalized absolute path that marks a file or
//! directory tree for inclusion into every snapshot. The full listing of
//! entries forms the __backup set__, which is what the exclude filter and
//! the staging pass of a backup cycle are derived from.
//!
//! Entry manipulation is deliberately forgiving: anything that cannot be
//! accepted (relative garbage, the root path, paths overlapping the repo
//! itself, duplicates) is reported through a warning and skipped, so one
//! bad path never aborts a batch of good ones.

use serde::{Deserialize, Serialize};
use std::{
    env,
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

/// Ordered set of backup entries.
///
/// # Invariant
///
/// - Every stored entry is normalized (see [`normalize`]).
/// - After [`BackupSet::finalize`], entries are sorted and no entry is a
///   descendant of another.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSet {
    pub entries: Vec<String>,
}

impl BackupSet {
    /// Construct new empty backup set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new entry after normalization and validation.
    ///
    /// Returns the canonical entry that was stored, or [`None`] if the
    /// entry was rejected. Every rejection path emits a warning instead of
    /// failing.
    pub fn add(&mut self, raw: impl AsRef<str>, repo_path: &Path) -> Option<String> {
        let entry = normalize(raw.as_ref())?;
        if !validate(&entry, repo_path) {
            warn!("entry {entry} is not valid");
            return None;
        }
        if self.entries.iter().any(|e| e == &entry) {
            warn!("entry {entry} is already added");
            return None;
        }

        self.entries.push(entry.clone());
        Some(entry)
    }

    /// Remove an entry.
    ///
    /// A verbatim match against the stored listing wins; otherwise the
    /// input is normalized and matched again. Emits a warning when nothing
    /// matched.
    pub fn remove(&mut self, raw: impl AsRef<str>) -> Option<String> {
        let raw = raw.as_ref();
        let target = if self.entries.iter().any(|e| e == raw) {
            raw.to_string()
        } else {
            match normalize(raw) {
                Some(entry) => entry,
                None => return None,
            }
        };

        match self.entries.iter().position(|e| e == &target) {
            Some(index) => {
                self.entries.remove(index);
                Some(target)
            }
            None => {
                warn!("entry {target} not in backup list, nothing removed");
                None
            }
        }
    }

    /// Produce the finalized backup set.
    ///
    /// Sorts entries, drops anything that fails validation, then drops
    /// every entry that is a descendant of (or identical to) the
    /// previously kept entry. Idempotent: finalizing a finalized set is a
    /// no-op.
    pub fn finalize(&self, repo_path: &Path) -> BackupSet {
        let mut sorted = self.entries.clone();
        sorted.sort();

        let mut kept: Vec<String> = Vec::new();
        for entry in sorted {
            if !validate(&entry, repo_path) {
                warn!("dropped invalid entry {entry}");
                continue;
            }
            if let Some(prev) = kept.last() {
                if is_redundant(prev, &entry) {
                    warn!("dropped {entry}, already covered by {prev}");
                    continue;
                }
            }
            kept.push(entry);
        }

        BackupSet { entries: kept }
    }

    /// Listing of paths the staging pass must cover.
    ///
    /// The finalized entries, plus the symlink-resolved target of every
    /// existing entry whose resolved path differs. Both spellings must be
    /// present in the filter and in the index, since the thing the user
    /// named and the thing the filesystem stores can disagree.
    pub fn staging_set(&self, repo_path: &Path) -> Vec<String> {
        let mut paths = Vec::new();
        for entry in &self.finalize(repo_path).entries {
            paths.push(entry.clone());
            if Path::new(entry).exists() {
                let resolved = realpath(Path::new(entry));
                let resolved = resolved.to_string_lossy().into_owned();
                if &resolved != entry {
                    paths.push(resolved);
                }
            }
        }
        paths
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalize a raw path into canonical entry form.
///
/// Expands `~` and environment references, makes the path absolute
/// against the current directory, collapses repeated separators, and
/// strips trailing separators. The root path is rejected with a warning,
/// as is anything that cannot be expanded.
pub fn normalize(raw: &str) -> Option<String> {
    let expanded = match shellexpand::full(raw) {
        Ok(expanded) => expanded.into_owned(),
        Err(error) => {
            warn!("cannot expand entry {raw}: {error}");
            return None;
        }
    };

    let absolute = if expanded.starts_with('/') {
        expanded
    } else {
        let cwd = match env::current_dir() {
            Ok(cwd) => cwd,
            Err(error) => {
                warn!("cannot resolve relative entry {raw}: {error}");
                return None;
            }
        };
        format!("{}/{}", cwd.to_string_lossy(), expanded)
    };

    let mut collapsed = String::with_capacity(absolute.len());
    let mut last_sep = false;
    for ch in absolute.chars() {
        if ch == '/' {
            if !last_sep {
                collapsed.push(ch);
            }
            last_sep = true;
        } else {
            collapsed.push(ch);
            last_sep = false;
        }
    }
    while collapsed.len() > 1 && collapsed.ends_with('/') {
        collapsed.pop();
    }

    if collapsed == "/" {
        warn!("ignore root entry");
        return None;
    }

    Some(collapsed)
}

/// Check that an entry does not overlap the repo's own storage location.
///
/// Both directions are rejected: an entry that contains the repo would
/// back the store up into itself, and an entry inside the repo is store
/// internals. Comparison happens on symlink-resolved paths.
pub fn validate(entry: &str, repo_path: &Path) -> bool {
    let entry_path = realpath(Path::new(entry));
    let repo_path = realpath(repo_path);

    if repo_path == entry_path || repo_path.starts_with(&entry_path) {
        warn!(
            "repo {} is inside entry {}",
            repo_path.display(),
            entry_path.display()
        );
        false
    } else if entry_path.starts_with(&repo_path) {
        warn!(
            "entry {} is inside repo {}",
            entry_path.display(),
            repo_path.display()
        );
        false
    } else {
        true
    }
}

/// Resolve symlinks when the path exists, otherwise pass it through.
fn realpath(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Is `entry` redundant given that `prev` is already kept?
///
/// Redundant means `prev` is a path prefix ending at a separator
/// boundary, or the two are identical up to a trailing separator.
fn is_redundant(prev: &str, entry: &str) -> bool {
    entry.starts_with(prev)
        && (entry.len() == prev.len()
            || entry.ends_with('/')
            || entry.as_bytes().get(prev.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn repo() -> PathBuf {
        PathBuf::from("/backup/store.git")
    }

    #[test_case("/etc//nginx", "/etc/nginx"; "repeated separators")]
    #[test_case("/var/log/", "/var/log"; "trailing separator")]
    #[test_case("///srv///www//", "/srv/www"; "many separators")]
    #[test]
    fn normalize_collapses_separators(raw: &str, expect: &str) {
        assert_eq!(normalize(raw), Some(expect.to_string()));
    }

    #[test_case("/etc/nginx"; "plain")]
    #[test_case("/var/log"; "nested")]
    #[test]
    fn normalize_is_idempotent(raw: &str) {
        let once = normalize(raw).unwrap();
        let twice = normalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test_case("/"; "bare root")]
    #[test_case("//"; "doubled root")]
    #[test_case("///"; "tripled root")]
    #[test]
    fn normalize_rejects_root(raw: &str) {
        assert_eq!(normalize(raw), None);
    }

    #[test]
    fn normalize_makes_relative_input_absolute() {
        let entry = normalize("some/dir").unwrap();
        assert!(entry.starts_with('/'));
        assert!(entry.ends_with("/some/dir"));
    }

    #[test_case("/backup/store.git"; "exact repo path")]
    #[test_case("/backup/store.git/objects"; "inside repo")]
    #[test_case("/backup/store.git/info/exclude"; "deep inside repo")]
    #[test_case("/backup"; "repo ancestor")]
    #[test_case("/"; "root contains everything")]
    #[test]
    fn validate_rejects_repo_overlap(entry: &str) {
        assert!(!validate(entry, &repo()));
    }

    #[test]
    fn validate_accepts_disjoint_entry() {
        assert!(validate("/etc/nginx", &repo()));
        assert!(validate("/backup/other", &repo()));
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut set = BackupSet::new();
        assert_eq!(set.add("/etc/hosts", &repo()), Some("/etc/hosts".into()));
        assert_eq!(set.add("/etc//hosts/", &repo()), None);
        assert_eq!(set.entries, vec!["/etc/hosts".to_string()]);
    }

    #[test]
    fn remove_prefers_verbatim_then_normalized() {
        let mut set = BackupSet::new();
        set.add("/etc/hosts", &repo());
        assert_eq!(set.remove("/etc//hosts"), Some("/etc/hosts".into()));
        assert!(set.is_empty());
    }

    #[test]
    fn remove_missing_entry_leaves_set_unchanged() {
        let mut set = BackupSet::new();
        set.add("/etc/hosts", &repo());
        assert_eq!(set.remove("/no/such/path"), None);
        assert_eq!(set.entries, vec!["/etc/hosts".to_string()]);
    }

    #[test]
    fn finalize_drops_descendant_of_kept_entry() {
        let mut set = BackupSet::new();
        set.add("/data/a", &repo());
        set.add("/data/a/b", &repo());
        let result = set.finalize(&repo());
        assert_eq!(result.entries, vec!["/data/a".to_string()]);
    }

    #[test]
    fn finalize_keeps_sibling_with_common_name_prefix() {
        let mut set = BackupSet::new();
        set.add("/data/a", &repo());
        set.add("/data/ab", &repo());
        let result = set.finalize(&repo());
        assert_eq!(
            result.entries,
            vec!["/data/a".to_string(), "/data/ab".to_string()]
        );
    }

    #[test]
    fn finalize_sorts_and_is_idempotent() {
        let mut set = BackupSet::new();
        set.add("/var/log", &repo());
        set.add("/etc/nginx", &repo());
        set.add("/var/log/nginx", &repo());
        let once = set.finalize(&repo());
        let twice = once.finalize(&repo());
        assert_eq!(
            once.entries,
            vec!["/etc/nginx".to_string(), "/var/log".to_string()]
        );
        assert_eq!(once, twice);
    }
}
