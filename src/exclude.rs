// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Exclude filter handling.
//!
//! Utilities to manage the exclude rules that narrow a snapshot down to
//! the backup set.
//!
//! # Why An Exclude Filter?
//!
//! The backup repo aliases the entire filesystem root as its work tree, so
//! by default every path on the machine would be a snapshot candidate. The
//! filter inverts that: the first rule excludes everything, and the rules
//! after it re-include exactly the backup entries. Two kinds of
//! re-inclusion are needed. Every ancestor directory of an entry gets its
//! own rule so traversal can descend to the entry at all, without pulling
//! in the ancestor's siblings. The entry itself then gets a recursive rule
//! (`!<entry>/**`) so everything beneath it is kept.
//!
//! Ancestor rules carry no trailing separator on purpose. An entry may be
//! a symlink, and a trailing separator would restrict the rule to real
//! directories only.
//!
//! # Filter File Layout
//!
//! Rules are stored in the gitdir at `$gitdir/info/exclude`, one rule per
//! line, which the object store consults for both staging and status of
//! the aliased work tree. The file is derived state: it can always be
//! regenerated from the persisted backup set, and it is tracked for
//! staleness against that artifact's modification time. Regeneration is
//! idempotent, so the staleness check is purely an optimization.

use ignore::gitignore::GitignoreBuilder;
use std::{
    fs::{metadata, read_to_string, write, OpenOptions},
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::debug;

/// Manage exclude rules in the filter file.
///
/// Provides methods to regenerate, read, and match exclude rules against
/// target file paths.
#[derive(Clone, Debug)]
pub struct ExcludeDrafter {
    exclude_path: PathBuf,
    backups_path: PathBuf,
}

impl ExcludeDrafter {
    /// Construct new exclude rule drafter.
    ///
    /// Creates the filter file if it does not already exist yet.
    ///
    /// # Errors
    ///
    /// - Return [`Error::CreateExcludeFile`] if the filter file cannot be
    ///   created when missing.
    pub fn new(gitdir: impl Into<PathBuf>, backups_path: impl Into<PathBuf>) -> Result<Self> {
        let exclude_path = gitdir.into().join("info").join("exclude");

        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&exclude_path)
            .map_err(|err| Error::CreateExcludeFile {
                source: err,
                exclude_path: exclude_path.clone(),
            })?;

        Ok(Self {
            exclude_path,
            backups_path: backups_path.into(),
        })
    }

    /// Regenerate the filter file from a staging set.
    ///
    /// # Errors
    ///
    /// - Return [`Error::WriteExcludeFile`] if rules cannot be written to
    ///   the filter file.
    pub fn regenerate(&self, staging: &[String]) -> Result<()> {
        let mut hierarchies: Vec<String> = Vec::new();
        for entry in staging {
            let mut prefix = String::new();
            for component in entry.split('/').filter(|c| !c.is_empty()) {
                prefix.push('/');
                prefix.push_str(component);
                if !hierarchies.iter().any(|h| h == &prefix) {
                    hierarchies.push(prefix.clone());
                }
            }
        }

        let mut out = String::from("*\n");
        for hierarchy in &hierarchies {
            out.push_str(&format!("!{hierarchy}\n"));
        }
        for entry in staging {
            out.push_str(&format!("!{entry}/**\n"));
        }

        write(&self.exclude_path, out.as_bytes()).map_err(|err| Error::WriteExcludeFile {
            source: err,
            exclude_path: self.exclude_path.clone(),
        })?;

        Ok(())
    }

    /// Regenerate the filter file only when the persisted backup set is
    /// newer than the last generated filter.
    ///
    /// # Errors
    ///
    /// - Return [`Error::WriteExcludeFile`] if rules cannot be written to
    ///   the filter file.
    pub fn ensure_fresh(&self, staging: &[String]) -> Result<()> {
        if self.is_fresh() {
            debug!("exclude filter up to date, skip regeneration");
            return Ok(());
        }
        self.regenerate(staging)
    }

    /// List current exclude rule set.
    ///
    /// # Errors
    ///
    /// - Return [`Error::ReadExcludeFile`] if the filter file cannot be
    ///   read.
    pub fn current_rules(&self) -> Result<Vec<String>> {
        read_to_string(&self.exclude_path)
            .map_err(|err| Error::ReadExcludeFile {
                source: err,
                exclude_path: self.exclude_path.clone(),
            })
            .map(|content| content.lines().map(str::to_owned).collect::<Vec<_>>())
    }

    /// Match an absolute file path against the current rule set.
    ///
    /// Returns true when the path would be included into a snapshot.
    pub fn path_included(&self, path: impl AsRef<Path>) -> Result<bool> {
        let mut builder = GitignoreBuilder::new("/");
        for rule in self.current_rules()? {
            // Rules are stored in final gitignore form, feed them through.
            let _ = builder.add_line(None, &rule);
        }
        let matcher = builder.build().map_err(|_| Error::ReadExcludeFile {
            source: std::io::Error::other("unparsable exclude rules"),
            exclude_path: self.exclude_path.clone(),
        })?;

        let path = path.as_ref();
        Ok(!matcher
            .matched_path_or_any_parents(path, path.is_dir())
            .is_ignore())
    }

    fn is_fresh(&self) -> bool {
        let exclude = mtime(&self.exclude_path);
        let backups = mtime(&self.backups_path);
        match (exclude, backups) {
            (Some(exclude), Some(backups)) => exclude >= backups,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Exclude rule management error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filter file cannot be created when missing.
    #[error("failed to create exclude file at {:?}", exclude_path.display())]
    CreateExcludeFile {
        #[source]
        source: std::io::Error,
        exclude_path: PathBuf,
    },

    /// Filter file cannot be read from.
    #[error("failed to read from exclude file at {:?}", exclude_path.display())]
    ReadExcludeFile {
        #[source]
        source: std::io::Error,
        exclude_path: PathBuf,
    },

    /// Filter file cannot be written to.
    #[error("failed to write to exclude file at {:?}", exclude_path.display())]
    WriteExcludeFile {
        #[source]
        source: std::io::Error,
        exclude_path: PathBuf,
    },
}

/// Friendly result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::fs;

    fn drafter() -> ExcludeDrafter {
        fs::create_dir_all("store.git/info").unwrap();
        ExcludeDrafter::new("store.git", "store.git/info/backups.toml").unwrap()
    }

    #[sealed_test]
    fn regenerate_excludes_everything_then_reincludes() {
        let drafter = drafter();
        drafter
            .regenerate(&["/data/a".to_string(), "/etc/hosts".to_string()])
            .unwrap();

        let result = fs::read_to_string("store.git/info/exclude").unwrap();
        let expect = indoc! {r#"
            *
            !/data
            !/data/a
            !/etc
            !/etc/hosts
            !/data/a/**
            !/etc/hosts/**
        "#};
        assert_eq!(result, expect);
    }

    #[sealed_test]
    fn regenerate_shares_ancestor_rules() {
        let drafter = drafter();
        drafter
            .regenerate(&["/srv/www/a".to_string(), "/srv/www/b".to_string()])
            .unwrap();

        let result = fs::read_to_string("store.git/info/exclude").unwrap();
        let expect = indoc! {r#"
            *
            !/srv
            !/srv/www
            !/srv/www/a
            !/srv/www/b
            !/srv/www/a/**
            !/srv/www/b/**
        "#};
        assert_eq!(result, expect);
    }

    #[sealed_test]
    fn matcher_includes_entry_descendants_only() {
        let drafter = drafter();
        drafter.regenerate(&["/data/a".to_string()]).unwrap();

        assert!(drafter.path_included("/data/a").unwrap());
        assert!(drafter.path_included("/data/a/deep/file.txt").unwrap());
        assert!(drafter.path_included("/data").unwrap());
        assert!(!drafter.path_included("/data/b").unwrap());
        assert!(!drafter.path_included("/other").unwrap());
    }

    #[sealed_test]
    fn ensure_fresh_skips_regeneration_when_filter_is_newer() {
        let drafter = drafter();
        fs::write("store.git/info/backups.toml", "entries = []\n").unwrap();
        drafter.regenerate(&["/data/a".to_string()]).unwrap();

        // Filter mtime >= backup-set mtime, staleness check must skip.
        drafter.ensure_fresh(&["/changed".to_string()]).unwrap();
        let result = fs::read_to_string("store.git/info/exclude").unwrap();
        assert!(result.contains("!/data/a/**"));
        assert!(!result.contains("/changed"));
    }

    #[sealed_test]
    fn ensure_fresh_regenerates_when_backup_set_is_newer() {
        let drafter = drafter();
        drafter.regenerate(&["/data/a".to_string()]).unwrap();
        // Keep mtimes apart on coarse-grained filesystems.
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write("store.git/info/backups.toml", "entries = [\"/changed\"]\n").unwrap();

        drafter.ensure_fresh(&["/changed".to_string()]).unwrap();
        let result = fs::read_to_string("store.git/info/exclude").unwrap();
        assert!(result.contains("!/changed/**"));
    }
}
