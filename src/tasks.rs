// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Task registry.
//!
//! A __task__ is a short name for a backup repo path, recorded in the
//! user-level object store configuration as `ringstore.task.<name>`.
//! Commands accept either form, so scheduled jobs can say
//! `ringstore commit --repo tasks` instead of hardcoding a path.

use git2::Config;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Configuration key namespace of the registry.
const TASK_PREFIX: &str = "ringstore.task.";

/// List every registered task as a name to path mapping.
///
/// # Errors
///
/// - Return [`Error::Git2`] if the configuration cannot be read.
pub fn all() -> Result<BTreeMap<String, String>> {
    let config = Config::open_default()?;
    let mut tasks = BTreeMap::new();
    let mut entries = config.entries(Some(&format!("{TASK_PREFIX}*")))?;
    while let Some(entry) = entries.next() {
        let entry = entry?;
        if let (Some(name), Some(value)) = (entry.name(), entry.value()) {
            tasks.insert(
                name.trim_start_matches(TASK_PREFIX).to_string(),
                value.to_string(),
            );
        }
    }

    Ok(tasks)
}

/// Register a repo path under a task name.
///
/// # Errors
///
/// - Return [`Error::Git2`] if the configuration cannot be written.
pub fn register(name: &str, path: &Path) -> Result<()> {
    let mut config = Config::open_default()?;
    let mut config = config.open_global()?;
    config.set_str(
        &format!("{TASK_PREFIX}{name}"),
        path.to_string_lossy().as_ref(),
    )?;

    Ok(())
}

/// Drop a task name from the registry.
///
/// # Errors
///
/// - Return [`Error::Git2`] if the configuration cannot be written.
pub fn unregister(name: &str) -> Result<()> {
    let mut config = Config::open_default()?;
    let mut config = config.open_global()?;
    config.remove(&format!("{TASK_PREFIX}{name}"))?;

    Ok(())
}

/// Resolve a task name to its registered path.
///
/// # Errors
///
/// - Return [`Error::Git2`] if the configuration cannot be read.
pub fn resolve(name: &str) -> Result<Option<PathBuf>> {
    Ok(all()?.get(name).map(PathBuf::from))
}

/// Reverse lookup: the task name a repo path is registered under.
///
/// Paths are compared symlink-resolved, since the registry commonly holds
/// link spellings.
pub fn find_name(path: &Path) -> Result<Option<String>> {
    let target = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    for (name, registered) in all()? {
        let registered = PathBuf::from(registered);
        let registered = fs::canonicalize(&registered).unwrap_or(registered);
        if registered == target {
            return Ok(Some(name));
        }
    }

    Ok(None)
}

/// Task registry error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
