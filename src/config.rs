// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout and persistence.
//!
//! Specify the layout of the repo configuration and backup-set artifacts,
//! and the discipline used to write them.
//!
//! # Layering
//!
//! A loaded configuration is the shallow merge of three layers in
//! increasing priority: built-in defaults, the store-wide shipped defaults
//! file, and the repo-local file at `$gitdir/info/config.toml`. Defaults
//! fill any key absent from persisted state. Keys outside the schema are
//! kept through load/save round trips rather than silently dropped.
//!
//! # Atomic Writes
//!
//! Both persisted artifacts (configuration and backup set) are written to
//! a `.lock` sibling first and renamed over the canonical path, so a
//! reader never observes a partially written file and a crash mid-write
//! leaves the previous version intact.

use crate::entries::BackupSet;

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, read_to_string, rename, write},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Repository format version recorded in `info/VERSION`.
pub const REPO_VERSION: u32 = 2;

/// Repo configuration layout.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RepoConfig {
    /// Named tuning profile the object store is configured with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,

    /// Snapshot count on `master` that trips a rotation.
    #[serde(default = "default_increment_backup_number")]
    pub increment_backup_number: u32,

    /// Capacity of the full-backup ring.
    #[serde(default = "default_full_backup_number")]
    pub full_backup_number: u32,

    /// Commit identity override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,

    /// Backup set recorded by the last successful cycle. Used to stage
    /// removals for entries dropped since then.
    #[serde(default)]
    pub backups: Vec<String>,

    /// Keys outside the schema, preserved across round trips.
    #[serde(flatten)]
    pub extra: toml::Table,
}

fn default_increment_backup_number() -> u32 {
    30
}

fn default_full_backup_number() -> u32 {
    12
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            plan: None,
            increment_backup_number: default_increment_backup_number(),
            full_backup_number: default_full_backup_number(),
            user_name: None,
            user_email: None,
            backups: Vec::new(),
            extra: toml::Table::new(),
        }
    }
}

impl RepoConfig {
    /// Load configuration by merging defaults, the shipped defaults file,
    /// and the repo-local file.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if an existing layer cannot be read.
    /// - Return [`Error::Deserialize`] if a layer is not valid TOML.
    pub fn load(repo_file: &Path, shipped_file: Option<&Path>) -> Result<Self> {
        let mut table: toml::Table =
            toml::de::from_str(&toml::ser::to_string(&Self::default()).map_err(Error::Serialize)?)
                .map_err(Error::Deserialize)?;

        for layer in [shipped_file, Some(repo_file)].into_iter().flatten() {
            if !layer.exists() {
                continue;
            }
            let content = read_to_string(layer).map_err(|err| Error::Io {
                source: err,
                path: layer.to_path_buf(),
            })?;
            let overlay: toml::Table = toml::de::from_str(&content).map_err(Error::Deserialize)?;
            for (key, value) in overlay {
                table.insert(key, value);
            }
        }

        let merged = toml::ser::to_string(&table).map_err(Error::Serialize)?;
        toml::de::from_str(&merged).map_err(Error::Deserialize)
    }

    /// Persist configuration with atomic replace semantics.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if the write or rename step fails.
    pub fn save(&self, repo_file: &Path) -> Result<()> {
        let data = toml::ser::to_string_pretty(self).map_err(Error::Serialize)?;
        atomic_write(repo_file, &data)
    }

    /// Read a schema key as its display string.
    ///
    /// Returns [`None`] for keys outside the schema, which callers pass
    /// through to the object store's own configuration.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "plan" => Some(
                self.plan
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ),
            "increment_backup_number" => Some(self.increment_backup_number.to_string()),
            "full_backup_number" => Some(self.full_backup_number.to_string()),
            "user_name" => Some(self.user_name.clone().unwrap_or_default()),
            "user_email" => Some(self.user_email.clone().unwrap_or_default()),
            "backups" => Some(self.backups.join(" ")),
            _ => None,
        }
    }

    /// Update a schema key from its string form.
    ///
    /// Returns `Ok(false)` for keys outside the schema, which callers
    /// pass through to the object store's own configuration.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidValue`] if the value does not parse for
    ///   the key's type.
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "plan" => {
                self.plan = Some(value.parse().map_err(|_| Error::InvalidValue {
                    key: key.into(),
                    value: value.into(),
                })?)
            }
            "increment_backup_number" => {
                self.increment_backup_number = parse_number(key, value)?
            }
            "full_backup_number" => self.full_backup_number = parse_number(key, value)?,
            "user_name" => self.user_name = Some(value.to_string()),
            "user_email" => self.user_email = Some(value.to_string()),
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Key/value listing for status display, schema keys first.
    pub fn listing(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("plan".to_string(), self.get("plan").unwrap_or_default()),
            (
                "increment_backup_number".to_string(),
                self.increment_backup_number.to_string(),
            ),
            (
                "full_backup_number".to_string(),
                self.full_backup_number.to_string(),
            ),
            (
                "user_name".to_string(),
                self.get("user_name").unwrap_or_default(),
            ),
            (
                "user_email".to_string(),
                self.get("user_email").unwrap_or_default(),
            ),
        ];
        for (key, value) in &self.extra {
            pairs.push((key.clone(), value.to_string()));
        }
        pairs
    }
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value.parse().map_err(|_| Error::InvalidValue {
        key: key.into(),
        value: value.into(),
    })
}

/// Load the persisted backup set, or an empty one when the artifact does
/// not exist yet.
///
/// # Errors
///
/// - Return [`Error::Io`] if an existing artifact cannot be read.
/// - Return [`Error::Deserialize`] if the artifact is not valid TOML.
pub fn load_backups(backups_file: &Path) -> Result<BackupSet> {
    if !backups_file.exists() {
        return Ok(BackupSet::new());
    }
    let content = read_to_string(backups_file).map_err(|err| Error::Io {
        source: err,
        path: backups_file.to_path_buf(),
    })?;
    toml::de::from_str(&content).map_err(Error::Deserialize)
}

/// Persist the backup set with atomic replace semantics.
///
/// # Errors
///
/// - Return [`Error::Io`] if the write or rename step fails.
pub fn save_backups(backups: &BackupSet, backups_file: &Path) -> Result<()> {
    let data = toml::ser::to_string_pretty(backups).map_err(Error::Serialize)?;
    atomic_write(backups_file, &data)
}

/// Read the repository format version artifact.
pub fn read_version(version_file: &Path) -> Option<u32> {
    read_to_string(version_file)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

/// Write the repository format version artifact.
///
/// # Errors
///
/// - Return [`Error::Io`] if the write fails.
pub fn write_version(version_file: &Path) -> Result<()> {
    write(version_file, format!("{REPO_VERSION}\n")).map_err(|err| Error::Io {
        source: err,
        path: version_file.to_path_buf(),
    })
}

fn atomic_write(path: &Path, data: &str) -> Result<()> {
    let io_error = |err| Error::Io {
        source: err,
        path: path.to_path_buf(),
    };

    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(io_error)?;
    }

    let lock_path = PathBuf::from(format!("{}.lock", path.display()));
    write(&lock_path, data.as_bytes()).map_err(io_error)?;
    rename(&lock_path, path).map_err(io_error)?;

    Ok(())
}

/// Named object store tuning profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Plan {
    #[serde(rename = "normal")]
    Normal,

    #[serde(rename = "no-gc")]
    NoGc,

    #[serde(rename = "no-compress")]
    NoCompress,
}

/// Configuration keys applied for every plan.
pub const PLAN_COMMON_SETTINGS: [(&str, &str); 5] = [
    ("core.quotepath", "false"),
    ("core.autocrlf", "false"),
    ("core.logallrefupdates", "true"),
    ("core.sharedrepository", "group"),
    ("core.bigfilethreshold", "2m"),
];

impl Plan {
    /// Configuration keys to set and to unset for this plan.
    pub fn settings(&self) -> (Vec<(&'static str, &'static str)>, Vec<&'static str>) {
        match self {
            Plan::NoGc => (
                vec![
                    ("gc.auto", "0"),
                    ("core.compression", "0"),
                    ("core.loosecompression", "0"),
                ],
                vec![],
            ),
            Plan::NoCompress => (
                vec![("core.compression", "0"), ("core.loosecompression", "0")],
                vec!["gc.auto"],
            ),
            Plan::Normal => (
                vec![],
                vec!["gc.auto", "core.compression", "core.loosecompression"],
            ),
        }
    }
}

impl FromStr for Plan {
    type Err = UnknownPlan;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "normal" => Ok(Plan::Normal),
            "no-gc" | "no_gc" | "nogc" => Ok(Plan::NoGc),
            "no-compress" | "no_compress" | "nocompress" => Ok(Plan::NoCompress),
            _ => Err(UnknownPlan(name.to_string())),
        }
    }
}

impl Display for Plan {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Plan::Normal => fmt.write_str("normal"),
            Plan::NoGc => fmt.write_str("no-gc"),
            Plan::NoCompress => fmt.write_str("no-compress"),
        }
    }
}

/// Plan name outside the closed set.
#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown plan {0:?}, expected normal, no-gc, or no-compress")]
pub struct UnknownPlan(pub String);

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Persisted artifact cannot be read or replaced.
    #[error("failed to access {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Value does not parse for the key's type.
    #[error("invalid value {value:?} for key {key:?}")]
    InvalidValue { key: String, value: String },
}

/// Friendly result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
