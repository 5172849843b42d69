// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup repo sessions.
//!
//! A __repo__ is a bare object store plus the state this tool keeps
//! beside it under `info/`: the configuration artifact, the backup-set
//! artifact, the derived exclude filter, the graft override table, and a
//! format version marker. One [`Repo`] value owns that state for the
//! duration of a session and is the only writer of it.
//!
//! The interesting operation is [`Repo::backup`], which runs one snapshot
//! cycle: check whether the full-backup ring needs rotation, drop entries
//! removed since the previous cycle from the index, refresh the exclude
//! filter, stage the current entry set, flatten any nested repositories,
//! classify the staged changes into a summary message, commit, and
//! persist the entry set for the next cycle's comparison.

pub mod rotate;
pub mod store;

use crate::{
    config::{self, Plan, RepoConfig, PLAN_COMMON_SETTINGS, REPO_VERSION},
    entries::BackupSet,
    exclude::ExcludeDrafter,
    path,
    repo::store::{CommitOutcome, Git2Store, Ident, ObjectStore, StatusCode},
    tasks,
};

use std::{
    collections::BTreeMap,
    env,
    fs::create_dir_all,
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// One backup repo session.
pub struct Repo {
    task_name: Option<String>,
    store: Git2Store,
    config: RepoConfig,
    backups: BackupSet,
    drafter: ExcludeDrafter,
    config_file: PathBuf,
    backups_file: PathBuf,
}

/// What one backup cycle did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackupReport {
    pub outcome: CommitOutcome,
    pub changes: usize,
}

impl Repo {
    /// Initialize a new backup repo.
    ///
    /// Creates the bare store with `master` as its initial branch, writes
    /// the format version marker, applies the requested plan (or the
    /// normal one), and persists empty starting state.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Store`] if the path already holds a repository
    ///   or store initialization fails.
    /// - Return [`Error::Config`] if starting state cannot be persisted.
    #[instrument(skip(path), level = "debug")]
    pub fn init(path: impl AsRef<Path>, plan: Option<Plan>) -> Result<Self> {
        info!("initialize backup repo at {:?}", path.as_ref().display());
        let store = Git2Store::init(path.as_ref())?;
        let gitdir = store.gitdir().to_path_buf();
        let info_dir = gitdir.join("info");
        create_dir_all(&info_dir).map_err(|err| Error::CreateInfoDir {
            source: err,
            path: info_dir.clone(),
        })?;
        config::write_version(&info_dir.join("VERSION"))?;

        let backups_file = info_dir.join("backups.toml");
        let drafter = ExcludeDrafter::new(&gitdir, &backups_file)?;
        let mut repo = Self {
            task_name: None,
            store,
            config: RepoConfig::default(),
            backups: BackupSet::new(),
            drafter,
            config_file: info_dir.join("config.toml"),
            backups_file,
        };

        repo.apply_plan(plan.unwrap_or(Plan::Normal))?;
        config::save_backups(&repo.backups, &repo.backups_file)?;
        repo.drafter.regenerate(&[])?;

        Ok(repo)
    }

    /// Open an existing backup repo by path or task name.
    ///
    /// A path that exists on disk wins; otherwise the name is resolved
    /// through the task registry. The exclude filter is regenerated
    /// unconditionally, because symlinked entry targets may have moved
    /// since the filter was written.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidRepo`] if nothing resolves.
    /// - Return [`Error::UnsupportedVersion`] if the repo was written by
    ///   a newer format.
    #[instrument(level = "debug")]
    pub fn open(name: &str) -> Result<Self> {
        let path = if Path::new(name).is_dir() {
            PathBuf::from(name)
        } else {
            match tasks::resolve(name) {
                Ok(Some(path)) if path.is_dir() => path,
                _ => return Err(Error::InvalidRepo(name.to_string())),
            }
        };

        let store = Git2Store::open(&path).map_err(|_| Error::InvalidRepo(name.to_string()))?;
        let gitdir = store.gitdir().to_path_buf();
        let info_dir = gitdir.join("info");
        if let Some(found) = config::read_version(&info_dir.join("VERSION")) {
            if found > REPO_VERSION {
                return Err(Error::UnsupportedVersion { found });
            }
        }

        let shipped = path::shipped_defaults_file().ok();
        let config_file = info_dir.join("config.toml");
        let backups_file = info_dir.join("backups.toml");
        let config = RepoConfig::load(&config_file, shipped.as_deref())?;
        let backups = config::load_backups(&backups_file)?;
        let drafter = ExcludeDrafter::new(&gitdir, &backups_file)?;
        let task_name = tasks::find_name(&gitdir).ok().flatten();

        let repo = Self {
            task_name,
            store,
            config,
            backups,
            drafter,
            config_file,
            backups_file,
        };
        let staging = repo.backups.staging_set(repo.store.gitdir());
        repo.drafter.regenerate(&staging)?;

        Ok(repo)
    }

    /// Add entries to the backup set. Rejections are diagnostics, not
    /// errors; accepted entries are returned in canonical form.
    pub fn add_entries(
        &mut self,
        raws: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Vec<String> {
        let gitdir = self.store.gitdir().to_path_buf();
        raws.into_iter()
            .filter_map(|raw| self.backups.add(raw.as_ref(), &gitdir))
            .collect()
    }

    /// Remove entries from the backup set.
    pub fn remove_entries(&mut self, raws: impl IntoIterator<Item = impl AsRef<str>>) {
        for raw in raws {
            self.backups.remove(raw.as_ref());
        }
    }

    /// Finalize and persist the backup set.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if the artifact cannot be replaced.
    pub fn save_entries(&mut self) -> Result<()> {
        let gitdir = self.store.gitdir().to_path_buf();
        self.backups = self.backups.finalize(&gitdir);
        config::save_backups(&self.backups, &self.backups_file)?;

        Ok(())
    }

    /// Run one backup cycle.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Rotate`] if ring rotation fails partway; the
    ///   cycle aborts without committing.
    /// - Return [`Error::Store`] if staging or committing fails.
    #[instrument(skip(self, user_message), level = "debug")]
    pub fn backup(&mut self, user_message: Option<&str>) -> Result<BackupReport> {
        let gitdir = self.store.gitdir().to_path_buf();
        let finalized = self.backups.finalize(&gitdir);
        let label = self.label();

        let rotation = rotate::rotate(
            &self.store,
            &label,
            &finalized.entries,
            self.config.increment_backup_number,
            self.config.full_backup_number,
        )?;
        if rotation.rotated {
            info!(
                "rotated full backup ring to {} slots, evicted [{}]",
                rotation.slot_count,
                rotation.evicted.join(", ")
            );
        }

        // Entries dropped since the previous cycle leave the index first.
        let staging = self.backups.staging_set(&gitdir);
        for old in &self.config.backups {
            if !staging.contains(old) {
                self.store.unstage(old)?;
            }
        }

        self.drafter.regenerate(&staging)?;
        for entry in &staging {
            self.store.stage(entry)?;
        }
        self.store.stage_all_changes()?;

        let flattened = self.store.flatten_nested_repos()?;
        if !flattened.is_empty() {
            info!(
                "backed up nested repositories as plain content: {}",
                flattened.join(", ")
            );
        }

        let status = self.store.read_status(&staging)?;
        let message = compose_message(user_message, &status);
        let identity = self.identity()?;
        let outcome = self.store.commit_staged(&message, &identity)?;

        self.config.backups = staging;
        self.config.save(&self.config_file)?;

        Ok(BackupReport {
            outcome,
            changes: status.len(),
        })
    }

    /// Classified pending changes for the current entry set.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Store`] if status cannot be read.
    pub fn changes(&self) -> Result<Vec<(StatusCode, String)>> {
        let staging = self.backups.staging_set(self.store.gitdir());
        Ok(self.store.read_status(&staging)?)
    }

    /// Read a configuration key, schema first, store configuration as the
    /// fallthrough.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Store`] if the store configuration cannot be
    ///   read.
    pub fn config_value(&self, key: &str) -> Result<Option<String>> {
        match self.config.get(key) {
            Some(value) => Ok(Some(value)),
            None => Ok(self.store.config_get(key)?),
        }
    }

    /// Update a configuration key, schema first, store configuration as
    /// the fallthrough. Setting `plan` also re-applies its settings.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if the value does not parse or the
    ///   artifact cannot be replaced.
    /// - Return [`Error::Store`] if the store configuration cannot be
    ///   written.
    pub fn set_config_value(&mut self, key: &str, value: &str) -> Result<()> {
        if self.config.set(key, value)? {
            if let ("plan", Some(plan)) = (key, self.config.plan) {
                self.apply_plan(plan)?;
            } else {
                self.config.save(&self.config_file)?;
            }
        } else {
            warn!("key {key} outside schema, passing through to store configuration");
            self.store.config_set(key, value)?;
        }

        Ok(())
    }

    /// Apply a named plan: common tuning keys plus the plan's own set and
    /// unset lists, then record the plan.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Store`] if the store configuration cannot be
    ///   written.
    /// - Return [`Error::Config`] if the plan cannot be recorded.
    pub fn apply_plan(&mut self, plan: Plan) -> Result<()> {
        for (key, value) in PLAN_COMMON_SETTINGS {
            self.store.config_set(key, value)?;
        }
        let (sets, unsets) = plan.settings();
        for (key, value) in sets {
            self.store.config_set(key, value)?;
        }
        for key in unsets {
            self.store.config_unset(key)?;
        }

        self.config.plan = Some(plan);
        self.config.save(&self.config_file)?;

        Ok(())
    }

    /// Registered task name, when the repo has one.
    pub fn task_name(&self) -> Option<&str> {
        self.task_name.as_deref()
    }

    /// Absolute path of the store directory.
    pub fn gitdir(&self) -> &Path {
        self.store.gitdir()
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupSet {
        &self.backups
    }

    /// Short label for commit messages: task name or store basename.
    pub fn label(&self) -> String {
        self.task_name.clone().unwrap_or_else(|| {
            self.store
                .gitdir()
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.store.gitdir().display().to_string())
        })
    }

    /// Human-facing repo designation for reporting.
    pub fn display_name(&self) -> String {
        match &self.task_name {
            Some(task) => format!("{task} ({})", self.store.gitdir().display()),
            None => self.store.gitdir().display().to_string(),
        }
    }

    fn identity(&self) -> Result<Ident> {
        let name = match &self.config.user_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => match self.store.config_get("user.name")? {
                Some(name) if !name.is_empty() => name,
                _ => env::var("USER")
                    .or_else(|_| env::var("USERNAME"))
                    .unwrap_or_else(|_| "unknown".to_string()),
            },
        };
        let email = match &self.config.user_email {
            Some(email) if !email.is_empty() => email.clone(),
            _ => match self.store.config_get("user.email")? {
                Some(email) if !email.is_empty() => email,
                _ => "none".to_string(),
            },
        };

        Ok(Ident { name, email })
    }
}

fn compose_message(user_message: Option<&str>, status: &[(StatusCode, String)]) -> String {
    let mut message = String::new();
    if let Some(user) = user_message {
        message.push_str(user.trim());
    }
    if !message.is_empty() {
        message.push_str("\n\n");
    }
    message.push_str(&commit_summary(status));
    message
}

/// Statistics block for the snapshot commit message: total line, then up
/// to two spread samples per status code with a count of the rest.
fn commit_summary(status: &[(StatusCode, String)]) -> String {
    const SAMPLE: usize = 2;

    let mut statistics: BTreeMap<StatusCode, Vec<&str>> = BTreeMap::new();
    for (code, path) in status {
        statistics.entry(*code).or_default().push(path);
    }

    let total = status.len();
    let detail = statistics
        .iter()
        .map(|(code, paths)| format!("{code}: {}", paths.len()))
        .collect::<Vec<_>>()
        .join(", ");

    let mut output = vec![
        format!(
            "Backup {total} item{} ({detail})",
            if total > 1 { "s" } else { "" }
        ),
        String::new(),
    ];
    for (code, paths) in &statistics {
        let buffer = if paths.len() > SAMPLE {
            let step = paths.len() / SAMPLE;
            let mut buffer = (0..SAMPLE)
                .map(|i| paths[step * i].to_string())
                .collect::<Vec<_>>();
            buffer.push(format!("...{} more...", paths.len() - SAMPLE));
            buffer
        } else {
            paths.iter().map(|path| path.to_string()).collect()
        };
        output.push(format!("  {code} => {}", buffer.join(", ")));
    }

    output.join("\n")
}

/// Repo session error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Nothing resolves to a backup repo.
    #[error("can not find repo at {0:?}")]
    InvalidRepo(String),

    /// Repo written by a newer format than this build supports.
    #[error("repo format version {found} is newer than supported {REPO_VERSION}")]
    UnsupportedVersion { found: u32 },

    /// State directory cannot be created.
    #[error("failed to create state directory at {:?}", path.display())]
    CreateInfoDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Object store operations fail.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Ring rotation fails.
    #[error(transparent)]
    Rotate(#[from] rotate::Error),

    /// Persisted state access fails.
    #[error(transparent)]
    Config(#[from] config::Error),

    /// Exclude filter manipulation fails.
    #[error(transparent)]
    Exclude(#[from] crate::exclude::Error),
}

/// Friendly result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::fs;

    #[sealed_test]
    fn init_writes_starting_state() {
        Repo::init("store.git", None).unwrap();

        assert_eq!(
            fs::read_to_string("store.git/HEAD").unwrap().trim(),
            "ref: refs/heads/master"
        );
        assert_eq!(
            config::read_version(Path::new("store.git/info/VERSION")),
            Some(REPO_VERSION)
        );
        assert!(Path::new("store.git/info/config.toml").exists());
        assert!(Path::new("store.git/info/backups.toml").exists());
        assert_eq!(
            fs::read_to_string("store.git/info/exclude").unwrap(),
            "*\n"
        );

        let content = fs::read_to_string("store.git/info/config.toml").unwrap();
        assert!(content.contains("plan = \"normal\""));
        assert!(content.contains("increment_backup_number = 30"));
        assert!(content.contains("full_backup_number = 12"));
    }

    #[sealed_test]
    fn init_applies_plan_to_store_configuration() {
        let repo = Repo::init("store.git", Some(Plan::NoGc)).unwrap();
        assert_eq!(
            repo.config_value("gc.auto").unwrap(),
            Some("0".to_string())
        );
        assert_eq!(
            repo.config_value("core.autocrlf").unwrap(),
            Some("false".to_string())
        );
        assert_eq!(repo.config_value("plan").unwrap(), Some("no-gc".to_string()));
    }

    #[sealed_test]
    fn add_and_save_entries_persists_finalized_set() {
        let mut repo = Repo::init("store.git", None).unwrap();
        let data = fs::canonicalize(".").unwrap().join("data");
        fs::create_dir_all(data.join("a")).unwrap();

        let root = data.display().to_string();
        let added = repo.add_entries([root.clone(), format!("{root}/a")]);
        assert_eq!(added.len(), 2);
        repo.save_entries().unwrap();

        // Prefix dedup keeps only the covering entry.
        assert_eq!(repo.backups().entries, vec![root.clone()]);
        let persisted = fs::read_to_string("store.git/info/backups.toml").unwrap();
        assert!(persisted.contains(&root));
        assert!(!persisted.contains(&format!("{root}/a\"")));
    }

    #[sealed_test]
    fn entries_inside_the_store_are_rejected() {
        let mut repo = Repo::init("store.git", None).unwrap();
        let inside = fs::canonicalize("store.git").unwrap().join("objects");
        assert!(repo.add_entries([inside.display().to_string()]).is_empty());
        assert!(repo.backups().is_empty());
    }

    #[sealed_test]
    fn unknown_config_keys_pass_through_to_the_store() {
        let mut repo = Repo::init("store.git", None).unwrap();
        repo.set_config_value("core.bigfilethreshold", "4m").unwrap();
        assert_eq!(
            repo.config_value("core.bigfilethreshold").unwrap(),
            Some("4m".to_string())
        );

        repo.set_config_value("full_backup_number", "4").unwrap();
        let reopened = Repo::open("store.git").unwrap();
        assert_eq!(reopened.config().full_backup_number, 4);
    }

    #[sealed_test]
    fn open_rejects_newer_format_version() {
        Repo::init("store.git", None).unwrap();
        fs::write("store.git/info/VERSION", format!("{}\n", REPO_VERSION + 1)).unwrap();
        assert!(matches!(
            Repo::open("store.git"),
            Err(Error::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn commit_summary_samples_large_groups() {
        let status = vec![
            (StatusCode::Added, "etc/a".to_string()),
            (StatusCode::Added, "etc/b".to_string()),
            (StatusCode::Added, "etc/c".to_string()),
            (StatusCode::Added, "etc/d".to_string()),
            (StatusCode::Deleted, "var/x".to_string()),
        ];
        let summary = commit_summary(&status);
        assert!(summary.starts_with("Backup 5 items (A: 4, D: 1)"));
        assert!(summary.contains("...2 more..."));
        assert!(summary.contains("  D => var/x"));
    }

    #[test]
    fn compose_message_puts_user_text_first() {
        let status = vec![(StatusCode::Added, "etc/a".to_string())];
        let message = compose_message(Some("nightly run"), &status);
        assert!(message.starts_with("nightly run\n\nBackup 1 item (A: 1)"));
    }
}
