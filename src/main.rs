// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use ringstore::{
    config::Plan,
    repo::{store::CommitOutcome, Repo},
    tasks,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  ringstore [options] <ringstore-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(opts),
            Command::Add(opts) => run_add(opts),
            Command::Rm(opts) => run_rm(opts),
            Command::Status(opts) => run_status(opts),
            Command::Commit(opts) => run_commit(opts),
            Command::Config(opts) => run_config(opts),
            Command::Task(opts) => run_task(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Initialize a new backup repo.
    #[command(override_usage = "ringstore init [options] [path]")]
    Init(InitOptions),

    /// Add paths to the backup entry set.
    #[command(override_usage = "ringstore add [options] <path>...")]
    Add(EntryOptions),

    /// Remove paths from the backup entry set.
    #[command(override_usage = "ringstore rm [options] <path>...")]
    Rm(EntryOptions),

    /// Show configuration, entry set, and pending changes.
    #[command(override_usage = "ringstore status [options]")]
    Status(StatusOptions),

    /// Run one backup cycle (i.e. commit a snapshot).
    #[command(
        visible_aliases = ["backup", "ci"],
        override_usage = "ringstore commit [options] [-m <message>]"
    )]
    Commit(CommitOptions),

    /// Read or update repo configuration.
    #[command(override_usage = "ringstore config [options] [<key>] [<value>]")]
    Config(ConfigOptions),

    /// Manage the set of registered backup tasks.
    Task(TaskOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Path of the backup repo to create.
    #[arg(value_name = "path", default_value = ".")]
    pub path: PathBuf,

    /// Object store tuning plan: no-gc, no-compress, or normal (default).
    #[arg(short, long, value_name = "plan")]
    pub plan: Option<Plan>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct EntryOptions {
    /// Backup repo to operate on, by path or task name.
    #[arg(short, long, value_name = "repo", default_value = ".")]
    pub repo: String,

    /// Paths to add or remove.
    #[arg(required = true, value_name = "path")]
    pub paths: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    /// Backup repo to operate on, by path or task name.
    #[arg(short, long, value_name = "repo", default_value = ".")]
    pub repo: String,

    /// Show only the configuration listing.
    #[arg(group = "target", short, long)]
    pub config: bool,

    /// Show only the backup entry listing.
    #[arg(group = "target", short, long)]
    pub backups: bool,

    /// Show only pending changes.
    #[arg(group = "target", long)]
    pub changes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CommitOptions {
    /// Backup repo to operate on, by path or task name.
    #[arg(short, long, value_name = "repo", default_value = ".")]
    pub repo: String,

    /// Commit log to put in front of the generated summary.
    #[arg(short, long, value_name = "message")]
    pub message: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ConfigOptions {
    /// Backup repo to operate on, by path or task name.
    #[arg(short, long, value_name = "repo", default_value = ".")]
    pub repo: String,

    /// Apply a tuning plan: no-gc, no-compress, or normal.
    #[arg(short, long, value_name = "plan")]
    pub plan: Option<Plan>,

    /// Key to read or update.
    #[arg(value_name = "key")]
    pub key: Option<String>,

    /// New value for the key.
    #[arg(value_name = "value")]
    pub value: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct TaskOptions {
    #[command(subcommand)]
    pub command: TaskCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum TaskCommand {
    /// Register a repo path under a task name.
    Add {
        #[arg(value_name = "task")]
        name: String,

        #[arg(value_name = "path", default_value = ".")]
        path: PathBuf,
    },

    /// Drop a task name from the registry.
    Rm {
        #[arg(value_name = "task")]
        name: String,
    },

    /// Display the task registry.
    List,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_init(opts: InitOptions) -> Result<()> {
    Repo::init(&opts.path, opts.plan)?;

    Ok(())
}

fn run_add(opts: EntryOptions) -> Result<()> {
    let mut repo = Repo::open(&opts.repo)?;
    for entry in repo.add_entries(&opts.paths) {
        info!("add entry {entry}");
    }
    repo.save_entries()?;

    Ok(())
}

fn run_rm(opts: EntryOptions) -> Result<()> {
    let mut repo = Repo::open(&opts.repo)?;
    repo.remove_entries(&opts.paths);
    repo.save_entries()?;

    Ok(())
}

fn run_status(opts: StatusOptions) -> Result<()> {
    let repo = Repo::open(&opts.repo)?;
    let all = !opts.config && !opts.backups && !opts.changes;

    if all || opts.config {
        println!("Task name : {}", repo.task_name().unwrap_or("-"));
        println!("Repo      : {}", repo.gitdir().display());
        println!("Configurations:");
        for (key, value) in repo.config().listing() {
            println!("    {key}: {value}");
        }
        println!();
    }

    if all || opts.backups {
        println!("Backup entries:");
        for entry in &repo.backups().entries {
            println!("    {entry}");
        }
        println!();
    }

    if all || opts.changes {
        println!("Pending changes:");
        for (code, path) in repo.changes()? {
            println!("    {code} {path}");
        }
    }

    Ok(())
}

fn run_commit(opts: CommitOptions) -> Result<()> {
    let mut repo = Repo::open(&opts.repo)?;
    let report = repo.backup(opts.message.as_deref())?;
    match report.outcome {
        CommitOutcome::Committed(_) => {
            info!("successfully backup repo: {}", repo.display_name());
        }
        CommitOutcome::NoChanges => {
            info!("nothing changed for repo: {}", repo.display_name());
        }
    }

    Ok(())
}

fn run_config(opts: ConfigOptions) -> Result<()> {
    let mut repo = Repo::open(&opts.repo)?;
    if let Some(plan) = opts.plan {
        repo.apply_plan(plan)?;
        return Ok(());
    }

    match (opts.key, opts.value) {
        (None, _) => {
            for (key, value) in repo.config().listing() {
                println!("{key}: {value}");
            }
        }
        (Some(key), None) => match repo.config_value(&key)? {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("no such configuration key {key:?}"),
        },
        (Some(key), Some(value)) => repo.set_config_value(&key, &value)?,
    }

    Ok(())
}

fn run_task(opts: TaskOptions) -> Result<()> {
    match opts.command {
        TaskCommand::Add { name, path } => {
            let path = path.canonicalize()?;
            tasks::register(&name, &path)?;
        }
        TaskCommand::Rm { name } => tasks::unregister(&name)?,
        TaskCommand::List => {
            for (name, path) in tasks::all()? {
                println!("{name} => {path}");
            }
        }
    }

    Ok(())
}
