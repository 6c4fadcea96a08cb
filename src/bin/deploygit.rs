// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use deploygit::{
    config::Settings,
    path::default_settings_path,
    sync::remote::repo_dir_name,
    transplant::is_non_empty_dir,
    CancelHandle, GitSync, PatchStore, Progress, RepositoryHandle, Toggle, WorktreeLedger,
};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Confirm;
use std::{env::current_dir, path::PathBuf, process::exit, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "deploygit [options] <deploygit-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self, cancel: CancelHandle) -> Result<()> {
        let settings_path = default_settings_path()?;
        let settings = Settings::load(&settings_path)?;

        match self.command {
            Command::Clone(opts) => run_clone(opts, settings, settings_path, cancel).await,
            Command::Update(opts) => run_update(opts, settings, cancel).await,
            Command::Skip(opts) => run_skip(opts, settings, cancel).await,
            Command::Protect(opts) => run_protect(opts, settings),
            Command::Reapply(opts) => run_reapply(opts, settings),
            Command::Config(opts) => run_config(opts, settings, settings_path),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Clone remote repository into install folder.
    #[command(override_usage = "deploygit clone [options] [<url>] [<dest>]")]
    Clone(CloneOptions),

    /// Update existing checkout from its upstream.
    #[command(override_usage = "deploygit update [options] [<repo>]")]
    Update(UpdateOptions),

    /// Toggle skip-worktree protection of tracked file.
    #[command(override_usage = "deploygit skip [options] <path>")]
    Skip(SkipOptions),

    /// Capture function body so it survives updates.
    #[command(override_usage = "deploygit protect [options] <file> <function>")]
    Protect(ProtectOptions),

    /// Reapply all protected function bodies.
    #[command(override_usage = "deploygit reapply [options]")]
    Reapply(ReapplyOptions),

    /// Show or change saved settings.
    #[command(override_usage = "deploygit config [options]")]
    Config(ConfigOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CloneOptions {
    /// URL of remote to clone from.
    #[arg(value_name = "url")]
    pub url: Option<String>,

    /// Destination directory of checkout.
    #[arg(value_name = "dest")]
    pub dest: Option<PathBuf>,

    /// Private key to use for SSH transport.
    #[arg(short, long, value_name = "path")]
    pub key: Option<PathBuf>,

    /// Replace non-empty destination without asking.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UpdateOptions {
    /// Path to checkout to update.
    #[arg(value_name = "repo")]
    pub repo: Option<PathBuf>,

    /// Private key to use for SSH transport.
    #[arg(short, long, value_name = "path")]
    pub key: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SkipOptions {
    /// Path of tracked file relative to repository root.
    #[arg(required = true, value_name = "path")]
    pub path: PathBuf,

    /// Force protection on.
    #[arg(long, group = "mode")]
    pub on: bool,

    /// Force protection off.
    #[arg(long, group = "mode")]
    pub off: bool,

    /// Path to checkout.
    #[arg(short, long, value_name = "repo")]
    pub repo: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ProtectOptions {
    /// Path of source file relative to repository root.
    #[arg(required = true, value_name = "file")]
    pub file: String,

    /// Name of function whose body to capture.
    #[arg(required = true, value_name = "function")]
    pub function: String,

    /// Path to checkout.
    #[arg(short, long, value_name = "repo")]
    pub repo: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ReapplyOptions {
    /// Path to checkout.
    #[arg(short, long, value_name = "repo")]
    pub repo: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ConfigOptions {
    /// Set URL of remote repository.
    #[arg(short, long, value_name = "url")]
    pub url: Option<String>,

    /// Set install folder.
    #[arg(short, long, value_name = "path")]
    pub folder: Option<PathBuf>,

    /// Set private key for SSH transport.
    #[arg(short, long, value_name = "path")]
    pub key: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    let cancel = CancelHandle::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling current git command");
            watcher.cancel();
        }
    });

    Cli::parse().run(cancel).await
}

async fn run_clone(
    opts: CloneOptions,
    mut settings: Settings,
    settings_path: PathBuf,
    cancel: CancelHandle,
) -> Result<()> {
    let url = opts
        .url
        .or_else(|| settings.remote_url.clone())
        .ok_or_else(|| anyhow!("no remote url given, and none saved"))?;
    let dest = match opts.dest.or_else(|| settings.install_folder.clone()) {
        Some(dest) => dest,
        None => current_dir()?.join(repo_dir_name(&url)),
    };
    let key = opts.key.or_else(|| settings.private_key.clone());

    if is_non_empty_dir(&dest) && !opts.yes {
        let prompt = format!("{:?} is not empty, delete its contents?", dest.display());
        if !Confirm::new(&prompt).with_default(false).prompt()? {
            bail!("clone aborted, destination left untouched");
        }
    }

    let bar = progress_bar(&url)?;
    let sink = |line: &str| bar.suspend(|| info!("{line}"));
    let report = |percent: u8| bar.set_position(percent.into());
    let handle = GitSync::new(&sink, cancel)
        .clone_repository(&url, &dest, key.as_deref(), Some(&report as &dyn Progress))
        .await;
    bar.finish_and_clear();
    let handle = handle?;
    info!("cloned {url} into {:?}", handle.local_path.display());

    settings.remote_url = Some(url);
    settings.install_folder = Some(handle.local_path);
    settings.private_key = handle.transport_key;
    settings.save(settings_path)?;

    Ok(())
}

async fn run_update(opts: UpdateOptions, settings: Settings, cancel: CancelHandle) -> Result<()> {
    let repo = repo_or_saved(opts.repo, &settings)?;
    let key = opts.key.or(settings.private_key);
    let handle = RepositoryHandle::new(&repo).with_transport_key(key);

    let bar = progress_bar(&repo.display().to_string())?;
    let sink = |line: &str| bar.suspend(|| info!("{line}"));
    let report = |percent: u8| bar.set_position(percent.into());
    let result = GitSync::new(&sink, cancel)
        .update(&handle, Some(&report as &dyn Progress))
        .await;
    bar.finish_and_clear();
    let report = result?;

    if !report.stash_restored {
        warn!("local changes are still stashed, run git stash pop by hand");
    }
    info!(
        "updated by {}, reapplied {} protected function(s), skipped {}",
        report.integration,
        report.reapplied.applied,
        report.reapplied.skipped.len()
    );

    Ok(())
}

async fn run_skip(opts: SkipOptions, settings: Settings, cancel: CancelHandle) -> Result<()> {
    let repo = repo_or_saved(opts.repo, &settings)?;
    let toggle = if opts.on {
        Toggle::Protect
    } else if opts.off {
        Toggle::Unprotect
    } else {
        Toggle::Flip
    };

    let sink = |line: &str| info!("{line}");
    let state = WorktreeLedger::new(repo, &sink, cancel)
        .toggle(&opts.path, toggle)
        .await?;
    info!("{:?} is {state}", opts.path.display());

    Ok(())
}

fn run_protect(opts: ProtectOptions, settings: Settings) -> Result<()> {
    let repo = repo_or_saved(opts.repo, &settings)?;
    let record = PatchStore::open(repo).protect(&opts.file, &opts.function)?;
    info!("stored body of {} as {}", record.function, record.artifact);

    Ok(())
}

fn run_reapply(opts: ReapplyOptions, settings: Settings) -> Result<()> {
    let repo = repo_or_saved(opts.repo, &settings)?;
    let summary = PatchStore::open(repo).reapply_all()?;
    if summary.reconstructed {
        warn!("index was missing, records were reconstructed (best-effort)");
    }
    info!(
        "reapplied {} protected function(s), skipped {}",
        summary.applied,
        summary.skipped.len()
    );

    Ok(())
}

fn run_config(opts: ConfigOptions, mut settings: Settings, settings_path: PathBuf) -> Result<()> {
    let changed = opts.url.is_some() || opts.folder.is_some() || opts.key.is_some();
    if let Some(url) = opts.url {
        settings.remote_url = Some(url);
    }
    if let Some(folder) = opts.folder {
        settings.install_folder = Some(folder);
    }
    if let Some(key) = opts.key {
        settings.private_key = Some(key);
    }

    if changed {
        settings.save(&settings_path)?;
    }
    println!("# {}", settings_path.display());
    print!("{settings}");

    Ok(())
}

fn repo_or_saved(repo: Option<PathBuf>, settings: &Settings) -> Result<PathBuf> {
    repo.or_else(|| settings.install_folder.clone())
        .ok_or_else(|| anyhow!("no repository given, and no install folder saved"))
}

fn progress_bar(msg: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}] {pos:>3}%",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(msg.to_owned());
    bar.enable_steady_tick(Duration::from_millis(100));

    Ok(bar)
}
