// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository synchronization.
//!
//! Brings a deployment's checkout of a web application repository into
//! existence, and keeps it up to date afterwards.
//!
//! # Cloning
//!
//! A clone never happens directly inside the destination directory. Instead,
//! Git clones into a fresh __staging root__ inside the system's temporary
//! directory. Only once that clone succeeds is the destination cleared, and
//! the staged repository moved into place. Thus, a failed clone never leaves
//! behind a half populated destination. The staging root is always removed,
//! whether the clone succeeded or not.
//!
//! # Updating
//!
//! Updates run a fixed sequence of Git commands, each strictly after the
//! previous one finished:
//!
//! 1. Check working tree status. Stash any local modification, including
//!    untracked files.
//! 2. Fetch all remotes, pruning stale references.
//! 3. Fast-forward onto the upstream tracking branch.
//! 4. If that fails, fall back to pulling with rebase.
//! 5. Pop the stash from step 1, if one was made.
//! 6. Reapply every protected function body.
//!
//! Conflicts are never resolved automatically. They are reported through the
//! log sink, and left for the operator to sort out.
//!
//! # See Also
//!
//! - [`PatchStore`]
//! - [`TransportBinding`]

pub mod remote;

use crate::{
    patch::{PatchError, PatchStore, ReapplySummary},
    process::{CancelHandle, CommandOutput, Invocation, LogSink},
    transplant,
    transport::TransportBinding,
};

use git2::Repository;
use std::{
    cell::Cell,
    ffi::OsString,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Prefix of staging root directories.
pub const STAGING_PREFIX: &str = "deploygit_clone_";

/// Percentage reported once the staged clone finished.
pub const PROGRESS_CLONED: u8 = 60;

/// Percentage reported once fetching finished.
pub const PROGRESS_FETCHED: u8 = 40;

/// Progress reporting callback.
///
/// Receives percentages in [0, 100] that never decrease within one
/// operation.
pub trait Progress {
    /// Report current percentage.
    fn report(&self, percent: u8);
}

impl<F> Progress for F
where
    F: Fn(u8),
{
    fn report(&self, percent: u8) {
        self(percent)
    }
}

// Clamp reports so that callers only ever see a monotonic sequence.
struct ProgressTracker<'a> {
    inner: Option<&'a dyn Progress>,
    last: Cell<u8>,
}

impl<'a> ProgressTracker<'a> {
    fn new(inner: Option<&'a dyn Progress>) -> Self {
        Self {
            inner,
            last: Cell::new(0),
        }
    }

    fn report(&self, percent: u8) {
        let percent = percent.min(100).max(self.last.get());
        self.last.set(percent);
        if let Some(inner) = self.inner {
            inner.report(percent);
        }
    }
}

/// Local checkout of remote repository.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepositoryHandle {
    /// Path to working tree of checkout.
    pub local_path: PathBuf,

    /// URL of remote that was cloned, if known.
    pub remote_url: Option<String>,

    /// Private key used for SSH transport, if any.
    pub transport_key: Option<PathBuf>,
}

impl RepositoryHandle {
    /// Construct new handle for existing checkout.
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            ..Default::default()
        }
    }

    /// Use private key for SSH transport.
    pub fn with_transport_key(mut self, key: Option<impl Into<PathBuf>>) -> Self {
        self.transport_key = key.map(Into::into);
        self
    }
}

/// How upstream changes were integrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integration {
    /// Upstream was reachable by fast-forward.
    FastForward,

    /// Fast-forward failed, and local commits were rebased onto upstream.
    Rebased,
}

impl Display for Integration {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::FastForward => fmt.write_str("fast-forward"),
            Self::Rebased => fmt.write_str("rebase"),
        }
    }
}

/// Outcome of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// Local modifications were stashed before updating.
    pub stashed: bool,

    /// How upstream changes were integrated.
    pub integration: Integration,

    /// Stash was popped cleanly, always true if nothing was stashed.
    pub stash_restored: bool,

    /// Outcome of reapplying protected function bodies.
    pub reapplied: ReapplySummary,
}

/// Git synchronization engine.
///
/// Runs one workflow at a time. Running two workflows against the same
/// repository path concurrently is not supported.
#[derive(Clone)]
pub struct GitSync<'a> {
    sink: &'a dyn LogSink,
    cancel: CancelHandle,
    staging_parent: Option<PathBuf>,
}

impl<'a> GitSync<'a> {
    /// Construct new synchronization engine.
    ///
    /// All command output and progress messages go to `sink`. Cancelling
    /// `cancel` kills the Git command that is currently running.
    pub fn new(sink: &'a dyn LogSink, cancel: CancelHandle) -> Self {
        Self {
            sink,
            cancel,
            staging_parent: None,
        }
    }

    /// Create staging roots inside `dir` instead of the system's temporary
    /// directory.
    pub fn staging_in(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_parent = Some(dir.into());
        self
    }

    /// Clone remote repository into destination directory.
    ///
    /// Web transport URLs are rewritten into SSH form first. If `dest` is
    /// non-empty it is __deleted__ once the staged clone succeeded, so the
    /// caller must have gotten the operator's consent beforehand.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Transport`] if the clone command fails. The
    ///   destination is left untouched in this case.
    /// - Return [`SyncError::Staging`] if the staging root cannot be created.
    /// - Return [`SyncError::Transplant`] if the destination cannot be
    ///   cleared, or the staged clone cannot be moved into it.
    /// - Return [`SyncError::Process`] if Git cannot be run, or was cancelled.
    #[instrument(skip(self, url, dest, key, progress), level = "debug")]
    pub async fn clone_repository(
        &self,
        url: impl AsRef<str>,
        dest: impl AsRef<Path>,
        key: Option<&Path>,
        progress: Option<&dyn Progress>,
    ) -> Result<RepositoryHandle> {
        let progress = ProgressTracker::new(progress);
        progress.report(0);

        let url = url.as_ref();
        let dest = dest.as_ref();
        let ssh_url = remote::ssh_url(url);
        let repo_name = remote::repo_dir_name(url);

        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX);
        let staging = match &self.staging_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(SyncError::Staging)?;
        let staged_repo = staging.path().join(&repo_name);
        debug!("staging root {:?}", staging.path().display());

        let result = self
            .clone_staged(&ssh_url, &staged_repo, dest, key, &progress)
            .await;

        // INVARIANT: Staging root goes away no matter how the clone went.
        if let Err(err) = transplant::remove_dir_retrying(staging.path(), self.sink).await {
            warn!("failed to remove staging root: {err}");
        }
        drop(staging);
        result?;

        progress.report(100);
        self.sink.line("clone and move complete");

        Ok(RepositoryHandle {
            local_path: dest.to_path_buf(),
            remote_url: Some(url.to_owned()),
            transport_key: key.map(Path::to_path_buf),
        })
    }

    async fn clone_staged(
        &self,
        ssh_url: &str,
        staged_repo: &Path,
        dest: &Path,
        key: Option<&Path>,
        progress: &ProgressTracker<'_>,
    ) -> Result<()> {
        self.sink.line(&format!(
            "cloning {ssh_url} into {}",
            staged_repo.display()
        ));
        let args: [OsString; 3] = ["clone".into(), ssh_url.into(), staged_repo.into()];
        let output = self.git(None, key, args).await?;
        self.require(&output, "clone")?;
        progress.report(PROGRESS_CLONED);

        if transplant::is_non_empty_dir(dest) {
            self.sink
                .line(&format!("clearing destination {}", dest.display()));
            transplant::remove_dir_retrying(dest, self.sink).await?;
            tokio::fs::create_dir_all(dest)
                .await
                .map_err(|err| SyncError::Destination {
                    source: err,
                    path: dest.to_path_buf(),
                })?;
        } else if let Some(parent) = dest.parent().filter(|parent| !parent.as_os_str().is_empty())
        {
            mkdirp::mkdirp(parent).map_err(|err| SyncError::Destination {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }

        transplant::move_dir(staged_repo, dest, self.sink).await?;

        Ok(())
    }

    /// Update existing checkout from its upstream.
    ///
    /// On success, every protected function body is reapplied to the freshly
    /// synchronized files.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::NotARepository`] if checkout cannot be opened.
    /// - Return [`SyncError::Transport`] if status or fetch fails. Stashed
    ///   modifications are restored before returning.
    /// - Return [`SyncError::Integrate`] if both fast-forward and rebase fail.
    ///   Stashed modifications are still popped, and progress still reaches
    ///   100, but protected bodies are not reapplied.
    /// - Return [`SyncError::Patch`] if the protection index cannot be read.
    /// - Return [`SyncError::Process`] if Git cannot be run, or was cancelled.
    #[instrument(skip(self, repo, progress), fields(repo = %repo.local_path.display()), level = "debug")]
    pub async fn update(
        &self,
        repo: &RepositoryHandle,
        progress: Option<&dyn Progress>,
    ) -> Result<UpdateReport> {
        let progress = ProgressTracker::new(progress);
        progress.report(0);

        let root = repo.local_path.as_path();
        let key = repo.transport_key.as_deref();
        let workdir = Repository::open(root)
            .map_err(|err| SyncError::NotARepository {
                source: err,
                path: root.to_path_buf(),
            })?
            .workdir()
            .map(Path::to_path_buf);
        if workdir.is_none() {
            return Err(SyncError::NotARepository {
                source: git2::Error::from_str("repository has no working tree"),
                path: root.to_path_buf(),
            });
        }

        let status = self.git(Some(root), key, ["status", "--porcelain"]).await?;
        self.require(&status, "status")?;
        let stashed = if status.stdout.trim().is_empty() {
            false
        } else {
            self.sink.line("local changes detected, stashing");
            let stash = self
                .git(Some(root), key, ["stash", "push", "--include-untracked"])
                .await?;
            if !stash.success() {
                warn!("stash failed, continuing without it");
            }
            stash.success()
        };

        let fetch = self.git(Some(root), key, ["fetch", "--all", "--prune"]).await;
        let fetch = match fetch.map_err(SyncError::from).and_then(|output| {
            self.require(&output, "fetch")?;
            Ok(output)
        }) {
            Ok(output) => output,
            Err(err) => {
                if stashed {
                    self.pop_stash(root, key).await;
                }
                return Err(err);
            }
        };
        debug!("fetch finished with {} bytes of output", fetch.stdout.len());
        progress.report(PROGRESS_FETCHED);

        let merge = self
            .git(Some(root), key, ["merge", "--ff-only", "@{u}"])
            .await?;
        let integrated = if merge.success() {
            self.sink.line("fast-forward succeeded");
            Ok(Integration::FastForward)
        } else {
            self.sink.line("fast-forward failed, trying pull --rebase");
            let pull = self.git(Some(root), key, ["pull", "--rebase"]).await?;
            if pull.success() {
                Ok(Integration::Rebased)
            } else {
                self.sink
                    .line("pull failed or conflicts occurred, manual resolution required");
                Err(SyncError::Integrate {
                    code: pull.code,
                    stderr: pull.stderr.trim().to_owned(),
                })
            }
        };

        let stash_restored = if stashed {
            self.pop_stash(root, key).await
        } else {
            true
        };

        let integration = match integrated {
            Ok(integration) => integration,
            Err(err) => {
                progress.report(100);
                return Err(err);
            }
        };

        let store = PatchStore::open(root);
        let store_dir = store.store_dir().to_path_buf();
        let reapplied = tokio::task::spawn_blocking(move || store.reapply_all())
            .await
            .map_err(|err| PatchError::Read {
                source: std::io::Error::other(err),
                path: store_dir,
            })??;
        self.log_reapply(&reapplied);
        progress.report(100);
        info!("updated {:?} by {integration}", root.display());

        Ok(UpdateReport {
            stashed,
            integration,
            stash_restored,
            reapplied,
        })
    }

    // Best-effort, conflicts are left for the operator.
    async fn pop_stash(&self, root: &Path, key: Option<&Path>) -> bool {
        match self.git(Some(root), key, ["stash", "pop"]).await {
            Ok(output) if output.success() => true,
            Ok(_) => {
                self.sink
                    .line("stash pop failed, resolve conflicts manually");
                false
            }
            Err(err) => {
                warn!("stash pop could not run: {err}");
                false
            }
        }
    }

    fn log_reapply(&self, summary: &ReapplySummary) {
        if summary.reconstructed {
            self.sink.line(
                "protection index missing, reapplied from reconstructed records (best-effort)",
            );
        }
        for (record, reason) in &summary.skipped {
            self.sink.line(&format!(
                "skipped protected {} in {}: {reason}",
                record.function, record.path
            ));
        }
        self.sink.line(&format!(
            "reapplied {} protected function(s)",
            summary.applied
        ));
    }

    async fn git(
        &self,
        dir: Option<&Path>,
        key: Option<&Path>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Result<CommandOutput> {
        // INVARIANT: Binding lives exactly as long as one invocation.
        let binding = TransportBinding::bind(key);
        let mut invocation = Invocation::new("git").args(args).envs(binding.envs());
        if let Some(dir) = dir {
            invocation = invocation.current_dir(dir);
        }

        let display = invocation.display();
        let output = invocation.run(self.sink, &self.cancel).await?;
        self.sink
            .line(&format!("{display} exit {}", output.code));
        drop(binding);

        Ok(output)
    }

    fn require(&self, output: &CommandOutput, step: &'static str) -> Result<()> {
        if output.success() {
            return Ok(());
        }

        Err(SyncError::Transport {
            step,
            code: output.code,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

/// Synchronization error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Git command talking to remote, or inspecting the checkout, failed.
    #[error("git {step} failed with exit code {code}: {stderr}")]
    Transport {
        step: &'static str,
        code: i32,
        stderr: String,
    },

    /// Neither fast-forward nor rebase could integrate upstream changes.
    #[error("pull --rebase failed with exit code {code}, manual resolution required: {stderr}")]
    Integrate { code: i32, stderr: String },

    /// Path is not a Git working tree.
    #[error("{:?} is not a git working tree", path.display())]
    NotARepository {
        #[source]
        source: git2::Error,
        path: PathBuf,
    },

    /// Staging root could not be created.
    #[error("failed to create staging root")]
    Staging(#[source] std::io::Error),

    /// Destination directory could not be prepared.
    #[error("failed to prepare destination {:?}", path.display())]
    Destination {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory could not be moved or deleted.
    #[error(transparent)]
    Transplant(#[from] crate::transplant::TransplantError),

    /// Git could not be run.
    #[error(transparent)]
    Process(#[from] crate::process::ProcessError),

    /// Protected function bodies could not be reapplied.
    #[error(transparent)]
    Patch(#[from] crate::patch::PatchError),
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::NullSink;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[test]
    fn progress_tracker_is_monotonic_and_bounded() {
        let seen = RefCell::new(Vec::new());
        let record = |percent: u8| seen.borrow_mut().push(percent);
        let tracker = ProgressTracker::new(Some(&record));

        for percent in [0, 60, 40, 100, 250] {
            tracker.report(percent);
        }

        assert_eq!(*seen.borrow(), vec![0, 60, 60, 100, 100]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn transport_key_reaches_git() -> anyhow::Result<()> {
        let key = Path::new("/keys/deploy_key");
        let sync = GitSync::new(&NullSink, CancelHandle::new());
        let output = sync
            .git(
                None,
                Some(key),
                [
                    "-c",
                    "alias.show-ssh=!printf '%s' \"$GIT_SSH_COMMAND\"",
                    "show-ssh",
                ],
            )
            .await?;

        assert!(output.success());
        assert!(output
            .stdout
            .starts_with("ssh -i \"/keys/deploy_key\" -o IdentitiesOnly=yes"));

        // INVARIANT: Known hosts file is gone once the invocation finished.
        let known_hosts = output
            .stdout
            .split_once("UserKnownHostsFile=\"")
            .map(|(_, rest)| rest.trim_end().trim_end_matches('"'))
            .unwrap_or_default();
        assert!(!known_hosts.is_empty());
        assert!(!Path::new(known_hosts).exists());

        Ok(())
    }

    #[test]
    fn progress_tracker_without_callback_is_noop() {
        let tracker = ProgressTracker::new(None);
        tracker.report(50);
        assert_eq!(tracker.last.get(), 50);
    }
}
