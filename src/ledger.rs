// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Worktree protection ledger.
//!
//! Git keeps a __skip-worktree__ bit for each entry in the index. When set,
//! checkouts and merges leave the file on disk alone even if its tracked
//! content changes upstream. Deploygit uses this bit to mark whole files as
//! locally owned, e.g., a controller carrying machine specific values.
//!
//! # Pitfalls
//!
//! Toggling is a query followed by a separate update. Nothing stops another
//! Git process from changing the index in between, so callers must not run
//! other index mutating commands against the same repository concurrently.

use crate::process::{self, CancelHandle, CommandOutput, LogSink};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Protection state of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionState {
    /// Skip-worktree bit is set.
    Protected,

    /// Skip-worktree bit is clear.
    Unprotected,
}

impl Display for ProtectionState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Protected => fmt.write_str("protected"),
            Self::Unprotected => fmt.write_str("unprotected"),
        }
    }
}

/// Desired protection change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// Force protection on.
    Protect,

    /// Force protection off.
    Unprotect,

    /// Flip current protection state.
    #[default]
    Flip,
}

/// Skip-worktree ledger of one repository.
#[derive(Clone)]
pub struct WorktreeLedger<'a> {
    root: PathBuf,
    sink: &'a dyn LogSink,
    cancel: CancelHandle,
}

impl<'a> WorktreeLedger<'a> {
    /// Construct new ledger for repository at `root`.
    pub fn new(root: impl Into<PathBuf>, sink: &'a dyn LogSink, cancel: CancelHandle) -> Self {
        Self {
            root: root.into(),
            sink,
            cancel,
        }
    }

    /// Query current protection state of tracked file.
    ///
    /// Always asks Git, never caches.
    ///
    /// # Errors
    ///
    /// - Return [`LedgerError::Process`] if Git cannot be run.
    /// - Return [`LedgerError::Index`] if index listing fails.
    #[instrument(skip(self, path), level = "debug")]
    pub async fn state(&self, path: impl AsRef<Path>) -> Result<ProtectionState> {
        let path = normalize_path(path.as_ref());
        let output = self
            .git([
                "--literal-pathspecs",
                "ls-files",
                "-v",
                "-z",
                "--",
                path.as_str(),
            ])
            .await?;
        self.check(&output, "ls-files")?;

        // INVARIANT: Only the entry for the exact path counts. Tag 'S' marks
        //   skip-worktree, 's' marks skip-worktree combined with
        //   assume-unchanged.
        let protected = output
            .stdout
            .split('\0')
            .filter_map(|entry| entry.trim_start_matches('\n').split_once(' '))
            .any(|(tag, entry)| entry == path && (tag == "S" || tag == "s"));
        debug!("{path} protected = {protected}");

        Ok(if protected {
            ProtectionState::Protected
        } else {
            ProtectionState::Unprotected
        })
    }

    /// Change protection state of tracked file.
    ///
    /// Returns the resulting state as reported by Git afterwards. Forcing a
    /// state the file is already in is fine.
    ///
    /// # Errors
    ///
    /// - Return [`LedgerError::Process`] if Git cannot be run.
    /// - Return [`LedgerError::Index`] if index listing or update fails, e.g.,
    ///   because the path is not tracked.
    #[instrument(skip(self, path), level = "debug")]
    pub async fn toggle(&self, path: impl AsRef<Path>, toggle: Toggle) -> Result<ProtectionState> {
        let path = path.as_ref();
        let current = self.state(path).await?;
        let desired = match (toggle, current) {
            (Toggle::Protect, _) => ProtectionState::Protected,
            (Toggle::Unprotect, _) => ProtectionState::Unprotected,
            (Toggle::Flip, ProtectionState::Protected) => ProtectionState::Unprotected,
            (Toggle::Flip, ProtectionState::Unprotected) => ProtectionState::Protected,
        };

        let flag = match desired {
            ProtectionState::Protected => "--skip-worktree",
            ProtectionState::Unprotected => "--no-skip-worktree",
        };
        let normalized = normalize_path(path);
        let output = self
            .git(["update-index", flag, "--", normalized.as_str()])
            .await?;
        self.check(&output, "update-index")?;
        info!("{normalized} is now {desired}");

        self.state(path).await
    }

    async fn git<const N: usize>(&self, args: [&str; N]) -> Result<CommandOutput> {
        let output = process::git(&self.root, args, self.sink, &self.cancel).await?;
        self.sink
            .line(&format!("git {} exit {}", args.join(" "), output.code));
        Ok(output)
    }

    fn check(&self, output: &CommandOutput, step: &'static str) -> Result<()> {
        if output.success() {
            return Ok(());
        }

        Err(LedgerError::Index {
            step,
            code: output.code,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_owned()
}

/// Worktree ledger error types.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Git could not be run.
    #[error(transparent)]
    Process(#[from] crate::process::ProcessError),

    /// Git rejected index query or update.
    #[error("git {step} failed with exit code {code}: {stderr}")]
    Index {
        step: &'static str,
        code: i32,
        stderr: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("app/config.php", "app/config.php"; "already normalized")]
    #[test_case("app\\config.php", "app/config.php"; "backslashes")]
    #[test_case("/app/config.php", "app/config.php"; "leading separator")]
    #[test]
    fn normalize_path_for_git(input: &str, expect: &str) {
        self::assert_eq!(normalize_path(Path::new(input)), expect);
    }
}
