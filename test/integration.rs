// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{OriginFixture, RepoFixture, RepoKind};

use deploygit::{
    ledger::LedgerError,
    patch::STORE_DIR,
    process::ProcessError,
    sync::{SyncError, PROGRESS_CLONED, PROGRESS_FETCHED},
    CancelHandle, GitSync, Integration, NullSink, PatchStore, Progress, ProtectionState,
    RepositoryHandle, Toggle, WorktreeLedger,
};

use anyhow::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::{
    cell::RefCell,
    fs::{create_dir_all, read_dir, read_to_string, write},
    path::Path,
    sync::Mutex,
};

const CONTROLLER: &str = indoc! {r#"
    <?php

    class A
    {
        public function check()
        {
            return false;
        }
    }
"#};

const CONTROLLER_UPSTREAM: &str = indoc! {r#"
    <?php

    class A
    {
        public function check()
        {
            return null;
        }

        public function other()
        {
            return 1;
        }
    }
"#};

async fn deploy(fixture: &OriginFixture, dest: &Path) -> Result<RepositoryHandle> {
    let handle = GitSync::new(&NullSink, CancelHandle::new())
        .clone_repository(fixture.url(), dest, None, None)
        .await?;

    // INVARIANT: Deployment checkout needs an identity to stash and rebase.
    RepoFixture::open(dest)?;

    Ok(handle)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(read_dir(path)?.next().is_none())
}

#[tokio::test]
async fn clone_failure_leaves_destination_untouched() -> Result<()> {
    let root = tempfile::tempdir()?;
    let staging = root.path().join("staging");
    let dest = root.path().join("dest");
    create_dir_all(&staging)?;

    let lines = Mutex::new(Vec::new());
    let sink = |line: &str| lines.lock().unwrap().push(line.to_owned());
    let result = GitSync::new(&sink, CancelHandle::new())
        .staging_in(&staging)
        .clone_repository(
            root.path().join("missing.git").to_string_lossy(),
            &dest,
            None,
            None,
        )
        .await;

    assert!(matches!(result, Err(SyncError::Transport { step: "clone", .. })));
    assert!(!dest.exists());
    assert!(is_empty_dir(&staging)?);
    assert!(lines
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.starts_with("stderr: ")));

    Ok(())
}

#[tokio::test]
async fn clone_moves_staged_repository_into_place() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = OriginFixture::new(root.path())?;
    fixture.publish("A.php", CONTROLLER)?;

    let staging = root.path().join("staging");
    let dest = root.path().join("www/shop");
    create_dir_all(&staging)?;

    let values = RefCell::new(Vec::new());
    let report = |percent: u8| values.borrow_mut().push(percent);
    let handle = GitSync::new(&NullSink, CancelHandle::new())
        .staging_in(&staging)
        .clone_repository(fixture.url(), &dest, None, Some(&report as &dyn Progress))
        .await?;

    assert_eq!(handle.local_path, dest);
    assert_eq!(handle.remote_url, Some(fixture.url()));
    assert_eq!(read_to_string(dest.join("A.php"))?, CONTROLLER);
    assert!(dest.join(".git").is_dir());
    assert!(is_empty_dir(&staging)?);
    assert_eq!(values.into_inner(), vec![0, PROGRESS_CLONED, 100]);

    Ok(())
}

#[tokio::test]
async fn clone_replaces_non_empty_destination() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = OriginFixture::new(root.path())?;
    fixture.publish("A.php", CONTROLLER)?;

    let dest = root.path().join("dest");
    create_dir_all(dest.join("old"))?;
    write(dest.join("old/stale.txt"), "stale")?;

    deploy(&fixture, &dest).await?;

    assert!(!dest.join("old").exists());
    assert_eq!(read_to_string(dest.join("A.php"))?, CONTROLLER);

    Ok(())
}

#[tokio::test]
async fn clone_with_cancelled_handle_fails_fast() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = OriginFixture::new(root.path())?;
    fixture.publish("A.php", CONTROLLER)?;

    let cancel = CancelHandle::new();
    cancel.cancel();
    let dest = root.path().join("dest");
    let result = GitSync::new(&NullSink, cancel)
        .clone_repository(fixture.url(), &dest, None, None)
        .await;

    assert!(matches!(
        result,
        Err(SyncError::Process(ProcessError::Cancelled { .. }))
    ));
    assert!(!dest.exists());

    Ok(())
}

#[tokio::test]
async fn update_fast_forwards_clean_checkout() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = OriginFixture::new(root.path())?;
    fixture.publish("A.php", CONTROLLER)?;
    let handle = deploy(&fixture, &root.path().join("dest")).await?;

    fixture.publish("B.txt", "upstream\n")?;
    let report = GitSync::new(&NullSink, CancelHandle::new())
        .update(&handle, None)
        .await?;

    assert_eq!(report.integration, Integration::FastForward);
    assert!(!report.stashed);
    assert!(report.stash_restored);
    assert_eq!(
        read_to_string(handle.local_path.join("B.txt"))?,
        "upstream\n"
    );

    Ok(())
}

#[tokio::test]
async fn update_stashes_and_rebases_diverged_checkout() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = OriginFixture::new(root.path())?;
    fixture.publish("A.php", CONTROLLER)?;
    fixture.publish("notes.txt", "notes\n")?;
    let handle = deploy(&fixture, &root.path().join("dest")).await?;

    let local = RepoFixture::open(&handle.local_path)?;
    local.write_and_commit("local.txt", "machine only\n")?;
    write(handle.local_path.join("notes.txt"), "edited on machine\n")?;
    fixture.publish("B.txt", "upstream\n")?;

    let values = RefCell::new(Vec::new());
    let report = |percent: u8| values.borrow_mut().push(percent);
    let result = GitSync::new(&NullSink, CancelHandle::new())
        .update(&handle, Some(&report as &dyn Progress))
        .await?;

    assert!(result.stashed);
    assert!(result.stash_restored);
    assert_eq!(result.integration, Integration::Rebased);
    assert_eq!(
        read_to_string(handle.local_path.join("notes.txt"))?,
        "edited on machine\n"
    );
    assert!(handle.local_path.join("local.txt").is_file());
    assert!(handle.local_path.join("B.txt").is_file());
    assert_eq!(values.into_inner(), vec![0, PROGRESS_FETCHED, 100]);

    Ok(())
}

fn recorded(lines: &Mutex<Vec<String>>, needle: &str) -> bool {
    lines.lock().unwrap().iter().any(|line| line.contains(needle))
}

#[tokio::test]
async fn update_conflicting_rebase_still_pops_stash() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = OriginFixture::new(root.path())?;
    fixture.publish("A.php", CONTROLLER)?;
    fixture.publish("notes.txt", "notes\n")?;
    fixture.publish("scratch.txt", "scratch\n")?;
    let handle = deploy(&fixture, &root.path().join("dest")).await?;

    let local = RepoFixture::open(&handle.local_path)?;
    local.write_and_commit("notes.txt", "machine notes\n")?;
    write(handle.local_path.join("scratch.txt"), "edited on machine\n")?;
    fixture.publish("notes.txt", "upstream notes\n")?;

    let lines = Mutex::new(Vec::new());
    let sink = |line: &str| lines.lock().unwrap().push(line.to_owned());
    let values = RefCell::new(Vec::new());
    let report = |percent: u8| values.borrow_mut().push(percent);
    let result = GitSync::new(&sink, CancelHandle::new())
        .update(&handle, Some(&report as &dyn Progress))
        .await;

    assert!(matches!(result, Err(SyncError::Integrate { .. })));
    assert!(recorded(&lines, "git stash push --include-untracked exit 0"));
    assert!(recorded(&lines, "git pull --rebase exit"));
    assert!(recorded(&lines, "git stash pop exit"));
    assert!(!recorded(&lines, "reapplied"));
    assert_eq!(values.into_inner(), vec![0, PROGRESS_FETCHED, 100]);

    Ok(())
}

#[tokio::test]
async fn update_failed_rebase_restores_stash_and_skips_reapply() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = OriginFixture::new(root.path())?;
    fixture.publish("A.php", CONTROLLER)?;
    fixture.publish("notes.txt", "notes\n")?;
    let handle = deploy(&fixture, &root.path().join("dest")).await?;

    // Without upstream both fast-forward and rebase fail, but nothing is left
    // half-applied, so the stash pops cleanly.
    let local = RepoFixture::open(&handle.local_path)?;
    local.git(["branch", "--unset-upstream"])?;
    write(handle.local_path.join("notes.txt"), "edited on machine\n")?;

    let lines = Mutex::new(Vec::new());
    let sink = |line: &str| lines.lock().unwrap().push(line.to_owned());
    let values = RefCell::new(Vec::new());
    let report = |percent: u8| values.borrow_mut().push(percent);
    let result = GitSync::new(&sink, CancelHandle::new())
        .update(&handle, Some(&report as &dyn Progress))
        .await;

    assert!(matches!(result, Err(SyncError::Integrate { .. })));
    assert!(recorded(&lines, "git stash pop exit 0"));
    assert!(!recorded(&lines, "reapplied"));
    assert_eq!(values.into_inner(), vec![0, PROGRESS_FETCHED, 100]);
    assert_eq!(local.git(["stash", "list"])?, "");
    assert_eq!(
        read_to_string(handle.local_path.join("notes.txt"))?,
        "edited on machine\n"
    );

    Ok(())
}

#[tokio::test]
async fn update_failed_fetch_restores_stash() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = OriginFixture::new(root.path())?;
    fixture.publish("notes.txt", "notes\n")?;
    let handle = deploy(&fixture, &root.path().join("dest")).await?;

    let local = RepoFixture::open(&handle.local_path)?;
    let missing = root.path().join("missing.git").to_string_lossy().into_owned();
    local.git(["remote", "set-url", "origin", missing.as_str()])?;
    write(handle.local_path.join("notes.txt"), "edited on machine\n")?;

    let result = GitSync::new(&NullSink, CancelHandle::new())
        .update(&handle, None)
        .await;

    assert!(matches!(
        result,
        Err(SyncError::Transport { step: "fetch", .. })
    ));
    assert_eq!(local.git(["stash", "list"])?, "");
    assert_eq!(
        read_to_string(handle.local_path.join("notes.txt"))?,
        "edited on machine\n"
    );

    Ok(())
}

#[tokio::test]
async fn update_rejects_non_repository() -> Result<()> {
    let root = tempfile::tempdir()?;
    let handle = RepositoryHandle::new(root.path());
    let result = GitSync::new(&NullSink, CancelHandle::new())
        .update(&handle, None)
        .await;

    assert!(matches!(result, Err(SyncError::NotARepository { .. })));

    Ok(())
}

#[tokio::test]
async fn update_reapplies_protected_function() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = OriginFixture::new(root.path())?;
    fixture.publish("A.php", CONTROLLER)?;
    let handle = deploy(&fixture, &root.path().join("dest")).await?;
    let local = RepoFixture::open(&handle.local_path)?;

    // Customize on the machine, capture it, then go back to a clean tree.
    let target = handle.local_path.join("A.php");
    write(&target, CONTROLLER.replace("return false;", "return true;"))?;
    PatchStore::open(&handle.local_path).protect("A.php", "check")?;
    local.git(["checkout", "--", "A.php"])?;
    assert!(handle.local_path.join(STORE_DIR).is_dir());

    fixture.publish("A.php", CONTROLLER_UPSTREAM)?;
    let report = GitSync::new(&NullSink, CancelHandle::new())
        .update(&handle, None)
        .await?;

    assert_eq!(report.reapplied.applied, 1);
    assert!(report.reapplied.skipped.is_empty());
    assert_eq!(
        read_to_string(&target)?,
        CONTROLLER_UPSTREAM.replace("return null;", "return true;")
    );

    Ok(())
}

#[tokio::test]
async fn ledger_toggles_skip_worktree() -> Result<()> {
    let root = tempfile::tempdir()?;
    let repo = RepoFixture::new(root.path().join("repo"), RepoKind::Normal)?;
    repo.write_and_commit("config.php", "<?php return [];\n")?;

    let ledger = WorktreeLedger::new(repo.path(), &NullSink, CancelHandle::new());
    assert_eq!(
        ledger.state("config.php").await?,
        ProtectionState::Unprotected
    );

    // Forcing the same state twice is fine.
    for _ in 0..2 {
        assert_eq!(
            ledger.toggle("config.php", Toggle::Protect).await?,
            ProtectionState::Protected
        );
    }
    assert!(repo.git(["ls-files", "-v"])?.starts_with("S config.php"));

    assert_eq!(
        ledger.toggle("config.php", Toggle::Flip).await?,
        ProtectionState::Unprotected
    );
    assert_eq!(
        ledger.toggle("config.php", Toggle::Flip).await?,
        ProtectionState::Protected
    );
    assert_eq!(
        ledger.toggle("config.php", Toggle::Unprotect).await?,
        ProtectionState::Unprotected
    );

    Ok(())
}

#[tokio::test]
async fn ledger_queries_exact_path_only() -> Result<()> {
    let root = tempfile::tempdir()?;
    let repo = RepoFixture::new(root.path().join("repo"), RepoKind::Normal)?;
    create_dir_all(repo.path().join("app"))?;
    repo.write_and_commit("app/config.php", "<?php return [];\n")?;
    repo.write_and_commit("app/routes.php", "<?php\n")?;

    let ledger = WorktreeLedger::new(repo.path(), &NullSink, CancelHandle::new());
    ledger.toggle("app/config.php", Toggle::Protect).await?;

    assert_eq!(
        ledger.state("app/config.php").await?,
        ProtectionState::Protected
    );
    for other in ["app", "app/*.php", "app/routes.php"] {
        assert_eq!(ledger.state(other).await?, ProtectionState::Unprotected);
    }

    Ok(())
}

#[tokio::test]
async fn ledger_rejects_untracked_path() -> Result<()> {
    let root = tempfile::tempdir()?;
    let repo = RepoFixture::new(root.path().join("repo"), RepoKind::Normal)?;
    repo.write_and_commit("config.php", "<?php return [];\n")?;

    let ledger = WorktreeLedger::new(repo.path(), &NullSink, CancelHandle::new());
    let result = ledger.toggle("missing.php", Toggle::Protect).await;
    assert!(matches!(
        result,
        Err(LedgerError::Index {
            step: "update-index",
            ..
        })
    ));

    Ok(())
}
