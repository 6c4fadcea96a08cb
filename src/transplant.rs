// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Directory transplanting.
//!
//! Move whole directory trees around, and delete them in a way that
//! tolerates transient file locks. Virus scanners, indexers, and editors love
//! to briefly hold handles inside freshly cloned repositories, so deletion is
//! retried a few times with a linear backoff before giving up.

use crate::process::LogSink;

use ignore::WalkBuilder;
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, instrument};

/// Maximum number of deletion attempts before giving up.
pub const DELETE_ATTEMPTS: u32 = 5;

/// Backoff unit between deletion attempts, multiplied by attempt number.
pub const DELETE_BACKOFF: Duration = Duration::from_millis(200);

/// Move directory tree from `src` to `dst`.
///
/// Prefers a plain rename. If that fails, e.g., because `src` and `dst` live on
/// different devices, falls back to a recursive copy followed by deletion
/// of `src`.
///
/// # Errors
///
/// - Return [`TransplantError::Copy`] if fallback copy fails.
/// - Return [`TransplantError::Locked`] if `src` cannot be removed after
///   fallback copy.
#[instrument(skip(src, dst, sink), level = "debug")]
pub async fn move_dir(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    sink: &dyn LogSink,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    match tokio::fs::rename(src, dst).await {
        Ok(()) => {
            sink.line(&format!("moved {} into {}", src.display(), dst.display()));
            return Ok(());
        }
        Err(err) => {
            sink.line(&format!("rename failed, falling back to recursive copy: {err}"));
        }
    }

    let (from, to) = (src.to_path_buf(), dst.to_path_buf());
    tokio::task::spawn_blocking(move || copy_dir(from, to))
        .await
        .map_err(|err| TransplantError::Copy {
            source: io::Error::other(err),
            path: src.to_path_buf(),
        })??;
    remove_dir_retrying(src, sink).await?;
    sink.line(&format!("copied {} into {}", src.display(), dst.display()));

    Ok(())
}

/// Recursively copy directory tree from `src` into `dst`.
///
/// Hidden files are included, and existing files at `dst` are overwritten.
/// Symbolic links are recreated on unix, and copied as regular files elsewhere.
///
/// # Errors
///
/// - Return [`TransplantError::Copy`] if any entry cannot be walked or copied.
pub fn copy_dir(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    let walker = WalkBuilder::new(src)
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .build();

    for entry in walker {
        let entry = entry.map_err(|err| TransplantError::Copy {
            source: err.into_io_error().unwrap_or_else(|| io::Error::other("walk failed")),
            path: src.to_path_buf(),
        })?;
        let path = entry.path();
        let relative = path.strip_prefix(src).unwrap_or(path);
        let target = dst.join(relative);
        let copy_err = |err: io::Error| TransplantError::Copy {
            source: err,
            path: path.to_path_buf(),
        };

        match entry.file_type() {
            Some(kind) if kind.is_dir() => fs::create_dir_all(&target).map_err(copy_err)?,
            Some(kind) if kind.is_symlink() => copy_symlink(path, &target).map_err(copy_err)?,
            _ => {
                fs::copy(path, &target).map_err(copy_err)?;
            }
        }
    }
    debug!("copied {} into {}", src.display(), dst.display());

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(dst)?;
    }
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Delete directory tree, retrying on failure.
///
/// Makes up to [`DELETE_ATTEMPTS`] attempts, sleeping [`DELETE_BACKOFF`] times
/// the attempt number between each one. A missing directory counts as
/// already deleted. Every failed attempt is reported to `sink`.
///
/// # Errors
///
/// - Return [`TransplantError::Locked`] if all attempts fail.
#[instrument(skip(path, sink), level = "debug")]
pub async fn remove_dir_retrying(path: impl AsRef<Path>, sink: &dyn LogSink) -> Result<()> {
    let path = path.as_ref();
    let mut last_error = None;
    for attempt in 1..=DELETE_ATTEMPTS {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                sink.line(&format!(
                    "delete attempt {attempt} of {} failed: {err}",
                    path.display()
                ));
                last_error = Some(err);
                tokio::time::sleep(DELETE_BACKOFF * attempt).await;
            }
        }
    }

    Err(TransplantError::Locked {
        source: last_error.unwrap_or_else(|| io::Error::other("no attempt made")),
        path: path.to_path_buf(),
    })
}

/// Check if directory exists and contains at least one entry.
pub fn is_non_empty_dir(path: impl AsRef<Path>) -> bool {
    fs::read_dir(path.as_ref())
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Directory transplant error types.
#[derive(Debug, thiserror::Error)]
pub enum TransplantError {
    /// Directory could not be deleted, most likely due to open handles.
    #[error("unable to delete directory {:?}, close open handles and try again", path.display())]
    Locked {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Entry could not be copied.
    #[error("failed to copy {:?}", path.display())]
    Copy {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = TransplantError> = std::result::Result<T, E>;
