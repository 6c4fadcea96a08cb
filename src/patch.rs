// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Protected customization store.
//!
//! Deployments often need small local tweaks to tracked source files, e.g.,
//! a controller method that checks against a machine specific identifier.
//! Every synchronization with the remote would normally wipe those tweaks out.
//! The protected customization store captures the body of individual
//! functions, and injects them back into freshly synchronized files.
//!
//! # Store Layout
//!
//! The store lives in a dedicated directory at the top-level of the
//! repository named `.deploygit-protected`. It holds two kinds of files:
//!
//! 1. An __index__ file named `index.map`. Each line is one record of the form
//!    `relative/path.php|functionName|artifactFileName`. The index is append
//!    only, so protecting the same function twice yields two records.
//! 2. One __artifact__ per record holding the raw text of the captured body.
//!    Artifact names are built from the sanitized relative path of the source
//!    file and the function name, e.g., `A_php__check.body.php`.
//!
//! # Reconstruction
//!
//! If the index goes missing, records are reconstructed from artifact names.
//! Sanitization is lossy, so this is best-effort only: a reconstructed path
//! may point to the wrong file, or to no file at all.
//!
//! # See Also
//!
//! - [`extract`]
//! - [`ledger`](crate::ledger) for protecting whole files instead.

pub mod extract;

use crate::patch::extract::ExtractError;

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read_to_string, write, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, instrument, warn};

/// Name of store directory at top-level of repository.
pub const STORE_DIR: &str = ".deploygit-protected";

/// Name of index file inside store directory.
pub const INDEX_FILE: &str = "index.map";

const FIELD_SEPARATOR: char = '|';
const NAME_SEPARATOR: &str = "__";
const BODY_MARKER: &str = ".body.";
const DEFAULT_EXTENSION: &str = "txt";

/// One protected function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedFunction {
    /// Path of source file relative to repository root, using '/' separators.
    pub path: String,

    /// Name of protected function.
    pub function: String,

    /// File name of body artifact inside store directory.
    pub artifact: String,
}

impl ProtectedFunction {
    /// Construct new record, deriving artifact name from path and function.
    pub fn new(path: impl Into<String>, function: impl Into<String>) -> Self {
        let path = normalize_path(&path.into());
        let function = function.into();
        let artifact = artifact_name(&path, &function);

        Self {
            path,
            function,
            artifact,
        }
    }
}

impl Display for ProtectedFunction {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}",
            self.path, self.function, self.artifact
        )
    }
}

impl FromStr for ProtectedFunction {
    type Err = PatchError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields = line.trim().split(FIELD_SEPARATOR).collect::<Vec<_>>();
        match fields.as_slice() {
            [path, function, artifact]
                if !path.is_empty() && !function.is_empty() && !artifact.is_empty() =>
            {
                Ok(Self {
                    path: normalize_path(path),
                    function: (*function).into(),
                    artifact: (*artifact).into(),
                })
            }
            _ => Err(PatchError::MalformedRecord { line: line.into() }),
        }
    }
}

/// Why a record was skipped during reapplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Body artifact is gone.
    MissingArtifact,

    /// Target source file is gone.
    MissingTarget,

    /// Function could no longer be located in target source file.
    Extract(String),

    /// Files could not be read or written.
    Io(String),
}

impl Display for SkipReason {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::MissingArtifact => fmt.write_str("body artifact is missing"),
            Self::MissingTarget => fmt.write_str("target file is missing"),
            Self::Extract(reason) => fmt.write_str(reason),
            Self::Io(reason) => fmt.write_str(reason),
        }
    }
}

/// Outcome of reapplying all protected functions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapplySummary {
    /// Number of records successfully reapplied.
    pub applied: usize,

    /// Records that were skipped, with reason.
    pub skipped: Vec<(ProtectedFunction, SkipReason)>,

    /// Records came from artifact names because the index was missing.
    pub reconstructed: bool,
}

impl ReapplySummary {
    /// At least one record was reapplied.
    pub fn any_applied(&self) -> bool {
        self.applied > 0
    }
}

/// Store of protected function bodies for one repository.
#[derive(Debug, Clone)]
pub struct PatchStore {
    root: PathBuf,
    store_dir: PathBuf,
}

impl PatchStore {
    /// Open store of repository at `root`.
    ///
    /// Nothing is created on disk until the first function is protected.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let store_dir = root.join(STORE_DIR);
        Self { root, store_dir }
    }

    /// Path to store directory.
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Path to index file.
    pub fn index_path(&self) -> PathBuf {
        self.store_dir.join(INDEX_FILE)
    }

    /// Capture body of function and record it.
    ///
    /// Reads target file, extracts body of named function, writes it to a
    /// fresh artifact, and appends one record to the index. Nothing is written
    /// if the function cannot be extracted.
    ///
    /// # Errors
    ///
    /// - Return [`PatchError::Read`] if target file cannot be read.
    /// - Return [`PatchError::Extract`] if function body cannot be located.
    /// - Return [`PatchError::Write`] if artifact or index cannot be written.
    #[instrument(skip(self, path, function), level = "debug")]
    pub fn protect(
        &self,
        path: impl AsRef<str>,
        function: impl AsRef<str>,
    ) -> Result<ProtectedFunction> {
        let record = ProtectedFunction::new(path.as_ref(), function.as_ref());
        let target = self.root.join(&record.path);
        let source = read_to_string(&target).map_err(|err| PatchError::Read {
            source: err,
            path: target.clone(),
        })?;
        let body = extract::extract(&source, &record.function)?;

        mkdirp::mkdirp(&self.store_dir).map_err(|err| PatchError::Write {
            source: err,
            path: self.store_dir.clone(),
        })?;

        let artifact = self.store_dir.join(&record.artifact);
        write(&artifact, body).map_err(|err| PatchError::Write {
            source: err,
            path: artifact.clone(),
        })?;

        let index = self.index_path();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .and_then(|mut file| writeln!(file, "{record}"))
            .map_err(|err| PatchError::Write {
                source: err,
                path: index.clone(),
            })?;

        info!("protected {} in {}", record.function, record.path);
        Ok(record)
    }

    /// List all records in index.
    ///
    /// Malformed lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// - Return [`PatchError::Read`] if index exists but cannot be read.
    pub fn records(&self) -> Result<Vec<ProtectedFunction>> {
        let index = self.index_path();
        let content = match read_to_string(&index) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(PatchError::Read {
                    source: err,
                    path: index,
                })
            }
        };

        let mut records = Vec::new();
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            match line.parse::<ProtectedFunction>() {
                Ok(record) => records.push(record),
                Err(err) => warn!("{err}"),
            }
        }

        Ok(records)
    }

    /// Reconstruct records from artifact file names.
    ///
    /// Used when the index is missing. Candidate paths that exist in the
    /// repository are preferred, but nothing guarantees the result matches
    /// what was originally protected.
    pub fn reconstruct_records(&self) -> Vec<ProtectedFunction> {
        let pattern = self.store_dir.join(format!("*{NAME_SEPARATOR}*{BODY_MARKER}*"));
        let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for path in paths.flatten() {
            let Some(artifact) = path.file_name().map(|name| name.to_string_lossy().into_owned())
            else {
                continue;
            };

            match self.guess_record(&artifact) {
                Some(record) => records.push(record),
                None => warn!("cannot reconstruct record from artifact {artifact:?}"),
            }
        }
        records.sort_by(|a, b| a.artifact.cmp(&b.artifact));

        records
    }

    fn guess_record(&self, artifact: &str) -> Option<ProtectedFunction> {
        let (stem, _) = artifact.rsplit_once(BODY_MARKER)?;
        let (sanitized, function) = stem.rsplit_once(NAME_SEPARATOR)?;
        if sanitized.is_empty() || function.is_empty() {
            return None;
        }

        // INVARIANT: Last separator most likely stood for the extension dot.
        let candidates = match sanitized.rsplit_once('_') {
            Some((head, ext)) => vec![
                format!("{}.{ext}", head.replace('_', "/")),
                format!("{head}.{ext}"),
            ],
            None => vec![sanitized.to_owned()],
        };
        let path = candidates
            .iter()
            .find(|candidate| self.root.join(candidate).is_file())
            .unwrap_or(&candidates[0])
            .clone();

        Some(ProtectedFunction {
            path,
            function: function.into(),
            artifact: artifact.into(),
        })
    }

    /// Reapply every protected function body.
    ///
    /// Each record is handled in isolation. A record is skipped with a
    /// warning if its artifact or target file is missing, or if its function
    /// can no longer be located in the target. Otherwise, the stored body
    /// replaces the current body of the function in the target file.
    ///
    /// # Errors
    ///
    /// - Return [`PatchError::Read`] if index exists but cannot be read.
    #[instrument(skip(self), level = "debug")]
    pub fn reapply_all(&self) -> Result<ReapplySummary> {
        let mut summary = ReapplySummary::default();
        let records = if self.index_path().exists() {
            self.records()?
        } else if self.store_dir.is_dir() {
            warn!(
                "index {:?} is missing, reconstructing records from artifact names (best-effort)",
                self.index_path().display()
            );
            summary.reconstructed = true;
            self.reconstruct_records()
        } else {
            debug!("no protected functions in {:?}", self.root.display());
            return Ok(summary);
        };

        for record in records {
            match self.reapply(&record) {
                Ok(()) => {
                    info!("reapplied {} in {}", record.function, record.path);
                    summary.applied += 1;
                }
                Err(reason) => {
                    warn!(
                        "skipping {} in {}: {reason}",
                        record.function, record.path
                    );
                    summary.skipped.push((record, reason));
                }
            }
        }

        Ok(summary)
    }

    fn reapply(&self, record: &ProtectedFunction) -> Result<(), SkipReason> {
        let artifact = self.store_dir.join(&record.artifact);
        if !artifact.is_file() {
            return Err(SkipReason::MissingArtifact);
        }

        let target = self.root.join(&record.path);
        if !target.is_file() {
            return Err(SkipReason::MissingTarget);
        }

        let body = read_to_string(&artifact).map_err(|err| SkipReason::Io(err.to_string()))?;
        let source = read_to_string(&target).map_err(|err| SkipReason::Io(err.to_string()))?;
        let patched = extract::reinsert(&source, &record.function, &body)
            .map_err(|err| SkipReason::Extract(err.to_string()))?;

        if patched != source {
            write(&target, patched).map_err(|err| SkipReason::Io(err.to_string()))?;
        }

        Ok(())
    }
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_owned()
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive artifact file name for function in source file.
pub fn artifact_name(path: &str, function: &str) -> String {
    let extension = Path::new(path)
        .extension()
        .map(|ext| sanitize(&ext.to_string_lossy()))
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| DEFAULT_EXTENSION.into());

    format!(
        "{}{NAME_SEPARATOR}{}{BODY_MARKER}{extension}",
        sanitize(&normalize_path(path)),
        sanitize(function)
    )
}

/// Protected customization store error types.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Function body could not be extracted.
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// File could not be read.
    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// File could not be written.
    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Index line is not a valid record.
    #[error("malformed protection record {line:?}")]
    MalformedRecord { line: String },
}

/// Friendly result alias :3
pub type Result<T, E = PatchError> = std::result::Result<T, E>;
