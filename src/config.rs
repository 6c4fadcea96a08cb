// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operator settings.
//!
//! Deploygit remembers the last repository URL, install folder, and private
//! key the operator used, so that repeated updates of the same deployment do
//! not need any arguments at all.
//!
//! # Settings File Layout
//!
//! Settings are stored as a flat TOML table:
//!
//! ```toml
//! remote_url = "https://github.com/acme/shop.git"
//! install_folder = "$HOME/www/shop"
//! private_key = "~/.ssh/deploy_key"
//! ```
//!
//! Every field is optional. Path fields undergo shell expansion when loaded.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::{read_to_string, write},
    io,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Remembered operator settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// URL of remote repository to clone.
    pub remote_url: Option<String>,

    /// Folder that holds the deployed checkout.
    pub install_folder: Option<PathBuf>,

    /// Private key used for SSH transport.
    pub private_key: Option<PathBuf>,
}

impl Settings {
    /// Load settings from file.
    ///
    /// A missing file yields default settings.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is invalid.
    /// - Return [`ConfigError::ShellExpansion`] if path expansion fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match read_to_string(path) {
            Ok(content) => content.parse(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no settings at {:?}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(ConfigError::Read {
                source: err,
                path: path.to_path_buf(),
            }),
        }
    }

    /// Save settings to file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Serialize`] if settings cannot be serialized.
    /// - Return [`ConfigError::Write`] if file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::ser::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        let write_err = |err| ConfigError::Write {
            source: err,
            path: path.to_path_buf(),
        };

        if let Some(parent) = path.parent() {
            mkdirp::mkdirp(parent).map_err(write_err)?;
        }
        write(path, content).map_err(write_err)?;

        Ok(())
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path fields.
        settings.install_folder = settings.install_folder.map(expand).transpose()?;
        settings.private_key = settings.private_key.map(expand).transpose()?;

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(path: PathBuf) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Failed to read settings file.
    #[error("failed to read settings from {:?}", path.display())]
    Read {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Failed to write settings file.
    #[error("failed to write settings to {:?}", path.display())]
    Write {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
