// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Transport credential binding.
//!
//! Deployment machines usually authenticate against the remote with a single
//! deploy key that is not registered with any SSH agent, and they have never
//! seen the host key of the remote before. Git lets us override the SSH
//! command it uses through the `GIT_SSH_COMMAND` environment variable, so a
//! [`TransportBinding`] builds that override for exactly one invocation:
//!
//! - Only the given private key is offered to the remote.
//! - Host key verification never prompts the operator.
//! - Accepted host keys land in a throwaway known hosts file that is deleted
//!   once the binding is dropped.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Name of environment variable Git reads its SSH command from.
pub const GIT_SSH_COMMAND: &str = "GIT_SSH_COMMAND";

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Environment override forcing Git's SSH transport onto a private key.
#[derive(Debug, Default)]
pub struct TransportBinding {
    command: Option<String>,
    known_hosts: Option<NamedTempFile>,
}

impl TransportBinding {
    /// Bind transport to optional private key.
    ///
    /// No override is produced if no key is given, leaving Git to use
    /// whatever SSH setup the operator already has.
    pub fn bind(private_key: Option<&Path>) -> Self {
        let Some(key) = private_key else {
            return Self::default();
        };

        let known_hosts = tempfile::Builder::new()
            .prefix("ssh_known_hosts_")
            .suffix(".txt")
            .tempfile();
        let (hosts_path, known_hosts) = match known_hosts {
            Ok(file) => (file.path().to_path_buf(), Some(file)),
            Err(err) => {
                warn!("failed to create temporary known hosts file, using {NULL_DEVICE}: {err}");
                (PathBuf::from(NULL_DEVICE), None)
            }
        };
        debug!("using temporary known hosts file {}", hosts_path.display());

        let command = format!(
            "ssh -i \"{}\" -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=\"{}\"",
            key.display(),
            hosts_path.display(),
        );

        Self {
            command: Some(command),
            known_hosts,
        }
    }

    /// SSH command override, if any.
    pub fn ssh_command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Path to disposable known hosts file, if one was created.
    pub fn known_hosts(&self) -> Option<&Path> {
        self.known_hosts.as_ref().map(NamedTempFile::path)
    }

    /// Environment variables to apply to one invocation.
    pub fn envs(&self) -> Vec<(OsString, OsString)> {
        self.command
            .iter()
            .map(|command| (GIT_SSH_COMMAND.into(), command.into()))
            .collect()
    }
}
