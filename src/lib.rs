// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deploy web applications straight out of Git.
//!
//! Deploygit keeps a checkout of a web application repository on a deployment
//! machine up to date, while protecting whatever local customizations the
//! machine needs to keep.
//!
//! # Local Customizations
//!
//! Two kinds of customization survive synchronization:
//!
//! 1. Whole files marked through the [`WorktreeLedger`]. Git itself is told
//!    to leave these alone.
//! 2. Individual function bodies captured in the [`PatchStore`]. These are
//!    injected back into their files after each update.
//!
//! # Transport
//!
//! All Git work is done by shelling out to the Git binary through
//! [`Invocation`]. When a private key is given, a [`TransportBinding`] forces
//! SSH to use it, and nothing else.

pub mod config;
pub mod ledger;
pub mod patch;
pub mod path;
pub mod process;
pub mod sync;
pub mod transplant;
pub mod transport;

#[doc(inline)]
pub use config::Settings;

#[doc(inline)]
pub use ledger::{ProtectionState, Toggle, WorktreeLedger};

#[doc(inline)]
pub use patch::{PatchStore, ProtectedFunction, ReapplySummary};

#[doc(inline)]
pub use process::{CancelHandle, CommandOutput, Invocation, LogSink, NullSink, TracingSink};

#[doc(inline)]
pub use sync::{GitSync, Integration, Progress, RepositoryHandle, UpdateReport};

#[doc(inline)]
pub use transport::TransportBinding;
