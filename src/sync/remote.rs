// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote URL handling.
//!
//! Deploy keys only work over SSH, but operators tend to copy the HTTPS URL of
//! a repository out of their browser. So web transport URLs are rewritten into
//! the equivalent scp-like SSH form before cloning.

use regex::Regex;
use std::sync::LazyLock;

static WEB_URL: LazyLock<Regex> = LazyLock::new(|| {
    // INVARIANT: Pattern is a literal, compiling it cannot fail.
    Regex::new(r"^(?i:https?)://([^/]+)/(.+)$").unwrap()
});

/// User name used by forges for SSH transport.
const SSH_USER: &str = "git";

/// Fallback directory name when none can be derived from a URL.
pub const DEFAULT_REPO_NAME: &str = "repo";

/// Rewrite web transport URL into scp-like SSH form.
///
/// `https://host/owner/repo.git` becomes `git@host:owner/repo.git`. URLs that
/// already use SSH, either scp-like or with an explicit `ssh://` scheme, are
/// returned unchanged. So is anything else the pattern does not recognize,
/// e.g., local paths.
pub fn ssh_url(url: &str) -> String {
    let url = url.trim();
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("git@") || lower.starts_with("ssh://") {
        return url.to_owned();
    }

    match WEB_URL.captures(url) {
        Some(caps) => format!("{SSH_USER}@{}:{}", &caps[1], caps[2].trim_matches('/')),
        None => url.to_owned(),
    }
}

/// Derive local directory name for repository from its URL.
///
/// Takes the last non-empty path segment, strips a trailing ".git", and
/// replaces anything that is not legal inside a file name with '_'.
pub fn repo_dir_name(url: &str) -> String {
    let last = url
        .trim()
        .trim_end_matches('/')
        .split(['/', ':', '\\'])
        .filter(|segment| !segment.is_empty())
        .last()
        .unwrap_or_default();

    let stem = match last.len().checked_sub(4) {
        Some(cut) if last.is_char_boundary(cut) && last[cut..].eq_ignore_ascii_case(".git") => {
            &last[..cut]
        }
        _ => last,
    };

    let name = stem
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect::<String>();

    if name.is_empty() {
        DEFAULT_REPO_NAME.into()
    } else {
        name
    }
}
