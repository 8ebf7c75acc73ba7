// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::policy::{ApprovalPolicy, ToolPolicy};

/// Outcome of an approval check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("{0} escapes the approved directories via a symlink")]
    Escape(PathBuf),
    #[error("command denied by policy: {0}")]
    Denied(String),
    #[error("approval declined")]
    Declined,
    #[error("resolving path: {0}")]
    Io(#[from] std::io::Error),
}

/// Gates filesystem and shell tool calls before they reach the registry.
///
/// Check order: (1) pre-approved allowlist (`allowed_dirs`), (2) the
/// session's directory cache (populated by prior Allow decisions, tool
/// agnostic), (3) an interactive prompt on stderr/stdin. In headless runs
/// (`auto_approve`) the prompt step always answers yes and the decision is
/// cached exactly as an interactive Allow would be.
pub struct ApprovalManager {
    shell_policy: ToolPolicy,
    allowed_dirs: Vec<PathBuf>,
    auto_approve: bool,
    dir_cache: Mutex<HashSet<PathBuf>>,
}

impl ApprovalManager {
    pub fn new(shell_policy: ToolPolicy, allowed_dirs: Vec<PathBuf>, auto_approve: bool) -> Self {
        Self {
            shell_policy,
            allowed_dirs,
            auto_approve,
            dir_cache: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve a path for containment checks: fully canonicalize it if it
    /// exists; for a write target that doesn't exist yet, canonicalize the
    /// parent and reattach the final component.
    fn canonicalize_target(path: &Path) -> std::io::Result<PathBuf> {
        if let Ok(p) = path.canonicalize() {
            return Ok(p);
        }
        let file_name = path.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?;
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        let parent_canon = match parent {
            Some(p) => p.canonicalize()?,
            None => std::env::current_dir()?,
        };
        Ok(parent_canon.join(file_name))
    }

    fn lexically_within(&self, path: &Path) -> bool {
        self.allowed_dirs.iter().any(|d| path.starts_with(d))
    }

    fn canonically_within(&self, canon: &Path) -> bool {
        self.allowed_dirs.iter().any(|d| canon.starts_with(d))
            || self
                .dir_cache
                .lock()
                .unwrap()
                .iter()
                .any(|d| canon.starts_with(d))
    }

    fn cache_dir_of(&self, canon: &Path) {
        let dir = canon
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| canon.to_path_buf());
        self.dir_cache.lock().unwrap().insert(dir);
    }

    /// Check a filesystem tool call's target path.
    pub fn check_path(&self, path: &Path) -> Result<ApprovalDecision, ApprovalError> {
        let canon = Self::canonicalize_target(path)?;
        if self.canonically_within(&canon) {
            return Ok(ApprovalDecision::Allow);
        }
        if self.lexically_within(path) {
            // Looked like it was inside an approved directory until the
            // symlinks were resolved — reject rather than silently widen
            // the approved set.
            return Err(ApprovalError::Escape(canon));
        }
        if self.auto_approve || prompt_user(&format!("Allow access to {}?", canon.display())) {
            self.cache_dir_of(&canon);
            return Ok(ApprovalDecision::Allow);
        }
        Err(ApprovalError::Declined)
    }

    /// Check a shell/terminal tool call's command string.
    pub fn check_shell(&self, command: &str) -> Result<ApprovalDecision, ApprovalError> {
        match self.shell_policy.decide(command) {
            ApprovalPolicy::Deny => Err(ApprovalError::Denied(command.to_string())),
            ApprovalPolicy::Auto => Ok(ApprovalDecision::Allow),
            ApprovalPolicy::Ask => {
                if self.auto_approve || prompt_user(&format!("Run `{command}`?")) {
                    Ok(ApprovalDecision::Allow)
                } else {
                    Err(ApprovalError::Declined)
                }
            }
        }
    }
}

fn prompt_user(message: &str) -> bool {
    use std::io::Write;
    eprint!("{message} [y/N] ");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}
