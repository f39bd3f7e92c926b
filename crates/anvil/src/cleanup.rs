//! Cleanup of run directories, worktrees, and `dbg/*` branches.
//!
//! `cleanup run` is the recovery path for the worktree-conflict scenario: a
//! crashed run leaves `dbg/<run-id>/<track>` branches behind, and the next
//! run with the same id refuses to start until they are gone. All cleanup
//! operations are idempotent.

use crate::exec::{git_ok, run_git};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git error: {0}")]
    Git(#[from] crate::exec::ExecError),
}

pub type Result<T> = std::result::Result<T, CleanupError>;

/// A run found under the `.dbg` root.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub run_id: String,
    pub path: PathBuf,
    pub status: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

fn runs_root(dbg_root: &Path) -> PathBuf {
    dbg_root.join("runs")
}

fn worktrees_root(dbg_root: &Path) -> PathBuf {
    dbg_root.join("worktrees")
}

/// List runs with their persisted status, newest first.
pub fn list_runs(dbg_root: &Path) -> Result<Vec<RunEntry>> {
    let root = runs_root(dbg_root);
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs: Vec<RunEntry> = Vec::new();
    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let run_id = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        let (status, updated_at) = read_status(&path);
        runs.push(RunEntry {
            run_id,
            path,
            status,
            updated_at,
        });
    }
    runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.run_id.cmp(&b.run_id)));
    Ok(runs)
}

fn read_status(run_dir: &Path) -> (Option<String>, Option<DateTime<Utc>>) {
    let Ok(content) = std::fs::read_to_string(run_dir.join("RUN_STATUS.json")) else {
        return (None, None);
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) else {
        return (None, None);
    };
    let status = value["status"].as_str().map(ToString::to_string);
    let updated_at = value["updated_at"]
        .as_str()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok());
    (status, updated_at)
}

/// Remove every trace of one run: its branches, worktrees, and artifacts.
pub fn cleanup_run(repo: &Path, dbg_root: &Path, run_id: &str) -> Result<()> {
    remove_run_worktrees(repo, dbg_root, run_id)?;
    remove_run_branches(repo, run_id)?;

    let run_dir = runs_root(dbg_root).join(run_id);
    if run_dir.is_dir() {
        std::fs::remove_dir_all(&run_dir)?;
        info!(run_id, "removed run directory");
    }
    Ok(())
}

fn remove_run_worktrees(repo: &Path, dbg_root: &Path, run_id: &str) -> Result<()> {
    let root = worktrees_root(dbg_root).join(run_id);
    if !root.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let path_str = path.to_string_lossy().to_string();
        if let Err(e) = run_git(repo, &["worktree", "remove", "--force", &path_str]) {
            // The worktree may be stale (directory deleted by hand); prune
            // and fall back to a plain remove.
            warn!(path = %path_str, error = %e, "git worktree remove failed; pruning");
            let _ = run_git(repo, &["worktree", "prune"]);
            let _ = std::fs::remove_dir_all(&path);
        }
    }
    let _ = std::fs::remove_dir(&root);
    let _ = std::fs::remove_dir(worktrees_root(dbg_root));
    Ok(())
}

fn remove_run_branches(repo: &Path, run_id: &str) -> Result<()> {
    if !git_ok(repo, &["rev-parse", "--git-dir"]) {
        return Ok(());
    }
    let prefix = format!("dbg/{run_id}/");
    let branches = run_git(
        repo,
        &["for-each-ref", "--format=%(refname:short)", "refs/heads/dbg"],
    )?;
    for branch in branches.lines() {
        if branch.starts_with(&prefix) {
            run_git(repo, &["branch", "-D", branch])?;
            info!(branch, "deleted run branch");
        }
    }
    Ok(())
}

/// Remove runs whose last status update is older than `days`.
///
/// Runs with no readable status are kept: age cannot be established.
pub fn cleanup_stale(repo: &Path, dbg_root: &Path, days: i64) -> Result<Vec<String>> {
    let cutoff = Utc::now() - chrono::Duration::days(days);
    let mut removed = Vec::new();
    for run in list_runs(dbg_root)? {
        let Some(updated_at) = run.updated_at else {
            continue;
        };
        if updated_at < cutoff {
            cleanup_run(repo, dbg_root, &run.run_id)?;
            removed.push(run.run_id);
        }
    }
    Ok(removed)
}

/// Remove every run.
pub fn cleanup_all(repo: &Path, dbg_root: &Path) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for run in list_runs(dbg_root)? {
        cleanup_run(repo, dbg_root, &run.run_id)?;
        removed.push(run.run_id);
    }
    Ok(removed)
}
