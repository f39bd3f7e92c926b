//! Worktree manager: isolated per-track checkouts.
//!
//! Each track works in its own git worktree at
//! `<dbg_root>/worktrees/<run-id>/<track>/` on a deterministic branch
//! `dbg/<run-id>/<track>`. The branch already existing is a conflict (a
//! prior run with the same id left state behind); resume is the one case
//! where an existing worktree is reused. Cleanup archives the branch before
//! removing the worktree so candidate work is never silently lost.

use crate::exec::{git_ok, run_git, ExecError};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("repository is not version-controlled: {0}")]
    RepoNotVersionControlled(PathBuf),
    #[error("branch {0} already exists (previous run left state; run cleanup)")]
    WorktreeConflict(String),
    #[error("worktree operation failed: {0}")]
    WorktreeFailure(String),
}

impl From<ExecError> for WorktreeError {
    fn from(e: ExecError) -> Self {
        Self::WorktreeFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Manager for one run's worktrees.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo: PathBuf,
    worktrees_root: PathBuf,
    run_id: String,
    /// Serializes branch/worktree mutations: tracks provision concurrently,
    /// and git refuses concurrent ref updates in one repository.
    git_lock: Arc<Mutex<()>>,
}

impl WorktreeManager {
    /// Create a manager. Fails hard when `repo` is not a git repository:
    /// isolation is built on branches and worktrees, so version control is a
    /// documented precondition of the whole system.
    pub fn new(repo: &Path, dbg_root: &Path, run_id: &str) -> Result<Self> {
        if !git_ok(repo, &["rev-parse", "--git-dir"]) {
            return Err(WorktreeError::RepoNotVersionControlled(repo.to_path_buf()));
        }
        Ok(Self {
            repo: repo.to_path_buf(),
            worktrees_root: dbg_root.join("worktrees").join(run_id),
            run_id: run_id.to_string(),
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Deterministic branch name for a track.
    pub fn branch(&self, track: &str) -> String {
        format!("dbg/{}/{track}", self.run_id)
    }

    /// Worktree path for a track. Stable across calls.
    pub fn get_path(&self, track: &str) -> PathBuf {
        self.worktrees_root.join(track)
    }

    fn branch_exists(&self, branch: &str) -> bool {
        git_ok(
            &self.repo,
            &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
        )
    }

    /// Provision the isolated checkout for a track.
    ///
    /// `resume` reuses an existing worktree whose checked-out branch matches;
    /// otherwise a pre-existing branch is a `WorktreeConflict`.
    pub fn provision(&self, track: &str, resume: bool) -> Result<PathBuf> {
        let branch = self.branch(track);
        let path = self.get_path(track);
        let _guard = self.git_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if self.branch_exists(&branch) {
            if resume && path.is_dir() {
                let head = run_git(&path, &["branch", "--show-current"]).unwrap_or_default();
                if head == branch {
                    info!(track, branch, "reusing worktree for resumed run");
                    return Ok(path);
                }
            }
            return Err(WorktreeError::WorktreeConflict(branch));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WorktreeError::WorktreeFailure(e.to_string()))?;
        }

        run_git(&self.repo, &["branch", &branch, "HEAD"])?;
        run_git(
            &self.repo,
            &["worktree", "add", &path.to_string_lossy(), &branch],
        )?;

        info!(track, branch, path = %path.display(), "provisioned worktree");
        Ok(path)
    }

    /// Archive a track's branch and remove its worktree. No-op when the
    /// worktree is already gone.
    pub fn archive_and_cleanup(&self, track: &str) -> Result<()> {
        let branch = self.branch(track);
        let path = self.get_path(track);
        let _guard = self.git_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if path.is_dir() {
            run_git(
                &self.repo,
                &["worktree", "remove", "--force", &path.to_string_lossy()],
            )?;
        }

        if self.branch_exists(&branch) {
            let archive = format!(
                "archive/anvil-{}-{track}-{}",
                self.run_id,
                Utc::now().format("%Y%m%dT%H%M%S")
            );
            run_git(&self.repo, &["branch", "-m", &branch, &archive])?;
            info!(track, archive, "archived track branch");
        }

        Ok(())
    }

    /// Best-effort cleanup of every track's worktree.
    pub fn cleanup_all(&self, tracks: &[String]) {
        for track in tracks {
            if let Err(e) = self.archive_and_cleanup(track) {
                warn!(track, error = %e, "worktree cleanup failed");
            }
        }
        // Drop the (now empty) per-run directory if possible.
        let _ = std::fs::remove_dir(&self.worktrees_root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run_git(dir.path(), &["init"]).unwrap();
        run_git(dir.path(), &["config", "user.email", "test@test.com"]).unwrap();
        run_git(dir.path(), &["config", "user.name", "Test"]).unwrap();
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        run_git(dir.path(), &["add", "."]).unwrap();
        run_git(dir.path(), &["commit", "-m", "Initial commit"]).unwrap();
        dir
    }

    fn manager(dir: &TempDir) -> WorktreeManager {
        WorktreeManager::new(dir.path(), &dir.path().join(".dbg"), "r1").unwrap()
    }

    #[test]
    fn rejects_non_git_repo() {
        let dir = TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path(), &dir.path().join(".dbg"), "r1");
        assert!(matches!(
            result,
            Err(WorktreeError::RepoNotVersionControlled(_))
        ));
    }

    #[test]
    fn provisions_worktree_on_deterministic_branch() {
        let dir = scratch_repo();
        let manager = manager(&dir);

        let path = manager.provision("alpha", false).unwrap();
        assert!(path.is_dir());
        assert!(path.join("README.md").exists());
        assert_eq!(path, manager.get_path("alpha"));

        let head = run_git(&path, &["branch", "--show-current"]).unwrap();
        assert_eq!(head, "dbg/r1/alpha");
    }

    #[test]
    fn existing_branch_is_a_conflict() {
        let dir = scratch_repo();
        run_git(dir.path(), &["branch", "dbg/r1/alpha", "HEAD"]).unwrap();

        let manager = manager(&dir);
        let result = manager.provision("alpha", false);
        assert!(matches!(result, Err(WorktreeError::WorktreeConflict(_))));
    }

    #[test]
    fn resume_reuses_existing_worktree() {
        let dir = scratch_repo();
        let manager = manager(&dir);

        let first = manager.provision("alpha", false).unwrap();
        let again = manager.provision("alpha", true).unwrap();
        assert_eq!(first, again);

        // A fresh (non-resume) provision still conflicts.
        assert!(matches!(
            manager.provision("alpha", false),
            Err(WorktreeError::WorktreeConflict(_))
        ));
    }

    #[test]
    fn cleanup_archives_branch_and_removes_worktree() {
        let dir = scratch_repo();
        let manager = manager(&dir);

        let path = manager.provision("alpha", false).unwrap();
        manager.archive_and_cleanup("alpha").unwrap();
        assert!(!path.exists());

        // Original branch gone, archive branch present.
        let branches = run_git(dir.path(), &["branch", "--list"]).unwrap();
        assert!(!branches.contains("dbg/r1/alpha"));
        assert!(branches.contains("archive/anvil-r1-alpha-"));

        // Retry after cleanup succeeds (scenario: conflict, cleanup, rerun).
        manager.provision("alpha", false).unwrap();
    }

    #[test]
    fn repeated_cleanup_is_a_noop() {
        let dir = scratch_repo();
        let manager = manager(&dir);
        manager.provision("alpha", false).unwrap();
        manager.archive_and_cleanup("alpha").unwrap();
        // Second cleanup finds nothing to do.
        manager.archive_and_cleanup("alpha").unwrap();
    }

    #[test]
    fn cleanup_all_tolerates_missing_tracks() {
        let dir = scratch_repo();
        let manager = manager(&dir);
        manager.provision("alpha", false).unwrap();
        manager.cleanup_all(&["alpha".to_string(), "ghost".to_string()]);
        assert!(!manager.get_path("alpha").exists());
    }
}
