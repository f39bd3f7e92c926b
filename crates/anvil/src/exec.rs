//! Subprocess execution.
//!
//! This module is the engine's only subprocess seam: the agent adapters and
//! the verifier go through `run_shell`, and git operations (worktrees,
//! apply) go through `run_git`. Standard streams are captured straight into
//! log files, never buffered in memory. On timeout the child is signalled
//! and then awaited so it is always reaped.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default container image for isolated execution.
pub const DEFAULT_CONTAINER_IMAGE: &str = "anvil-sandbox:latest";

/// Environment variable overriding the container image.
pub const CONTAINER_IMAGE_ENV: &str = "ANVIL_CONTAINER_IMAGE";

/// Mount point of the working directory inside the container.
const CONTAINER_WORKDIR: &str = "/work";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {args}: {stderr}")]
    Git { args: String, stderr: String },
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// A bounded shell execution request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Shell command string, run via `sh -c`. Callers own quoting.
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Directory receiving the captured stream files.
    pub logs_dir: PathBuf,
    /// Stem for the log filenames: `<stem>.out.log` / `<stem>.err.log`.
    pub log_stem: String,
    /// Run inside a container, bind-mounting `cwd`.
    pub container: bool,
}

/// Outcome of a bounded shell execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Read back the captured stdout (lossy).
    pub fn stdout(&self) -> String {
        std::fs::read(&self.stdout_path)
            .map(|b| String::from_utf8_lossy(&b).to_string())
            .unwrap_or_default()
    }

    /// Read back the captured stderr (lossy).
    pub fn stderr(&self) -> String {
        std::fs::read(&self.stderr_path)
            .map(|b| String::from_utf8_lossy(&b).to_string())
            .unwrap_or_default()
    }
}

fn container_image() -> String {
    std::env::var(CONTAINER_IMAGE_ENV).unwrap_or_else(|_| DEFAULT_CONTAINER_IMAGE.to_string())
}

/// Execute a shell command with a timeout, capturing streams to files.
pub async fn run_shell(request: &ExecRequest) -> Result<ExecResult> {
    std::fs::create_dir_all(&request.logs_dir)?;
    let stdout_path = request.logs_dir.join(format!("{}.out.log", request.log_stem));
    let stderr_path = request.logs_dir.join(format!("{}.err.log", request.log_stem));
    let stdout_file = std::fs::File::create(&stdout_path)?;
    let stderr_file = std::fs::File::create(&stderr_path)?;

    let (program, args) = if request.container {
        let image = container_image();
        (
            "docker".to_string(),
            vec![
                "run".to_string(),
                "--rm".to_string(),
                "-v".to_string(),
                format!("{}:{CONTAINER_WORKDIR}", request.cwd.display()),
                "-w".to_string(),
                CONTAINER_WORKDIR.to_string(),
                image,
                "sh".to_string(),
                "-c".to_string(),
                request.command.clone(),
            ],
        )
    } else {
        (
            "sh".to_string(),
            vec!["-c".to_string(), request.command.clone()],
        )
    };

    debug!(
        command = %request.command,
        cwd = %request.cwd.display(),
        container = request.container,
        timeout_s = request.timeout.as_secs(),
        "spawning command"
    );

    let start = Utc::now();
    let mut child = Command::new(&program)
        .args(&args)
        .current_dir(&request.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

    let (exit_code, timed_out) = match timeout(request.timeout, child.wait()).await {
        Ok(status) => (status?.code().unwrap_or(-1), false),
        Err(_) => {
            warn!(
                command = %request.command,
                timeout_s = request.timeout.as_secs(),
                "command timed out, signalling"
            );
            // Signal, then reap: never leave a zombie behind.
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to signal timed-out process");
            }
            let _ = child.wait().await;
            (-1, true)
        }
    };

    let elapsed_ms = (Utc::now() - start).num_milliseconds().max(0) as u64;
    let stdout_bytes = std::fs::metadata(&stdout_path).map(|m| m.len()).unwrap_or(0);
    let stderr_bytes = std::fs::metadata(&stderr_path).map(|m| m.len()).unwrap_or(0);

    debug!(
        exit_code,
        timed_out, elapsed_ms, stdout_bytes, stderr_bytes, "command finished"
    );

    Ok(ExecResult {
        exit_code,
        elapsed_ms,
        stdout_path,
        stderr_path,
        stdout_bytes,
        stderr_bytes,
        timed_out,
    })
}

/// Run a git command in `repo`, returning trimmed stdout on success.
///
/// Synchronous: git calls are short and serialized per caller.
pub fn run_git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|source| ExecError::Spawn {
            program: "git".to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ExecError::Git {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Like `run_git`, but only reports success/failure.
pub fn git_ok(repo: &Path, args: &[&str]) -> bool {
    std::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &TempDir, command: &str, timeout_s: u64) -> ExecRequest {
        ExecRequest {
            command: command.to_string(),
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(timeout_s),
            logs_dir: dir.path().join("logs"),
            log_stem: "test".to_string(),
            container: false,
        }
    }

    #[tokio::test]
    async fn captures_streams_to_files() {
        let dir = TempDir::new().unwrap();
        let result = run_shell(&request(&dir, "echo out; echo err >&2", 10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert_eq!(result.stdout(), "out\n");
        assert_eq!(result.stderr(), "err\n");
        assert_eq!(result.stdout_bytes, 4);
        assert_eq!(result.stderr_bytes, 4);
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let result = run_shell(&request(&dir, "exit 3", 10)).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn times_out_and_reaps() {
        let dir = TempDir::new().unwrap();
        let start = std::time::Instant::now();
        let result = run_shell(&request(&dir, "sleep 30", 1)).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        // Came back promptly after the signal, not after 30s.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn runs_in_requested_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let result = run_shell(&request(&dir, "ls", 10)).await.unwrap();
        assert!(result.stdout().contains("marker"));
    }

    #[test]
    fn run_git_reports_stderr_on_failure() {
        let dir = TempDir::new().unwrap();
        let err = run_git(dir.path(), &["rev-parse", "--verify", "nope"]).unwrap_err();
        assert!(matches!(err, ExecError::Git { .. }));
    }

    #[test]
    fn git_ok_in_fresh_repo() {
        let dir = TempDir::new().unwrap();
        assert!(!git_ok(dir.path(), &["rev-parse", "--git-dir"]));
        run_git(dir.path(), &["init"]).unwrap();
        assert!(git_ok(dir.path(), &["rev-parse", "--git-dir"]));
    }
}
