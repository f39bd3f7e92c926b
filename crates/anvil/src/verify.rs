//! Verifier: deterministic execution of the declared verification contract.
//!
//! Each command runs through the command runner in the target working
//! directory. One JSON line per command is appended to
//! `verify.commands.json`, a combined log lands under
//! `logs/verify.<safe-name>.log`, and `VERIFY.md` records the overall
//! result with a leading `PASS` or `FAIL` token. PASS requires every
//! required command to exit 0 *and* evidence that tests actually ran; a
//! green exit with "no tests collected" is a FAIL.

use crate::exec::{run_shell, ExecRequest};
use crate::store::ArtifactStore;
use anvil_core::{sanitize_command_name, VerifyCommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("exec error: {0}")]
    Exec(#[from] crate::exec::ExecError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VerifyError>;

/// Per-command record, one JSON line in `verify.commands.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub name: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub log_paths: Vec<String>,
    pub required: bool,
    pub timed_out: bool,
}

/// Outcome of one verification pass.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub commands: Vec<CommandRecord>,
}

/// Verification request: where to run and where to write artifacts.
#[derive(Debug)]
pub struct VerifyRequest<'a> {
    pub store: &'a ArtifactStore,
    /// Directory (relative to the store root) receiving `VERIFY.md`,
    /// `verify.commands.json`, and `logs/`.
    pub out_dir: PathBuf,
    /// Working directory the commands execute in (a track worktree or the
    /// main repository).
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub container: bool,
}

/// Execute the contract and write the verification artifacts.
pub async fn run(request: &VerifyRequest<'_>, contract: &[VerifyCommand]) -> Result<VerifyOutcome> {
    let logs_rel = request.out_dir.join("logs");
    let logs_dir = request.store.mkdirs(&logs_rel)?;

    let mut records: Vec<CommandRecord> = Vec::new();
    let mut required_ok = true;
    let mut evidence = false;

    for command in contract {
        let safe = sanitize_command_name(&command.name);
        let result = run_shell(&ExecRequest {
            command: command.cmd.clone(),
            cwd: request.workdir.clone(),
            timeout: request.timeout,
            logs_dir: logs_dir.clone(),
            log_stem: format!("verify.{safe}.raw"),
            container: request.container,
        })
        .await?;

        // Combined log: stdout, then a stderr section when present.
        let combined = combine_streams(&result.stdout(), &result.stderr());
        let log_rel = logs_rel.join(format!("verify.{safe}.log"));
        request.store.write_str(&log_rel, &combined)?;

        if has_test_evidence(&combined) && !no_tests_collected(&combined) {
            evidence = true;
        }
        if command.required && !result.success() {
            required_ok = false;
        }

        if result.success() {
            info!(name = %command.name, elapsed_ms = result.elapsed_ms, "verify command passed");
        } else {
            warn!(
                name = %command.name,
                exit_code = result.exit_code,
                timed_out = result.timed_out,
                "verify command failed"
            );
        }

        records.push(CommandRecord {
            name: command.name.clone(),
            exit_code: result.exit_code,
            elapsed_ms: result.elapsed_ms,
            stdout_bytes: result.stdout_bytes,
            stderr_bytes: result.stderr_bytes,
            log_paths: vec![log_rel.to_string_lossy().to_string()],
            required: command.required,
            timed_out: result.timed_out,
        });
    }

    let passed = required_ok && evidence;

    // One JSON object per line, append-only shape.
    let mut jsonl = String::new();
    for record in &records {
        jsonl.push_str(&serde_json::to_string(record)?);
        jsonl.push('\n');
    }
    request
        .store
        .write_str(request.out_dir.join("verify.commands.json"), &jsonl)?;

    request
        .store
        .write_str(request.out_dir.join("VERIFY.md"), &render_verify_md(passed, &records))?;

    Ok(VerifyOutcome { passed, commands: records })
}

fn combine_streams(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n--- STDERR ---\n{stderr}")
    }
}

fn render_verify_md(passed: bool, records: &[CommandRecord]) -> String {
    let mut out = String::from(if passed { "PASS\n\n" } else { "FAIL\n\n" });
    out.push_str("# Verification\n\n");
    if records.is_empty() {
        out.push_str("No commands were declared; nothing was verified.\n");
        return out;
    }
    out.push_str("| command | required | exit | elapsed | log |\n");
    out.push_str("|---|---|---|---|---|\n");
    for record in records {
        out.push_str(&format!(
            "| {} | {} | {} | {}ms | {} |\n",
            record.name,
            if record.required { "yes" } else { "no" },
            if record.timed_out {
                "timeout".to_string()
            } else {
                record.exit_code.to_string()
            },
            record.elapsed_ms,
            record.log_paths.first().map_or("", String::as_str),
        ));
    }
    out
}

/// Did any output look like tests actually executing?
fn has_test_evidence(output: &str) -> bool {
    let lower = output.to_lowercase();
    const MARKERS: &[&str] = &[
        "test result:",   // cargo test
        " passed",        // pytest / cargo summaries
        " failed",        // summaries counting failures still ran tests
        "running ",       // cargo: "Running unittests"
        "ok ",            // go test
        "assertions",     // various harnesses
    ];
    MARKERS.iter().any(|m| lower.contains(m))
}

/// Did the output declare that nothing was collected or run?
fn no_tests_collected(output: &str) -> bool {
    let lower = output.to_lowercase();
    const MARKERS: &[&str] = &[
        "no tests ran",
        "no tests to run",
        "collected 0 items",
        "0 passed; 0 failed",
        "running 0 tests",
        "error: no tests",
    ];
    MARKERS.iter().any(|m| lower.contains(m))
}

/// First token of a `VERIFY.md` body, if it is a result token.
pub fn verdict_of(content: &str) -> Option<&'static str> {
    match content.split_whitespace().next() {
        Some("PASS") => Some("PASS"),
        Some("FAIL") => Some("FAIL"),
        _ => None,
    }
}
