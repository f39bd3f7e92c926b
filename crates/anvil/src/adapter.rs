//! Agent adapters: the uniform contract around opaque agent processes.
//!
//! An adapter is a capability with a single method. The registry constructs
//! one by provider name; an unknown name yields the synthesized `error`
//! adapter, whose outcome disqualifies the track. (Tracks files reject
//! unknown providers at load time, so the error adapter only fires for
//! configurations built around the loader.)

use crate::exec::{run_shell, ExecRequest};
use anvil_core::envelope::{self, IterationEnvelope, StatusSignal, ValidationError};
use anvil_core::types::Role;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("exec error: {0}")]
    Exec(#[from] crate::exec::ExecError),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Everything an adapter needs for one iteration.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub track: String,
    pub role: Role,
    pub iteration: u32,
    /// Assembled prompt text (see `anvil_core::prompt`).
    pub prompt: String,
    /// Absolute iteration directory; the adapter writes `PROMPT.txt` here.
    pub iter_dir: PathBuf,
    /// The track's isolated worktree; agent processes run with this cwd.
    pub worktree: PathBuf,
    pub model: Option<String>,
    /// Provider-specific knobs from the tracks file (e.g. `bin`).
    pub provider_options: std::collections::BTreeMap<String, serde_json::Value>,
    pub timeout: Duration,
    pub container: bool,
}

impl AgentContext {
    /// String-valued provider option, when present.
    fn option_str(&self, key: &str) -> Option<&str> {
        self.provider_options.get(key).and_then(|v| v.as_str())
    }
}

/// What came back from one agent invocation.
#[derive(Debug)]
pub struct AgentOutcome {
    /// Raw standard-output text (pre-redaction).
    pub raw_text: String,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub timed_out: bool,
    /// Envelope extracted from `raw_text` by the schema validator.
    pub envelope: std::result::Result<IterationEnvelope, ValidationError>,
    /// Unified-diff block extracted from `raw_text`, if any.
    pub patch: Option<String>,
}

/// Capability contract for one agent kind.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Run one iteration: build inputs on disk, invoke the agent, extract
    /// the envelope and patch from its output.
    async fn run_iteration(&self, ctx: &AgentContext) -> Result<AgentOutcome>;

    /// Registry key of this adapter.
    fn provider(&self) -> &'static str;
}

/// Construct the adapter for a provider name.
pub fn adapter_for(provider: &str) -> Box<dyn AgentAdapter> {
    match provider {
        "manual" => Box::new(ManualAdapter),
        "claude" => Box::new(ClaudeAdapter),
        "codex" => Box::new(CodexAdapter),
        other => Box::new(ErrorAdapter {
            requested: other.to_string(),
        }),
    }
}

fn outcome_from_raw(raw_text: String, duration_ms: u64, exit_code: i32, timed_out: bool) -> AgentOutcome {
    let envelope = envelope::validate_iteration(&raw_text);
    let patch = envelope::extract_patch(&raw_text);
    AgentOutcome {
        raw_text,
        duration_ms,
        exit_code,
        timed_out,
        envelope,
        patch,
    }
}

/// Quote a string for safe interpolation into a `sh -c` command line.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Shared path for process-backed adapters: persist the prompt, run the
/// command in the worktree, read captured stdout back.
async fn run_process_adapter(ctx: &AgentContext, command: String) -> Result<AgentOutcome> {
    std::fs::create_dir_all(&ctx.iter_dir)?;
    std::fs::write(ctx.iter_dir.join("PROMPT.txt"), &ctx.prompt)?;

    let result = run_shell(&ExecRequest {
        command,
        cwd: ctx.worktree.clone(),
        timeout: ctx.timeout,
        logs_dir: ctx.iter_dir.join("logs"),
        log_stem: "agent".to_string(),
        container: ctx.container,
    })
    .await?;

    info!(
        track = %ctx.track,
        iteration = ctx.iteration,
        exit_code = result.exit_code,
        timed_out = result.timed_out,
        duration_ms = result.elapsed_ms,
        "agent process finished"
    );

    Ok(outcome_from_raw(
        result.stdout(),
        result.elapsed_ms,
        result.exit_code,
        result.timed_out,
    ))
}

// --- Claude ---

/// Claude CLI adapter (`claude -p`).
pub struct ClaudeAdapter;

#[async_trait]
impl AgentAdapter for ClaudeAdapter {
    async fn run_iteration(&self, ctx: &AgentContext) -> Result<AgentOutcome> {
        let bin = ctx.option_str("bin").unwrap_or("claude");
        let model = ctx.model.as_deref().unwrap_or("opus");
        let prompt_path = ctx.iter_dir.join("PROMPT.txt");
        let command = format!(
            "{} -p --dangerously-skip-permissions --model {} < {}",
            shell_quote(bin),
            shell_quote(model),
            shell_quote(&prompt_path.to_string_lossy()),
        );
        run_process_adapter(ctx, command).await
    }

    fn provider(&self) -> &'static str {
        "claude"
    }
}

// --- Codex ---

/// Codex CLI adapter (`codex exec`).
pub struct CodexAdapter;

#[async_trait]
impl AgentAdapter for CodexAdapter {
    async fn run_iteration(&self, ctx: &AgentContext) -> Result<AgentOutcome> {
        let bin = ctx.option_str("bin").unwrap_or("codex");
        let prompt_path = ctx.iter_dir.join("PROMPT.txt");
        let model_flag = ctx
            .model
            .as_deref()
            .map(|m| format!("--model {} ", shell_quote(m)))
            .unwrap_or_default();
        let command = format!(
            "{} exec {model_flag}--full-auto - < {}",
            shell_quote(bin),
            shell_quote(&prompt_path.to_string_lossy()),
        );
        run_process_adapter(ctx, command).await
    }

    fn provider(&self) -> &'static str {
        "codex"
    }
}

// --- Manual ---

/// Adapter for operator-driven tracks: no external process. Writes a
/// template for the operator to fill in and reports `NEEDS_MORE_WORK`.
pub struct ManualAdapter;

const MANUAL_TEMPLATE: &str = "\
# Manual track worksheet

Work the issue by hand in this track's worktree, then record your findings:

1. Edit files in the worktree.
2. Capture observations below.
3. Re-run with a real provider, or judge on the artifacts you produce.

## Observations

(none yet)
";

#[async_trait]
impl AgentAdapter for ManualAdapter {
    async fn run_iteration(&self, ctx: &AgentContext) -> Result<AgentOutcome> {
        std::fs::create_dir_all(&ctx.iter_dir)?;
        std::fs::write(ctx.iter_dir.join("PROMPT.txt"), &ctx.prompt)?;
        std::fs::write(ctx.iter_dir.join("MANUAL.md"), MANUAL_TEMPLATE)?;

        debug!(track = %ctx.track, iteration = ctx.iteration, "manual adapter template written");

        let envelope = IterationEnvelope::minimal(
            "manual track: operator intervention required",
            StatusSignal::NeedsMoreWork,
        );
        let raw_text = format!(
            "Manual track. Worksheet written to MANUAL.md.\n```json\n{}\n```\n",
            serde_json::to_string_pretty(&envelope).unwrap_or_default()
        );
        Ok(outcome_from_raw(raw_text, 0, 0, false))
    }

    fn provider(&self) -> &'static str {
        "manual"
    }
}

// --- Error ---

/// Synthesized adapter for an unknown provider key. Always yields an
/// outcome whose envelope fails validation, which disqualifies the track.
pub struct ErrorAdapter {
    requested: String,
}

#[async_trait]
impl AgentAdapter for ErrorAdapter {
    async fn run_iteration(&self, ctx: &AgentContext) -> Result<AgentOutcome> {
        std::fs::create_dir_all(&ctx.iter_dir)?;
        let raw_text = format!("adapter error: unknown provider {:?}\n", self.requested);
        let mut outcome = outcome_from_raw(raw_text, 0, 2, false);
        outcome.envelope = Err(ValidationError::NoJsonFound);
        Ok(outcome)
    }

    fn provider(&self) -> &'static str {
        "error"
    }
}
