//! Core types for the session orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum length for run identifiers and track names.
pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name exceeds {MAX_NAME_LEN} characters: {0}")]
    TooLong(String),
    #[error("invalid character {1:?} in name: {0}")]
    InvalidChar(String, char),
    #[error("name must start with an alphanumeric character: {0}")]
    BadLeadingChar(String),
}

/// Validate a run identifier or track name.
///
/// Accepted: `[A-Za-z0-9._-]`, 1..=64 characters, alphanumeric first
/// character. These names become branch segments and directory names, so
/// the character set is deliberately narrow.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong(name.to_string()));
    }
    let first = name.chars().next().unwrap_or('-');
    if !first.is_ascii_alphanumeric() {
        return Err(NameError::BadLeadingChar(name.to_string()));
    }
    for c in name.chars() {
        if !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
            return Err(NameError::InvalidChar(name.to_string(), c));
        }
    }
    Ok(())
}

// --- Enumerations ---

/// Session mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Debug,
    Harden,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Harden => "harden",
        }
    }
}

/// Track role. Fixers must produce a patch; breakers hunt for defects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Fixer,
    Breaker,
    Debugger,
    Experimental,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixer => "fixer",
            Self::Breaker => "breaker",
            Self::Debugger => "debugger",
            Self::Experimental => "experimental",
        }
    }
}

/// Run lifecycle status. `Fail` is terminal and always accompanied by a
/// `CRASH.txt` at the run root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Ok,
    Done,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Ok => "OK",
            Self::Done => "DONE",
            Self::Fail => "FAIL",
        }
    }
}

/// Terminal exclusion reasons for a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisqualifyReason {
    WorktreeConflict,
    WorktreeFailure,
    SchemaDrift,
    NoPatch,
    Timeout,
    AgentError,
    Crash,
}

impl DisqualifyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorktreeConflict => "worktree_conflict",
            Self::WorktreeFailure => "worktree_failure",
            Self::SchemaDrift => "schema_drift",
            Self::NoPatch => "no_patch",
            Self::Timeout => "timeout",
            Self::AgentError => "agent_error",
            Self::Crash => "crash",
        }
    }
}

// --- Configuration records ---

/// Iteration budget for one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackBudget {
    /// Number of iterations the track may run (>= 1).
    pub max_iters: u32,
    /// Wall-clock bound for a single iteration, in seconds.
    pub per_iter_timeout_s: u64,
}

impl Default for TrackBudget {
    fn default() -> Self {
        Self {
            max_iters: 3,
            per_iter_timeout_s: 600,
        }
    }
}

/// One configured track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackConfig {
    pub name: String,
    pub role: Role,
    /// Agent adapter registry key (e.g. `manual`, `claude`).
    pub provider: String,
    /// Model identifier passed to the agent process, if any.
    pub model: Option<String>,
    /// Free-form per-track steering text appended to the prompt.
    pub directives: Option<String>,
    /// Provider-specific knobs (e.g. `bin` to override the agent binary).
    #[serde(default)]
    pub provider_options: std::collections::BTreeMap<String, serde_json::Value>,
    pub budget: TrackBudget,
}

/// Immutable configuration for one session run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub run_id: String,
    /// Root for run artifacts and worktrees, typically `<repo>/.dbg`.
    pub dbg_root: std::path::PathBuf,
    pub repo: std::path::PathBuf,
    pub mode: Mode,
    pub issue: Option<String>,
    pub resume: bool,
    pub auto_apply: bool,
    /// Run agent and verification commands inside a container.
    pub container: bool,
    /// Run per-iteration verification when a track produces a patch.
    pub verify_patches: bool,
    pub tracks: Vec<TrackConfig>,
}

impl SessionConfig {
    /// Run directory relative to `dbg_root`.
    pub fn run_dir(&self) -> std::path::PathBuf {
        self.dbg_root.join("runs").join(&self.run_id)
    }

    /// SHA-256 digest of the canonical JSON encoding.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }
}

// --- Persisted run records ---

/// Run metadata, written once at session start (`RUN.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    /// Unix milliseconds at start, for duration math across resumes.
    pub start_unix_ms: i64,
    pub issue: Option<String>,
    pub tracks: Vec<TrackConfig>,
    pub config_digest: String,
}

impl RunMeta {
    pub fn new(config: &SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            run_id: config.run_id.clone(),
            mode: config.mode,
            started_at: now,
            start_unix_ms: now.timestamp_millis(),
            issue: config.issue.clone(),
            tracks: config.tracks.clone(),
            config_digest: config.digest(),
        }
    }
}

/// Mutable run status record (`RUN_STATUS.json`). Single writer: the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub phase: String,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(status: RunStatus, phase: impl Into<String>) -> Self {
        Self {
            status,
            phase: phase.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Outcome class for one iteration, recorded in `TRACK.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterOutcome {
    Ok,
    TimeoutFailure,
    SchemaDrift,
    AgentError,
}

/// Per-track metadata artifact (`tracks/<name>/TRACK.json`).
///
/// The judge's provision-time tie-break reads this record, which keeps
/// winner selection artifact-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRecord {
    pub name: String,
    pub role: Role,
    pub provider: String,
    pub provisioned_at: DateTime<Utc>,
    pub iterations: Vec<IterOutcome>,
    pub disqualified: Option<DisqualifyReason>,
}

// --- Scorecard ---

/// Judge output for one track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackScore {
    pub track: String,
    pub role: Role,
    pub score: i64,
    pub disqualified: Option<DisqualifyReason>,
    pub verified: bool,
    pub has_patch: bool,
}

/// Judge output for the whole run (`SCORECARD.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scorecard {
    pub winner: Option<String>,
    pub scores: Vec<TrackScore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_accepts_restricted_charset() {
        assert_eq!(validate_name("solo"), Ok(()));
        assert_eq!(validate_name("track-1_a.b"), Ok(()));
        assert_eq!(validate_name("A"), Ok(()));
    }

    #[test]
    fn validate_name_rejects_bad_input() {
        assert_eq!(validate_name(""), Err(NameError::Empty));
        assert!(matches!(
            validate_name("has space"),
            Err(NameError::InvalidChar(_, ' '))
        ));
        assert!(matches!(
            validate_name("a/b"),
            Err(NameError::InvalidChar(_, '/'))
        ));
        assert!(matches!(
            validate_name("-leading"),
            Err(NameError::BadLeadingChar(_))
        ));
        let long = "x".repeat(65);
        assert!(matches!(validate_name(&long), Err(NameError::TooLong(_))));
    }

    #[test]
    fn run_status_serializes_screaming() {
        assert_eq!(serde_json::to_string(&RunStatus::Fail).unwrap(), "\"FAIL\"");
        assert_eq!(
            serde_json::to_string(&RunStatus::Running).unwrap(),
            "\"RUNNING\""
        );
    }

    #[test]
    fn disqualify_reason_serializes_snake() {
        assert_eq!(
            serde_json::to_string(&DisqualifyReason::SchemaDrift).unwrap(),
            "\"schema_drift\""
        );
        assert_eq!(DisqualifyReason::NoPatch.as_str(), "no_patch");
    }

    #[test]
    fn budget_default_values() {
        let budget = TrackBudget::default();
        assert_eq!(budget.max_iters, 3);
        assert_eq!(budget.per_iter_timeout_s, 600);
    }

    fn sample_config() -> SessionConfig {
        SessionConfig {
            run_id: "r1".to_string(),
            dbg_root: std::path::PathBuf::from("/repo/.dbg"),
            repo: std::path::PathBuf::from("/repo"),
            mode: Mode::Debug,
            issue: Some("fix typo".to_string()),
            resume: false,
            auto_apply: false,
            container: false,
            verify_patches: true,
            tracks: vec![TrackConfig {
                name: "solo".to_string(),
                role: Role::Debugger,
                provider: "manual".to_string(),
                model: None,
                directives: None,
                provider_options: std::collections::BTreeMap::new(),
                budget: TrackBudget::default(),
            }],
        }
    }

    #[test]
    fn config_digest_is_stable() {
        let config = sample_config();
        assert_eq!(config.digest(), config.digest());

        let mut other = sample_config();
        other.issue = Some("different".to_string());
        assert_ne!(config.digest(), other.digest());
    }

    #[test]
    fn run_dir_layout() {
        let config = sample_config();
        assert_eq!(
            config.run_dir(),
            std::path::PathBuf::from("/repo/.dbg/runs/r1")
        );
    }

    #[test]
    fn run_meta_snapshots_issue_and_tracks() {
        let config = sample_config();
        let meta = RunMeta::new(&config);
        assert_eq!(meta.run_id, "r1");
        assert_eq!(meta.issue.as_deref(), Some("fix typo"));
        assert_eq!(meta.tracks.len(), 1);
        assert_eq!(meta.config_digest, config.digest());
    }
}
