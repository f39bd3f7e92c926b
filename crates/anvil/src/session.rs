//! Session driver: the top-level state machine for debug and harden runs.
//!
//! Sequence: preconditions → shared inputs (context, repro, blackboard) →
//! fan-out of one track runner per configured track → fan-in → judge →
//! apply (debug) or report (harden). Track failures never cross track
//! boundaries; driver failures are caught here, written to the run-root
//! `CRASH.txt`, and turn `RUN_STATUS.json` terminal `FAIL`.

use crate::blackboard;
use crate::context;
use crate::exec::run_git;
use crate::judge;
use crate::layout;
use crate::repro;
use crate::store::ArtifactStore;
use crate::track::{self, TrackContext, TrackOutcome};
use crate::worktree::{WorktreeError, WorktreeManager};
use anvil_core::{
    load_contract, Mode, RunMeta, RunState, RunStatus, Scorecard, SessionConfig, VerifyCommand,
};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Environment variable overriding the verify contract path.
pub const VERIFY_CONTRACT_ENV: &str = "ANVIL_VERIFY_CONTRACT";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("environment precondition failed: {0}")]
    Env(#[from] WorktreeError),
    #[error("schema drift in run artifact {path}: {detail}")]
    ResumeDrift { path: String, detail: String },
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("session crashed: {0}")]
    Crashed(eyre::Report),
}

/// What a finished session reports to the CLI.
#[derive(Debug)]
pub struct SessionReport {
    pub status: RunStatus,
    pub scorecard: Scorecard,
    pub applied: bool,
    pub run_dir: PathBuf,
}

/// Run a session to completion.
pub async fn run(
    config: &SessionConfig,
    cancel: CancellationToken,
) -> Result<SessionReport, SessionError> {
    // Fail-fast preconditions, before any artifact is written.
    let worktrees = WorktreeManager::new(&config.repo, &config.dbg_root, &config.run_id)?;
    let store = ArtifactStore::open(&config.run_dir())?;

    let meta = load_or_init_meta(&store, config)?;
    let issue = config.issue.clone().or_else(|| meta.issue.clone());

    match drive(&store, config, &worktrees, issue, &cancel).await {
        Ok(report) => Ok(report),
        Err(report) => {
            error!(error = %report, "session crashed");
            let _ = store.write_str(
                layout::CRASH_TXT,
                &format!("session {} crashed\n\n{report:?}\n", config.run_id),
            );
            let _ = store.write_json(layout::RUN_STATUS, &RunState::new(RunStatus::Fail, "crash"));
            // Best-effort cleanup so a rerun does not hit WorktreeConflict.
            let names: Vec<String> = config.tracks.iter().map(|t| t.name.clone()).collect();
            worktrees.cleanup_all(&names);
            Err(SessionError::Crashed(report))
        }
    }
}

/// Load run metadata, or write it for a fresh run. Corrupt metadata on
/// resume is schema drift in a tracked artifact and fails the session.
fn load_or_init_meta(store: &ArtifactStore, config: &SessionConfig) -> Result<RunMeta, SessionError> {
    if config.resume && store.exists(layout::RUN_META)? {
        return store
            .read_json::<RunMeta>(layout::RUN_META)
            .map_err(|e| SessionError::ResumeDrift {
                path: layout::RUN_META.to_string(),
                detail: e.to_string(),
            });
    }
    let meta = RunMeta::new(config);
    store.write_json(layout::RUN_META, &meta)?;
    Ok(meta)
}

async fn drive(
    store: &ArtifactStore,
    config: &SessionConfig,
    worktrees: &WorktreeManager,
    issue: Option<String>,
    cancel: &CancellationToken,
) -> crate::AppResult<SessionReport> {
    set_phase(store, RunStatus::Running, "context")?;

    let context_summary = context::build(&config.repo, store)?;
    let contract = load_verify_contract(config);
    let repro_plan = if config.mode == Mode::Debug {
        Some(repro::write(store, issue.as_deref(), &contract)?)
    } else {
        None
    };

    let all_tracks: Vec<String> = config.tracks.iter().map(|t| t.name.clone()).collect();
    blackboard::write(store, &all_tracks)?;

    // Fan out one runner per track. Partial failure is the normal case:
    // a crashed or panicked task becomes a disqualified track, nothing more.
    set_phase(store, RunStatus::Running, "tracks")?;
    let mut join_set: JoinSet<TrackOutcome> = JoinSet::new();
    let mut task_names: HashMap<tokio::task::Id, String> = HashMap::new();

    let track_contract = if config.verify_patches {
        contract.clone()
    } else {
        Vec::new()
    };
    for track_config in &config.tracks {
        let ctx = TrackContext {
            store: store.clone(),
            config: track_config.clone(),
            resume: config.resume,
            container: config.container,
            issue: issue.clone(),
            context_summary: context_summary.clone(),
            repro_plan: repro_plan.clone(),
            contract: track_contract.clone(),
            all_tracks: all_tracks.clone(),
            worktrees: worktrees.clone(),
            cancel: cancel.child_token(),
        };
        let handle = join_set.spawn(track::run_track(ctx));
        task_names.insert(handle.id(), track_config.name.clone());
    }

    let mut outcomes: Vec<TrackOutcome> = Vec::new();
    while let Some(joined) = join_set.join_next_with_id().await {
        match joined {
            Ok((_, outcome)) => outcomes.push(outcome),
            Err(join_error) => {
                // A panicked runner: contain it exactly like an internal
                // track crash.
                let name = task_names
                    .get(&join_error.id())
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                warn!(track = %name, error = %join_error, "track task panicked");
                let _ = store.write_str(
                    layout::track_crash(&name),
                    &format!("track {name} panicked\n\n{join_error}\n"),
                );
                outcomes.push(TrackOutcome {
                    name,
                    disqualified: Some(anvil_core::DisqualifyReason::Crash),
                    iterations_run: 0,
                    has_patch: false,
                });
            }
        }
    }
    info!(tracks = outcomes.len(), "all track runners terminated");

    blackboard::write(store, &all_tracks)?;

    set_phase(store, RunStatus::Running, "judge")?;
    let scorecard = judge::run(store, &config.tracks)?;

    // Operator interrupt: preserve what exists on disk and go terminal FAIL.
    if cancel.is_cancelled() {
        store.write_str(
            layout::CRASH_TXT,
            "session interrupted by operator; pending iterations were skipped\n",
        )?;
        store.write_json(
            layout::RUN_STATUS,
            &RunState::new(RunStatus::Fail, "interrupted"),
        )?;
        return Ok(SessionReport {
            status: RunStatus::Fail,
            scorecard,
            applied: false,
            run_dir: store.root().to_path_buf(),
        });
    }

    let mut applied = false;
    match config.mode {
        Mode::Debug => {
            if config.auto_apply {
                if let Some(winner) = scorecard.winner.clone() {
                    set_phase(store, RunStatus::Running, "apply")?;
                    applied = apply_winner(store, config, &winner)?;
                }
            }
        }
        Mode::Harden => {
            set_phase(store, RunStatus::Running, "report")?;
            write_harden_report(store, &scorecard)?;
        }
    }

    let status = if applied { RunStatus::Done } else { RunStatus::Ok };
    store.write_json(layout::RUN_STATUS, &RunState::new(status, "finished"))?;

    Ok(SessionReport {
        status,
        scorecard,
        applied,
        run_dir: store.root().to_path_buf(),
    })
}

fn set_phase(store: &ArtifactStore, status: RunStatus, phase: &str) -> crate::store::Result<()> {
    store.write_json(layout::RUN_STATUS, &RunState::new(status, phase))?;
    Ok(())
}

/// Resolve and load the verify contract. A missing contract file simply
/// means no declared verification.
fn load_verify_contract(config: &SessionConfig) -> Vec<VerifyCommand> {
    let path = std::env::var(VERIFY_CONTRACT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| config.dbg_root.join("verify.yml"));
    if !path.exists() {
        return Vec::new();
    }
    match load_contract(&path) {
        Ok(contract) => contract,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "verify contract unreadable; ignoring");
            Vec::new()
        }
    }
}

/// Apply the winning track's latest patch to the main repository.
///
/// Pre-flight dry-run first. A patch that is already present is detected by
/// the reverse dry-run and reported without touching the tree.
fn apply_winner(
    store: &ArtifactStore,
    config: &SessionConfig,
    winner: &str,
) -> crate::AppResult<bool> {
    let Some((iteration, patch_abs)) = latest_patch(store, winner) else {
        store.write_str(
            layout::APPLY_MD,
            &format!("# Apply\n\nWinner `{winner}` has no patch artifact; nothing to apply.\n"),
        )?;
        return Ok(false);
    };
    let patch_str = patch_abs.to_string_lossy().to_string();

    if run_git(&config.repo, &["apply", "--check", &patch_str]).is_err() {
        let already = run_git(&config.repo, &["apply", "--reverse", "--check", &patch_str]).is_ok();
        let detail = if already {
            "the patch is already present in the repository; state left untouched"
        } else {
            "pre-flight dry-run failed; the patch does not apply to the repository"
        };
        warn!(winner, iteration, detail, "apply pre-flight rejected patch");
        store.write_str(
            layout::APPLY_MD,
            &format!(
                "# Apply\n\nNOT APPLIED: patch from track `{winner}` iteration {iteration}.\n\n{detail}.\n"
            ),
        )?;
        return Ok(false);
    }

    run_git(&config.repo, &["apply", &patch_str])
        .map_err(|e| eyre::eyre!("apply failed after clean pre-flight: {e}"))?;
    info!(winner, iteration, "applied winning patch to repository");
    store.write_str(
        layout::APPLY_MD,
        &format!(
            "# Apply\n\nAPPLIED: patch from track `{winner}` iteration {iteration} \
             after a clean pre-flight dry-run.\n"
        ),
    )?;
    Ok(true)
}

fn latest_patch(store: &ArtifactStore, track: &str) -> Option<(u32, PathBuf)> {
    for iteration in layout::existing_iterations(store, track).into_iter().rev() {
        let rel = layout::patch_diff(track, iteration);
        if store.exists(&rel).unwrap_or(false) {
            return store.path(&rel).ok().map(|abs| (iteration, abs));
        }
    }
    None
}

/// Harden mode: rank findings across tracks into `HARDEN.md`.
fn write_harden_report(store: &ArtifactStore, scorecard: &Scorecard) -> crate::AppResult<()> {
    let mut ranked: Vec<_> = scorecard.scores.iter().collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.track.cmp(&b.track)));

    let mut out = String::from("# Hardening report\n\n");
    let mut finding_no = 0;
    for score in &ranked {
        let observations = layout::latest_envelope(store, &score.track)
            .map(|(_, e)| e.observations)
            .unwrap_or_default();
        if observations.is_empty() && score.disqualified.is_some() {
            continue;
        }
        out.push_str(&format!(
            "## Track `{}` (score {}{})\n\n",
            score.track,
            score.score,
            if score.has_patch { ", patch attached" } else { "" },
        ));
        if observations.is_empty() {
            finding_no += 1;
            out.push_str(&format!(
                "{finding_no}. No concrete finding was disclosed; see the track's iteration \
                 artifacts.\n\n"
            ));
            continue;
        }
        for obs in observations {
            finding_no += 1;
            out.push_str(&format!("{finding_no}. {obs}\n"));
        }
        out.push('\n');
    }
    if finding_no == 0 {
        out.push_str("No findings were produced.\n");
    }

    store.write_str(layout::HARDEN_MD, &out)?;
    Ok(())
}
