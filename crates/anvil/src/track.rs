//! Track runner: the per-track iteration loop.
//!
//! Each track runs concurrently with its siblings and owns the subtree
//! `tracks/<name>/` plus one worktree. The loop is
//! prompt → agent → validate → persist → (opportunistic verify) →
//! blackboard refresh, bounded by the track budget. Failures are contained
//! here: nothing a track does may disturb another track, so every failure
//! class ends in either a recorded iteration outcome or a recorded
//! disqualification.

use crate::adapter::{adapter_for, AgentContext, AgentOutcome};
use crate::blackboard;
use crate::exec::run_git;
use crate::layout;
use crate::store::ArtifactStore;
use crate::verify::{self, VerifyRequest};
use crate::worktree::{WorktreeError, WorktreeManager};
use anvil_core::envelope::StatusSignal;
use anvil_core::prompt::{self, PromptInputs};
use anvil_core::redact::redact;
use anvil_core::{DisqualifyReason, IterOutcome, Role, TrackConfig, TrackRecord, VerifyCommand};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything a track runner needs, snapshotted before fan-out.
#[derive(Debug, Clone)]
pub struct TrackContext {
    pub store: ArtifactStore,
    pub config: TrackConfig,
    pub resume: bool,
    pub container: bool,
    pub issue: Option<String>,
    pub context_summary: String,
    pub repro_plan: Option<String>,
    pub contract: Vec<VerifyCommand>,
    /// All track names in the session, for blackboard refreshes.
    pub all_tracks: Vec<String>,
    pub worktrees: WorktreeManager,
    pub cancel: CancellationToken,
}

/// What the driver learns when a track terminates.
#[derive(Debug, Clone)]
pub struct TrackOutcome {
    pub name: String,
    pub disqualified: Option<DisqualifyReason>,
    pub iterations_run: u32,
    pub has_patch: bool,
}

/// Run one track to termination. Never propagates an error: internal
/// failures become a `CRASH.txt` under the track directory plus a
/// disqualification.
pub async fn run_track(ctx: TrackContext) -> TrackOutcome {
    let name = ctx.config.name.clone();
    match run_track_inner(&ctx).await {
        Ok(outcome) => outcome,
        Err(report) => {
            error!(track = %name, error = %report, "track crashed");
            let crash = format!("track {name} crashed\n\n{report:?}\n");
            let _ = ctx.store.write_str(layout::track_crash(&name), &crash);
            let record = TrackRecord {
                name: name.clone(),
                role: ctx.config.role,
                provider: ctx.config.provider.clone(),
                provisioned_at: Utc::now(),
                iterations: Vec::new(),
                disqualified: Some(DisqualifyReason::Crash),
            };
            let _ = ctx.store.write_json(layout::track_record(&name), &record);
            TrackOutcome {
                name,
                disqualified: Some(DisqualifyReason::Crash),
                iterations_run: 0,
                has_patch: false,
            }
        }
    }
}

async fn run_track_inner(ctx: &TrackContext) -> crate::AppResult<TrackOutcome> {
    let name = &ctx.config.name;

    // PROVISION
    let worktree = match ctx.worktrees.provision(name, ctx.resume) {
        Ok(path) => path,
        Err(e) => {
            let reason = match e {
                WorktreeError::WorktreeConflict(_) => DisqualifyReason::WorktreeConflict,
                _ => DisqualifyReason::WorktreeFailure,
            };
            warn!(track = %name, error = %e, "provisioning failed");
            let record = TrackRecord {
                name: name.clone(),
                role: ctx.config.role,
                provider: ctx.config.provider.clone(),
                provisioned_at: Utc::now(),
                iterations: Vec::new(),
                disqualified: Some(reason),
            };
            ctx.store.write_json(layout::track_record(name), &record)?;
            return Ok(TrackOutcome {
                name: name.clone(),
                disqualified: Some(reason),
                iterations_run: 0,
                has_patch: false,
            });
        }
    };

    // On resume, keep the original provision timestamp.
    let provisioned_at = ctx
        .store
        .read_json::<TrackRecord>(layout::track_record(name))
        .ok()
        .map_or_else(Utc::now, |r| r.provisioned_at);

    let mut record = TrackRecord {
        name: name.clone(),
        role: ctx.config.role,
        provider: ctx.config.provider.clone(),
        provisioned_at,
        iterations: Vec::new(),
        disqualified: None,
    };
    ctx.store.write_json(layout::track_record(name), &record)?;

    let adapter = adapter_for(&ctx.config.provider);
    let max_iters = ctx.config.budget.max_iters;
    let mut has_patch = false;
    let mut iterations_run = 0_u32;
    let mut done = false;

    for iteration in 1..=max_iters {
        if ctx.cancel.is_cancelled() {
            info!(track = %name, iteration, "cancelled; skipping remaining iterations");
            break;
        }

        // Resume: an iteration that already validates is not re-run.
        if let Some(envelope) = existing_valid_iteration(&ctx.store, name, iteration) {
            info!(track = %name, iteration, "resume: iteration already valid, skipping");
            record.iterations.push(IterOutcome::Ok);
            iterations_run += 1;
            if ctx.store.exists(layout::patch_diff(name, iteration))? {
                has_patch = true;
            }
            if envelope.status_signal == StatusSignal::Done {
                done = true;
                break;
            }
            continue;
        }

        let board = blackboard::build(&ctx.store, &ctx.all_tracks);
        let board_text = board.merged.join("\n");
        let prompt_text = prompt::build(&PromptInputs {
            track: name,
            role: Some(ctx.config.role),
            iteration,
            max_iters,
            issue: ctx.issue.as_deref(),
            context_summary: Some(&ctx.context_summary),
            repro_plan: ctx.repro_plan.as_deref(),
            blackboard: Some(&board_text),
            directives: ctx.config.directives.as_deref(),
        });

        let iter_dir = ctx.store.mkdirs(layout::iter_dir(name, iteration))?;
        let agent_ctx = AgentContext {
            track: name.clone(),
            role: ctx.config.role,
            iteration,
            prompt: prompt_text,
            iter_dir,
            worktree: worktree.clone(),
            model: ctx.config.model.clone(),
            provider_options: ctx.config.provider_options.clone(),
            timeout: Duration::from_secs(ctx.config.budget.per_iter_timeout_s),
            container: ctx.container,
        };

        info!(track = %name, iteration, provider = %ctx.config.provider, "iteration start");
        let outcome = adapter.run_iteration(&agent_ctx).await?;
        iterations_run += 1;

        if outcome.timed_out {
            warn!(track = %name, iteration, "iteration timed out");
            // Keep whatever partial output we captured; no envelope means
            // resume will re-run this iteration.
            ctx.store.write_str(
                layout::iteration_txt(name, iteration),
                &redact(&outcome.raw_text),
            )?;
            record.iterations.push(IterOutcome::TimeoutFailure);
            ctx.store.write_json(layout::track_record(name), &record)?;
            continue;
        }

        ctx.store.write_str(
            layout::iteration_txt(name, iteration),
            &redact(&outcome.raw_text),
        )?;

        let envelope = match &outcome.envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                let reason = classify_invalid(&outcome);
                warn!(track = %name, iteration, error = %e, reason = reason.as_str(),
                      "envelope rejected; disqualifying");
                record.iterations.push(match reason {
                    DisqualifyReason::AgentError => IterOutcome::AgentError,
                    _ => IterOutcome::SchemaDrift,
                });
                record.disqualified = Some(reason);
                ctx.store.write_json(layout::track_record(name), &record)?;
                return Ok(TrackOutcome {
                    name: name.clone(),
                    disqualified: Some(reason),
                    iterations_run,
                    has_patch,
                });
            }
        };

        ctx.store
            .write_json(layout::iteration_json(name, iteration), envelope)?;

        let mut patched_this_iter = false;
        if let Some(patch) = &outcome.patch {
            ctx.store
                .write_str(layout::patch_diff(name, iteration), patch)?;
            has_patch = true;
            patched_this_iter = true;
            apply_patch_to_worktree(&ctx.store, name, iteration, &worktree);
        } else if envelope.patch_present {
            warn!(track = %name, iteration, "envelope claims patch_present but no diff was found");
        }

        // Opportunistic verification: only when there is candidate state to
        // check and a contract to check it against.
        let should_verify = !ctx.contract.is_empty()
            && (patched_this_iter
                || (envelope.status_signal == StatusSignal::SkipToVerify && has_patch));
        if should_verify {
            let request = VerifyRequest {
                store: &ctx.store,
                out_dir: layout::iter_dir(name, iteration),
                workdir: worktree.clone(),
                timeout: Duration::from_secs(ctx.config.budget.per_iter_timeout_s),
                container: ctx.container,
            };
            match verify::run(&request, &ctx.contract).await {
                Ok(outcome) => {
                    info!(track = %name, iteration, passed = outcome.passed, "verification finished");
                }
                Err(e) => {
                    // Verifier trouble lowers the score via a FAIL artifact
                    // at worst; it is never track-fatal.
                    warn!(track = %name, iteration, error = %e, "verification errored");
                }
            }
        }

        record.iterations.push(IterOutcome::Ok);
        ctx.store.write_json(layout::track_record(name), &record)?;
        blackboard::write(&ctx.store, &ctx.all_tracks)?;

        if envelope.status_signal == StatusSignal::Done {
            info!(track = %name, iteration, "track signalled DONE");
            done = true;
            break;
        }
    }

    // Loop-exit disqualifications.
    let all_timed_out = !record.iterations.is_empty()
        && record
            .iterations
            .iter()
            .all(|o| *o == IterOutcome::TimeoutFailure);
    let disqualified = if all_timed_out {
        Some(DisqualifyReason::Timeout)
    } else if ctx.config.role == Role::Fixer && !has_patch {
        Some(DisqualifyReason::NoPatch)
    } else {
        None
    };

    if let Some(reason) = disqualified {
        warn!(track = %name, reason = reason.as_str(), "track disqualified at loop exit");
    } else {
        info!(track = %name, iterations_run, has_patch, done, "track finished");
    }

    record.disqualified = disqualified;
    ctx.store.write_json(layout::track_record(name), &record)?;

    Ok(TrackOutcome {
        name: name.clone(),
        disqualified,
        iterations_run,
        has_patch,
    })
}

/// A rejected envelope is agent misbehavior when the process itself failed,
/// schema drift when the process claimed success.
fn classify_invalid(outcome: &AgentOutcome) -> DisqualifyReason {
    if outcome.exit_code != 0 {
        DisqualifyReason::AgentError
    } else {
        DisqualifyReason::SchemaDrift
    }
}

fn existing_valid_iteration(
    store: &ArtifactStore,
    track: &str,
    iteration: u32,
) -> Option<anvil_core::IterationEnvelope> {
    let text = store
        .read_to_string(layout::iteration_json(track, iteration))
        .ok()?;
    anvil_core::validate_iteration(&text).ok()
}

/// Bring the worktree up to the candidate state when the agent returned a
/// patch it did not apply itself.
fn apply_patch_to_worktree(store: &ArtifactStore, track: &str, iteration: u32, worktree: &Path) {
    let Ok(patch_abs) = store.path(layout::patch_diff(track, iteration)) else {
        return;
    };
    let patch_str = patch_abs.to_string_lossy().to_string();
    if run_git(worktree, &["apply", "--check", &patch_str]).is_ok() {
        match run_git(worktree, &["apply", &patch_str]) {
            Ok(_) => info!(track, iteration, "applied patch to worktree"),
            Err(e) => warn!(track, iteration, error = %e, "patch apply failed after check"),
        }
    } else {
        // Usually means the agent already edited the tree directly.
        info!(track, iteration, "patch does not apply cleanly; leaving worktree as-is");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::run_git;
    use anvil_core::TrackBudget;
    use tempfile::TempDir;

    fn scratch_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run_git(dir.path(), &["init"]).unwrap();
        run_git(dir.path(), &["config", "user.email", "test@test.com"]).unwrap();
        run_git(dir.path(), &["config", "user.name", "Test"]).unwrap();
        std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
        run_git(dir.path(), &["add", "."]).unwrap();
        run_git(dir.path(), &["commit", "-m", "Initial commit"]).unwrap();
        dir
    }

    fn track_config(name: &str, role: Role, provider: &str, max_iters: u32) -> TrackConfig {
        TrackConfig {
            name: name.to_string(),
            role,
            provider: provider.to_string(),
            model: None,
            directives: None,
            provider_options: std::collections::BTreeMap::new(),
            budget: TrackBudget {
                max_iters,
                per_iter_timeout_s: 30,
            },
        }
    }

    fn context(repo: &TempDir, config: TrackConfig) -> (ArtifactStore, TrackContext) {
        let dbg_root = repo.path().join(".dbg");
        let store = ArtifactStore::open(&dbg_root.join("runs/r1")).unwrap();
        let worktrees = WorktreeManager::new(repo.path(), &dbg_root, "r1").unwrap();
        let all_tracks = vec![config.name.clone()];
        let ctx = TrackContext {
            store: store.clone(),
            config,
            resume: false,
            container: false,
            issue: Some("fix the bug".to_string()),
            context_summary: "a tiny repo".to_string(),
            repro_plan: None,
            contract: Vec::new(),
            all_tracks,
            worktrees,
            cancel: CancellationToken::new(),
        };
        (store, ctx)
    }

    #[tokio::test]
    async fn manual_track_runs_one_iteration() {
        let repo = scratch_repo();
        let (store, ctx) = context(&repo, track_config("solo", Role::Debugger, "manual", 1));

        let outcome = run_track(ctx).await;
        assert_eq!(outcome.name, "solo");
        assert!(outcome.disqualified.is_none());
        assert_eq!(outcome.iterations_run, 1);
        assert!(!outcome.has_patch);

        assert!(store.exists("tracks/solo/iter_01/ITERATION.json").unwrap());
        assert!(store.exists("tracks/solo/iter_01/ITERATION.txt").unwrap());
        assert!(store.exists("tracks/solo/TRACK.json").unwrap());

        let record: TrackRecord = store.read_json("tracks/solo/TRACK.json").unwrap();
        assert_eq!(record.iterations, vec![IterOutcome::Ok]);
        assert!(record.disqualified.is_none());
    }

    #[tokio::test]
    async fn manual_fixer_is_disqualified_for_no_patch() {
        let repo = scratch_repo();
        let (store, ctx) = context(&repo, track_config("fix", Role::Fixer, "manual", 1));

        let outcome = run_track(ctx).await;
        assert_eq!(outcome.disqualified, Some(DisqualifyReason::NoPatch));

        let record: TrackRecord = store.read_json("tracks/fix/TRACK.json").unwrap();
        assert_eq!(record.disqualified, Some(DisqualifyReason::NoPatch));
        // The iteration itself was fine; disqualification came at loop exit.
        assert_eq!(record.iterations, vec![IterOutcome::Ok]);
    }

    #[tokio::test]
    async fn unknown_provider_track_is_disqualified() {
        let repo = scratch_repo();
        let (store, ctx) = context(&repo, track_config("odd", Role::Breaker, "hal9000", 2));

        let outcome = run_track(ctx).await;
        assert_eq!(outcome.disqualified, Some(DisqualifyReason::AgentError));
        // Disqualification is terminal: one iteration, not two.
        assert_eq!(outcome.iterations_run, 1);
        assert!(store.exists("tracks/odd/iter_01/ITERATION.txt").unwrap());
        assert!(!store.exists("tracks/odd/iter_01/ITERATION.json").unwrap());
    }

    #[tokio::test]
    async fn worktree_conflict_disqualifies_without_iterating() {
        let repo = scratch_repo();
        run_git(repo.path(), &["branch", "dbg/r1/solo", "HEAD"]).unwrap();
        let (store, ctx) = context(&repo, track_config("solo", Role::Debugger, "manual", 1));

        let outcome = run_track(ctx).await;
        assert_eq!(outcome.disqualified, Some(DisqualifyReason::WorktreeConflict));
        assert_eq!(outcome.iterations_run, 0);
        let record: TrackRecord = store.read_json("tracks/solo/TRACK.json").unwrap();
        assert_eq!(record.disqualified, Some(DisqualifyReason::WorktreeConflict));
    }

    #[tokio::test]
    async fn resume_skips_valid_iterations() {
        let repo = scratch_repo();
        let (store, mut ctx) = context(&repo, track_config("solo", Role::Debugger, "manual", 2));

        // First run completes both iterations.
        run_track(ctx.clone()).await;
        let first = store
            .read("tracks/solo/iter_01/ITERATION.json")
            .unwrap();

        // Resume must not rewrite iteration 1.
        let mtime_before = std::fs::metadata(
            store.path("tracks/solo/iter_01/ITERATION.json").unwrap(),
        )
        .unwrap()
        .modified()
        .unwrap();

        ctx.resume = true;
        let outcome = run_track(ctx).await;
        assert!(outcome.disqualified.is_none());

        let mtime_after = std::fs::metadata(
            store.path("tracks/solo/iter_01/ITERATION.json").unwrap(),
        )
        .unwrap()
        .modified()
        .unwrap();
        assert_eq!(mtime_before, mtime_after);
        assert_eq!(
            store.read("tracks/solo/iter_01/ITERATION.json").unwrap(),
            first
        );
    }

    #[tokio::test]
    async fn cancelled_track_skips_pending_iterations() {
        let repo = scratch_repo();
        let (_store, ctx) = context(&repo, track_config("solo", Role::Debugger, "manual", 5));
        ctx.cancel.cancel();

        let outcome = run_track(ctx).await;
        assert_eq!(outcome.iterations_run, 0);
        // Not disqualified: cancellation is an operator action.
        assert!(outcome.disqualified.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_on_first_iteration_recovers_on_second() {
        use std::os::unix::fs::PermissionsExt;

        let repo = scratch_repo();
        let bin = repo.path().join("slow-then-fast");
        // First invocation stalls past the budget; the retry answers fast.
        std::fs::write(
            &bin,
            "#!/bin/sh\ncat > /dev/null\n\
             if [ ! -f .first_attempt_done ]; then touch .first_attempt_done; sleep 30; fi\n\
             echo '{\"hypothesis\": \"recovered\", \"experiments\": [], \"proposed_changes\": [], \
             \"confidence\": 0.4, \"status_signal\": \"DONE\", \"observations\": []}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = track_config("flaky", Role::Debugger, "claude", 2);
        config.budget.per_iter_timeout_s = 1;
        config.provider_options.insert(
            "bin".to_string(),
            serde_json::Value::String(bin.to_string_lossy().to_string()),
        );
        let (store, ctx) = context(&repo, config);

        let outcome = run_track(ctx).await;
        // One TimeoutFailure, then a valid iteration: track stays eligible.
        assert!(outcome.disqualified.is_none());
        assert_eq!(outcome.iterations_run, 2);

        let record: TrackRecord = store.read_json("tracks/flaky/TRACK.json").unwrap();
        assert_eq!(
            record.iterations,
            vec![IterOutcome::TimeoutFailure, IterOutcome::Ok]
        );
        assert!(!store.exists("tracks/flaky/iter_01/ITERATION.json").unwrap());
        assert!(store.exists("tracks/flaky/iter_02/ITERATION.json").unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn all_iterations_timing_out_disqualifies() {
        use std::os::unix::fs::PermissionsExt;

        let repo = scratch_repo();
        let bin = repo.path().join("always-slow");
        std::fs::write(&bin, "#!/bin/sh\ncat > /dev/null\nsleep 30\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = track_config("stuck", Role::Debugger, "claude", 2);
        config.budget.per_iter_timeout_s = 1;
        config.provider_options.insert(
            "bin".to_string(),
            serde_json::Value::String(bin.to_string_lossy().to_string()),
        );
        let (store, ctx) = context(&repo, config);

        let outcome = run_track(ctx).await;
        assert_eq!(outcome.disqualified, Some(DisqualifyReason::Timeout));
        let record: TrackRecord = store.read_json("tracks/stuck/TRACK.json").unwrap();
        assert_eq!(
            record.iterations,
            vec![IterOutcome::TimeoutFailure, IterOutcome::TimeoutFailure]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn schema_drift_disqualifies_on_clean_exit_with_bad_envelope() {
        use std::os::unix::fs::PermissionsExt;

        let repo = scratch_repo();
        let bin = repo.path().join("fake-agent");
        // Exit 0 with an envelope whose hypothesis is empty: schema drift.
        std::fs::write(
            &bin,
            "#!/bin/sh\ncat > /dev/null\n\
             echo '{\"hypothesis\": \"\", \"experiments\": [], \"proposed_changes\": [], \
             \"confidence\": 0.5, \"status_signal\": \"CONTINUE\", \"observations\": []}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = track_config("drifty", Role::Debugger, "claude", 3);
        config.provider_options.insert(
            "bin".to_string(),
            serde_json::Value::String(bin.to_string_lossy().to_string()),
        );
        let (store, ctx) = context(&repo, config);

        let outcome = run_track(ctx).await;
        assert_eq!(outcome.disqualified, Some(DisqualifyReason::SchemaDrift));
        assert!(store.exists("tracks/drifty/iter_01/ITERATION.txt").unwrap());
        assert!(!store.exists("tracks/drifty/iter_01/ITERATION.json").unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fixer_with_patch_keeps_worktree_candidate_state() {
        use std::os::unix::fs::PermissionsExt;

        let repo = scratch_repo();
        let bin = repo.path().join("fake-agent");
        // Emits a valid envelope plus a patch against README.md.
        std::fs::write(
            &bin,
            r#"#!/bin/sh
cat > /dev/null
cat <<'EOF'
```json
{"hypothesis": "typo in readme", "experiments": [], "proposed_changes": [],
 "confidence": 0.8, "status_signal": "DONE", "observations": ["readme fixed"],
 "patch_present": true}
```
```diff
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-# Test
+# Tested
```
EOF
"#,
        )
        .unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = track_config("fix", Role::Fixer, "claude", 2);
        config.provider_options.insert(
            "bin".to_string(),
            serde_json::Value::String(bin.to_string_lossy().to_string()),
        );
        let (store, ctx) = context(&repo, config);
        let worktree = ctx.worktrees.get_path("fix");

        let outcome = run_track(ctx).await;
        assert!(outcome.disqualified.is_none());
        assert!(outcome.has_patch);
        // DONE on iteration 1 stops the loop.
        assert_eq!(outcome.iterations_run, 1);

        assert!(store.exists("tracks/fix/iter_01/PATCH.diff").unwrap());
        let readme = std::fs::read_to_string(worktree.join("README.md")).unwrap();
        assert_eq!(readme, "# Tested\n");

        // Main repository is untouched.
        let main_readme = std::fs::read_to_string(repo.path().join("README.md")).unwrap();
        assert_eq!(main_readme, "# Test\n");
    }
}
