//! Judge: deterministic winner selection from artifacts alone.
//!
//! Scoring reads nothing but the persisted run directory, so judging a run
//! twice (or on another machine) produces the same scorecard.
//!
//! Per non-disqualified track:
//!   base  = 100 x confidence of the latest valid envelope
//!   +10     a PATCH.diff exists in any iteration
//!   +40     latest VERIFY.md exists and starts with PASS
//!   -100    latest VERIFY.md exists and starts with FAIL
//!   -50/-10 fixer/breaker that never produced a patch
//! Disqualified tracks score 0 and cannot win.

use crate::layout;
use crate::store::{ArtifactStore, Result};
use crate::verify::verdict_of;
use anvil_core::{Role, Scorecard, TrackConfig, TrackRecord, TrackScore};
use chrono::{DateTime, Utc};
use tracing::info;

/// One track's evidence, assembled from the run directory.
#[derive(Debug)]
struct Evidence {
    score: TrackScore,
    provisioned_at: Option<DateTime<Utc>>,
}

/// Score every track, pick the winner, persist `SCORECARD.json` and
/// `DECISION.md`.
pub fn run(store: &ArtifactStore, tracks: &[TrackConfig]) -> Result<Scorecard> {
    let mut evidence: Vec<Evidence> = tracks.iter().map(|t| assess(store, t)).collect();
    evidence.sort_by(|a, b| a.score.track.cmp(&b.score.track));

    let winner = select_winner(&evidence);
    let scorecard = Scorecard {
        winner: winner.clone(),
        scores: evidence.iter().map(|e| e.score.clone()).collect(),
    };

    store.write_json(layout::SCORECARD_JSON, &scorecard)?;
    store.write_str(layout::DECISION_MD, &render_decision(&scorecard))?;

    info!(winner = winner.as_deref().unwrap_or("none"), "judge decided");
    Ok(scorecard)
}

fn assess(store: &ArtifactStore, track: &TrackConfig) -> Evidence {
    let record: Option<TrackRecord> = store.read_json(layout::track_record(&track.name)).ok();
    let disqualified = record.as_ref().and_then(|r| r.disqualified);
    let provisioned_at = record.as_ref().map(|r| r.provisioned_at);

    let iterations = layout::existing_iterations(store, &track.name);
    let has_patch = iterations
        .iter()
        .any(|&i| store.exists(layout::patch_diff(&track.name, i)).unwrap_or(false));

    // Scoring reads the most recent verify artifact across iterations.
    let latest_verdict = iterations.iter().rev().find_map(|&i| {
        let content = store
            .read_to_string(layout::verify_md(&track.name, i))
            .ok()?;
        verdict_of(&content)
    });
    // The `verified` tag is stricter: the latest iteration itself must hold
    // a passing VERIFY.md.
    let verified = iterations.last().is_some_and(|&i| {
        store
            .read_to_string(layout::verify_md(&track.name, i))
            .map(|content| verdict_of(&content) == Some("PASS"))
            .unwrap_or(false)
    });

    let score = if disqualified.is_some() {
        0
    } else {
        compute_score(
            layout::latest_envelope(store, &track.name)
                .map(|(_, e)| e.confidence)
                .unwrap_or(0.0),
            has_patch,
            latest_verdict,
            track.role,
        )
    };

    Evidence {
        score: TrackScore {
            track: track.name.clone(),
            role: track.role,
            score,
            disqualified,
            verified: verified && disqualified.is_none(),
            has_patch,
        },
        provisioned_at,
    }
}

fn compute_score(
    confidence: f64,
    has_patch: bool,
    latest_verdict: Option<&'static str>,
    role: Role,
) -> i64 {
    let mut score = (100.0 * confidence).round() as i64;
    if has_patch {
        score += 10;
    }
    match latest_verdict {
        Some("PASS") => score += 40,
        Some("FAIL") => score -= 100,
        _ => {}
    }
    if !has_patch {
        score += match role {
            Role::Fixer => -50,
            Role::Breaker => -10,
            _ => 0,
        };
    }
    score
}

/// Winner: strictly positive maximum score among eligible tracks. Ties go
/// to (a) verified tracks, (b) the earliest provisioned, (c) the
/// lexicographically first name. `evidence` must already be name-sorted,
/// which makes (c) implicit.
fn select_winner(evidence: &[Evidence]) -> Option<String> {
    evidence
        .iter()
        .filter(|e| e.score.disqualified.is_none() && e.score.score > 0)
        .max_by(|a, b| {
            a.score
                .score
                .cmp(&b.score.score)
                .then_with(|| a.score.verified.cmp(&b.score.verified))
                .then_with(|| {
                    // Earlier provision wins: compare reversed.
                    let a_ts = a.provisioned_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
                    let b_ts = b.provisioned_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
                    b_ts.cmp(&a_ts)
                })
                .then_with(|| b.score.track.cmp(&a.score.track))
        })
        .map(|e| e.score.track.clone())
}

fn render_decision(scorecard: &Scorecard) -> String {
    let mut out = String::from("# Decision\n\n");
    match &scorecard.winner {
        Some(winner) => out.push_str(&format!("Winner: **{winner}**\n\n")),
        None => out.push_str("No winner: no track reached a positive score.\n\n"),
    }
    out.push_str("| track | role | score | verified | patch | disqualified |\n");
    out.push_str("|---|---|---|---|---|---|\n");
    for score in &scorecard.scores {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            score.track,
            score.role.as_str(),
            score.score,
            if score.verified { "yes" } else { "no" },
            if score.has_patch { "yes" } else { "no" },
            score.disqualified.map_or("-", |d| d.as_str()),
        ));
    }
    out
}
