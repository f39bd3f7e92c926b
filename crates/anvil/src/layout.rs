//! Run-directory layout helpers.
//!
//! All paths are relative to the run root and go through the artifact
//! store. Iteration directories are `tracks/<name>/iter_<NN>/`, 1-indexed.

use crate::store::ArtifactStore;
use std::path::PathBuf;

pub const RUN_META: &str = "RUN.json";
pub const RUN_STATUS: &str = "RUN_STATUS.json";
pub const CONTEXT_MD: &str = "CONTEXT.md";
pub const FILES_JSON: &str = "FILES.json";
pub const REPRO_MD: &str = "REPRO.md";
pub const BLACKBOARD_MD: &str = "BLACKBOARD.md";
pub const BLACKBOARD_JSON: &str = "BLACKBOARD.json";
pub const SCORECARD_JSON: &str = "SCORECARD.json";
pub const DECISION_MD: &str = "DECISION.md";
pub const APPLY_MD: &str = "APPLY.md";
pub const HARDEN_MD: &str = "HARDEN.md";
pub const CRASH_TXT: &str = "CRASH.txt";

pub fn track_dir(track: &str) -> PathBuf {
    PathBuf::from("tracks").join(track)
}

pub fn track_record(track: &str) -> PathBuf {
    track_dir(track).join("TRACK.json")
}

pub fn track_crash(track: &str) -> PathBuf {
    track_dir(track).join(CRASH_TXT)
}

pub fn iter_dir(track: &str, iteration: u32) -> PathBuf {
    track_dir(track).join(format!("iter_{iteration:02}"))
}

pub fn iteration_json(track: &str, iteration: u32) -> PathBuf {
    iter_dir(track, iteration).join("ITERATION.json")
}

pub fn iteration_txt(track: &str, iteration: u32) -> PathBuf {
    iter_dir(track, iteration).join("ITERATION.txt")
}

pub fn patch_diff(track: &str, iteration: u32) -> PathBuf {
    iter_dir(track, iteration).join("PATCH.diff")
}

pub fn verify_md(track: &str, iteration: u32) -> PathBuf {
    iter_dir(track, iteration).join("VERIFY.md")
}

/// Iteration indices that have a directory on disk, ascending.
pub fn existing_iterations(store: &ArtifactStore, track: &str) -> Vec<u32> {
    let Ok(dir) = store.path(track_dir(track)) else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut iters: Vec<u32> = entries
        .filter_map(std::result::Result::ok)
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.strip_prefix("iter_")?.parse::<u32>().ok()
        })
        .collect();
    iters.sort_unstable();
    iters
}

/// Highest iteration index with a valid `ITERATION.json`, if any.
pub fn latest_envelope(
    store: &ArtifactStore,
    track: &str,
) -> Option<(u32, anvil_core::IterationEnvelope)> {
    for iteration in existing_iterations(store, track).into_iter().rev() {
        let rel = iteration_json(track, iteration);
        let Ok(text) = store.read_to_string(&rel) else {
            continue;
        };
        if let Ok(envelope) = anvil_core::validate_iteration(&text) {
            return Some((iteration, envelope));
        }
    }
    None
}
