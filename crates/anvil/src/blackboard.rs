//! The blackboard: cross-track observation sharing.
//!
//! Between iterations, each track's latest validated envelope contributes
//! its `observations` to a shared artifact. Writers race under
//! last-writer-wins semantics; the store's atomic rename guarantees readers
//! always see a fully-formed previous snapshot, so no locking is needed.

use crate::layout;
use crate::store::{ArtifactStore, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// In-memory blackboard state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blackboard {
    /// Latest observations per track, keyed by track name.
    pub tracks: BTreeMap<String, Vec<String>>,
    /// Flat merged view, each entry prefixed with its source track.
    pub merged: Vec<String>,
}

impl Blackboard {
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// Render the human-readable form (`BLACKBOARD.md`).
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("# Blackboard\n");
        if self.is_empty() {
            out.push_str("\nNo observations yet.\n");
            return out;
        }
        for (track, observations) in &self.tracks {
            if observations.is_empty() {
                continue;
            }
            out.push_str(&format!("\n## {track}\n\n"));
            for obs in observations {
                out.push_str(&format!("- {obs}\n"));
            }
        }
        out
    }
}

/// Build the blackboard from the latest envelope of each listed track.
pub fn build(store: &ArtifactStore, tracks: &[String]) -> Blackboard {
    let mut board = Blackboard::default();
    // BTreeMap keys iterate sorted, making the merged view deterministic
    // regardless of the caller's track order.
    for track in tracks {
        let observations = layout::latest_envelope(store, track)
            .map(|(_, envelope)| envelope.observations)
            .unwrap_or_default();
        board.tracks.insert(track.clone(), observations);
    }
    for (track, observations) in &board.tracks {
        for obs in observations {
            board.merged.push(format!("[{track}] {obs}"));
        }
    }
    board
}

/// Rebuild from artifacts and persist both forms.
pub fn write(store: &ArtifactStore, tracks: &[String]) -> Result<Blackboard> {
    let board = build(store, tracks);
    store.write_json(layout::BLACKBOARD_JSON, &board)?;
    store.write_str(layout::BLACKBOARD_MD, &board.to_markdown())?;
    Ok(board)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_envelope(store: &ArtifactStore, track: &str, iteration: u32, observations: &[&str]) {
        let obs_json = serde_json::to_string(observations).unwrap();
        let text = format!(
            r#"{{"hypothesis": "h", "experiments": [], "proposed_changes": [],
                "confidence": 0.5, "status_signal": "CONTINUE",
                "observations": {obs_json}}}"#
        );
        store
            .write_str(layout::iteration_json(track, iteration), &text)
            .unwrap();
    }

    fn names(tracks: &[&str]) -> Vec<String> {
        tracks.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn build_collects_latest_observations_per_track() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        write_envelope(&store, "a", 1, &["stale"]);
        write_envelope(&store, "a", 2, &["fresh"]);
        write_envelope(&store, "b", 1, &["from b"]);

        let board = build(&store, &names(&["a", "b"]));
        assert_eq!(board.tracks["a"], vec!["fresh"]);
        assert_eq!(board.merged, vec!["[a] fresh", "[b] from b"]);
    }

    #[test]
    fn tracks_without_envelopes_are_listed_empty() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let board = build(&store, &names(&["ghost"]));
        assert!(board.tracks["ghost"].is_empty());
        assert!(board.is_empty());
    }

    #[test]
    fn write_is_byte_identical_for_identical_inputs() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        write_envelope(&store, "a", 1, &["one", "two"]);

        write(&store, &names(&["a"])).unwrap();
        let first_json = store.read(layout::BLACKBOARD_JSON).unwrap();
        let first_md = store.read(layout::BLACKBOARD_MD).unwrap();

        write(&store, &names(&["a"])).unwrap();
        assert_eq!(store.read(layout::BLACKBOARD_JSON).unwrap(), first_json);
        assert_eq!(store.read(layout::BLACKBOARD_MD).unwrap(), first_md);
    }

    #[test]
    fn markdown_form_sections_by_track() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        write_envelope(&store, "beta", 1, &["cache is stale"]);
        write_envelope(&store, "alpha", 1, &[]);

        let board = build(&store, &names(&["beta", "alpha"]));
        let md = board.to_markdown();
        assert!(md.contains("## beta"));
        assert!(md.contains("- cache is stale"));
        // Empty tracks get no section.
        assert!(!md.contains("## alpha"));
    }

    #[test]
    fn empty_board_markdown() {
        let board = Blackboard::default();
        assert!(board.to_markdown().contains("No observations yet."));
    }
}
