//! Tracks configuration file loading.
//!
//! The tracks file is a declarative YAML list of track records. Validation
//! happens entirely at load time: unknown providers, duplicate or invalid
//! names, and zero iteration budgets are rejected before a session starts.

use crate::types::{validate_name, NameError, Role, TrackBudget, TrackConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Providers the adapter registry knows how to construct.
pub const KNOWN_PROVIDERS: &[&str] = &["manual", "claude", "codex"];

#[derive(Debug, Error)]
pub enum TracksError {
    #[error("failed to read tracks file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse tracks file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("tracks file defines no tracks")]
    Empty,
    #[error("invalid track name: {0}")]
    Name(#[from] NameError),
    #[error("duplicate track name: {0}")]
    DuplicateName(String),
    #[error("unknown provider {provider:?} for track {track:?}")]
    UnknownProvider { track: String, provider: String },
    #[error("track {0:?} has max_iters = 0, need at least 1")]
    ZeroIterations(String),
}

pub type Result<T> = std::result::Result<T, TracksError>;

/// Raw on-disk record. `budgets` is optional and defaulted per field so a
/// minimal track is just `{name, role, provider}`.
#[derive(Debug, Deserialize)]
struct RawTrack {
    name: String,
    role: Role,
    provider: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    directives: Option<String>,
    #[serde(default)]
    provider_options: std::collections::BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    budgets: RawBudget,
}

#[derive(Debug, Default, Deserialize)]
struct RawBudget {
    #[serde(default)]
    max_iters: Option<u32>,
    #[serde(default)]
    per_iter_timeout_s: Option<u64>,
}

/// Load and validate a tracks file.
pub fn load_tracks(path: &Path) -> Result<Vec<TrackConfig>> {
    load_tracks_with_defaults(path, TrackBudget::default())
}

/// Load and validate a tracks file, filling absent budget fields from
/// `defaults` (the CLI derives these from environment toggles).
pub fn load_tracks_with_defaults(path: &Path, defaults: TrackBudget) -> Result<Vec<TrackConfig>> {
    let content = std::fs::read_to_string(path)?;
    parse_tracks_with_defaults(&content, defaults)
}

/// Parse and validate tracks file content.
pub fn parse_tracks(content: &str) -> Result<Vec<TrackConfig>> {
    parse_tracks_with_defaults(content, TrackBudget::default())
}

/// Parse and validate tracks file content with explicit budget defaults.
pub fn parse_tracks_with_defaults(
    content: &str,
    defaults: TrackBudget,
) -> Result<Vec<TrackConfig>> {
    let raw: Vec<RawTrack> = serde_yaml::from_str(content)?;
    if raw.is_empty() {
        return Err(TracksError::Empty);
    }
    let mut seen: HashSet<String> = HashSet::new();
    let mut tracks = Vec::with_capacity(raw.len());

    for record in raw {
        validate_name(&record.name)?;
        if !seen.insert(record.name.clone()) {
            return Err(TracksError::DuplicateName(record.name));
        }
        if !KNOWN_PROVIDERS.contains(&record.provider.as_str()) {
            return Err(TracksError::UnknownProvider {
                track: record.name,
                provider: record.provider,
            });
        }
        let budget = TrackBudget {
            max_iters: record.budgets.max_iters.unwrap_or(defaults.max_iters),
            per_iter_timeout_s: record
                .budgets
                .per_iter_timeout_s
                .unwrap_or(defaults.per_iter_timeout_s),
        };
        if budget.max_iters == 0 {
            return Err(TracksError::ZeroIterations(record.name));
        }
        tracks.push(TrackConfig {
            name: record.name,
            role: record.role,
            provider: record.provider,
            model: record.model,
            directives: record.directives,
            provider_options: record.provider_options,
            budget,
        });
    }

    Ok(tracks)
}
