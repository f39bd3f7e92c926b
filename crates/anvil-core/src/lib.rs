pub mod contract;
pub mod envelope;
pub mod prompt;
pub mod redact;
pub mod tracks;
pub mod types;

pub use contract::{load_contract, parse_contract, sanitize_command_name, VerifyCommand};
pub use envelope::{
    extract_patch, validate_iteration, IterationEnvelope, StatusSignal, ValidationError,
};
pub use tracks::{
    load_tracks, load_tracks_with_defaults, parse_tracks, parse_tracks_with_defaults, TracksError,
    KNOWN_PROVIDERS,
};
pub use types::{
    validate_name, DisqualifyReason, IterOutcome, Mode, Role, RunMeta, RunState, RunStatus,
    Scorecard, SessionConfig, TrackBudget, TrackConfig, TrackRecord, TrackScore,
};
