//! Iteration envelope schema, validation, and salvage.
//!
//! Every track iteration must produce a structured JSON envelope. Agents are
//! unreliable emitters, so a lenient salvage pass precedes strict
//! validation: extract the most plausible JSON block from the raw output and
//! repair trivial malformations (trailing commas, unquoted keys). Salvage is
//! a preprocessing pass only; the validated shape itself is strict, and a
//! document that validates is never mutated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no JSON object found in output")]
    NoJsonFound,
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {0} has the wrong type")]
    WrongType(&'static str),
    #[error("hypothesis must be a non-empty string")]
    EmptyHypothesis,
    #[error("confidence must be a finite number in [0.0, 1.0], got {0}")]
    ConfidenceOutOfRange(f64),
    #[error("unknown status_signal: {0}")]
    UnknownStatusSignal(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Per-iteration control signal emitted by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusSignal {
    Continue,
    SkipToVerify,
    NeedsMoreWork,
    Done,
    Blocked,
}

impl StatusSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::SkipToVerify => "SKIP_TO_VERIFY",
            Self::NeedsMoreWork => "NEEDS_MORE_WORK",
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "CONTINUE" => Ok(Self::Continue),
            "SKIP_TO_VERIFY" => Ok(Self::SkipToVerify),
            "NEEDS_MORE_WORK" => Ok(Self::NeedsMoreWork),
            "DONE" => Ok(Self::Done),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(ValidationError::UnknownStatusSignal(other.to_string())),
        }
    }
}

/// The validated per-iteration artifact (`ITERATION.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationEnvelope {
    pub hypothesis: String,
    pub experiments: Vec<Value>,
    pub proposed_changes: Vec<Value>,
    pub confidence: f64,
    pub status_signal: StatusSignal,
    pub observations: Vec<String>,
    #[serde(default)]
    pub patch_present: bool,
}

impl IterationEnvelope {
    /// Minimal valid envelope used by the manual adapter.
    pub fn minimal(hypothesis: impl Into<String>, status_signal: StatusSignal) -> Self {
        Self {
            hypothesis: hypothesis.into(),
            experiments: Vec::new(),
            proposed_changes: Vec::new(),
            confidence: 0.0,
            status_signal,
            observations: Vec::new(),
            patch_present: false,
        }
    }
}

/// Validate raw agent output into an iteration envelope.
///
/// Strict parse of the whole input first; on failure, salvage and retry.
pub fn validate_iteration(text: &str) -> Result<IterationEnvelope> {
    let value = match serde_json::from_str::<Value>(text.trim()) {
        Ok(v) => v,
        Err(_) => {
            let candidate = salvage(text).ok_or(ValidationError::NoJsonFound)?;
            serde_json::from_str::<Value>(&candidate)
                .map_err(|e| ValidationError::Malformed(e.to_string()))?
        }
    };
    validate_value(&value)
}

/// Strictly validate an already-parsed JSON value against the envelope shape.
pub fn validate_value(value: &Value) -> Result<IterationEnvelope> {
    let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

    let hypothesis = obj
        .get("hypothesis")
        .ok_or(ValidationError::MissingField("hypothesis"))?
        .as_str()
        .ok_or(ValidationError::WrongType("hypothesis"))?;
    if hypothesis.trim().is_empty() {
        return Err(ValidationError::EmptyHypothesis);
    }

    let experiments = require_array(obj, "experiments")?.to_vec();
    let proposed_changes = require_array(obj, "proposed_changes")?.to_vec();

    let confidence = obj
        .get("confidence")
        .ok_or(ValidationError::MissingField("confidence"))?
        .as_f64()
        .ok_or(ValidationError::WrongType("confidence"))?;
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(ValidationError::ConfidenceOutOfRange(confidence));
    }

    let signal_str = obj
        .get("status_signal")
        .ok_or(ValidationError::MissingField("status_signal"))?
        .as_str()
        .ok_or(ValidationError::WrongType("status_signal"))?;
    let status_signal = StatusSignal::parse(signal_str)?;

    let observations = require_array(obj, "observations")?
        .iter()
        .map(|v| {
            v.as_str()
                .map(ToString::to_string)
                .ok_or(ValidationError::WrongType("observations"))
        })
        .collect::<Result<Vec<_>>>()?;

    // Optional, defaults false. A present non-boolean is drift.
    let patch_present = match obj.get("patch_present") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(ValidationError::WrongType("patch_present")),
    };

    Ok(IterationEnvelope {
        hypothesis: hypothesis.to_string(),
        experiments,
        proposed_changes,
        confidence,
        status_signal,
        observations,
        patch_present,
    })
}

fn require_array<'a>(
    obj: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a Vec<Value>> {
    obj.get(field)
        .ok_or(ValidationError::MissingField(field))?
        .as_array()
        .ok_or(ValidationError::WrongType(field))
}

// --- Salvage ---

/// Extract the most plausible JSON object from raw output and repair trivial
/// malformations. Returns `None` when no balanced `{...}` block exists.
pub fn salvage(raw: &str) -> Option<String> {
    let block = fenced_block(raw, &["json"])
        .and_then(|body| largest_balanced_object(&body))
        .or_else(|| largest_balanced_object(raw))?;
    Some(repair(&block))
}

/// Find the largest balanced `{...}` block, honoring strings and escapes.
fn largest_balanced_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut stack: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(i),
            b'}' => {
                if let Some(start) = stack.pop() {
                    // Only top-level blocks are candidates.
                    if stack.is_empty() {
                        let len = i + 1 - start;
                        if best.map_or(true, |(s, e)| len > e - s) {
                            best = Some((start, i + 1));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(s, e)| text[s..e].to_string())
}

/// Extract the body of the first fenced code block with one of the given
/// language tags.
pub fn fenced_block(raw: &str, langs: &[&str]) -> Option<String> {
    let mut lines = raw.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        let Some(tag) = trimmed.strip_prefix("```") else {
            continue;
        };
        if !langs.contains(&tag.trim()) {
            continue;
        }
        let mut body = String::new();
        for inner in lines.by_ref() {
            if inner.trim().starts_with("```") {
                return Some(body);
            }
            body.push_str(inner);
            body.push('\n');
        }
        // Unterminated fence: take what we have.
        return Some(body);
    }
    None
}

/// Repair trivially malformed JSON: strip trailing commas and quote bare
/// object keys. String contents are left untouched.
fn repair(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let chars: Vec<char> = input.chars().collect();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            ',' => {
                // Trailing comma: next non-whitespace is a closer.
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    i += 1; // drop the comma
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            c if c == '{' || c == ',' || c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                // Possible bare key: identifier followed by ':' while the
                // previous structural char was '{' or ','.
                let prev_structural = out
                    .chars()
                    .rev()
                    .find(|p| !p.is_whitespace())
                    .unwrap_or('{');
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let mut k = j;
                while k < chars.len() && chars[k].is_whitespace() {
                    k += 1;
                }
                let ident: String = chars[i..j].iter().collect();
                let is_key = k < chars.len() && chars[k] == ':';
                let is_literal = matches!(ident.as_str(), "true" | "false" | "null");
                if is_key && (prev_structural == '{' || prev_structural == ',') && !is_literal {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
                i = j;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

// --- Patch extraction ---

/// Extract a unified-diff block from raw agent output.
///
/// Prefers a fenced ```diff / ```patch block; falls back to a contiguous
/// region starting at the first `diff --git` or `--- ` header line.
pub fn extract_patch(raw: &str) -> Option<String> {
    if let Some(block) = fenced_block(raw, &["diff", "patch"]) {
        // Trim only blank lines: a trailing context line may legitimately be
        // a single space.
        let trimmed = block.trim_matches('\n');
        if !trimmed.trim().is_empty() {
            let mut body = trimmed.to_string();
            body.push('\n');
            return Some(body);
        }
    }

    let mut lines = raw.lines().peekable();
    let mut patch = String::new();
    let mut started = false;
    while let Some(line) = lines.next() {
        if !started {
            let is_header = line.starts_with("diff --git")
                || (line.starts_with("--- ")
                    && lines.peek().is_some_and(|n| n.starts_with("+++ ")));
            if is_header {
                started = true;
                patch.push_str(line);
                patch.push('\n');
            }
            continue;
        }
        // Inside the patch body: stop at an obvious non-diff line.
        let diff_line = line.is_empty()
            || line.starts_with('+')
            || line.starts_with('-')
            || line.starts_with(' ')
            || line.starts_with("@@")
            || line.starts_with("diff --git")
            || line.starts_with("index ")
            || line.starts_with("new file")
            || line.starts_with("deleted file")
            || line.starts_with("similarity index")
            || line.starts_with("rename ")
            || line.starts_with("Binary files");
        if diff_line {
            patch.push_str(line);
            patch.push('\n');
        } else {
            break;
        }
    }

    if started {
        Some(patch)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "hypothesis": "off-by-one in the ring buffer",
        "experiments": [{"ran": "cargo test ring"}],
        "proposed_changes": [{"file": "src/ring.rs"}],
        "confidence": 0.7,
        "status_signal": "CONTINUE",
        "observations": ["wrap index is never reset"]
    }"#;

    #[test]
    fn validates_well_formed_envelope() {
        let env = validate_iteration(VALID).unwrap();
        assert_eq!(env.hypothesis, "off-by-one in the ring buffer");
        assert_eq!(env.status_signal, StatusSignal::Continue);
        assert!((env.confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(env.observations.len(), 1);
        assert!(!env.patch_present);
    }

    #[test]
    fn validated_document_is_not_mutated() {
        let value: Value = serde_json::from_str(VALID).unwrap();
        let env = validate_value(&value).unwrap();
        let reparsed: Value = serde_json::from_str(VALID).unwrap();
        assert_eq!(value, reparsed);
        assert_eq!(env.experiments[0]["ran"], "cargo test ring");
    }

    #[test]
    fn patch_present_defaults_false_and_accepts_true() {
        let env = validate_iteration(VALID).unwrap();
        assert!(!env.patch_present);

        let with_patch = VALID.replace(
            "\"observations\": [\"wrap index is never reset\"]",
            "\"observations\": [], \"patch_present\": true",
        );
        let env = validate_iteration(&with_patch).unwrap();
        assert!(env.patch_present);
    }

    #[test]
    fn rejects_empty_hypothesis() {
        let bad = VALID.replace("off-by-one in the ring buffer", "  ");
        assert!(matches!(
            validate_iteration(&bad),
            Err(ValidationError::EmptyHypothesis)
        ));
    }

    #[test]
    fn rejects_missing_required_field() {
        let bad = r#"{"hypothesis": "h", "confidence": 0.5,
            "status_signal": "DONE", "observations": []}"#;
        assert!(matches!(
            validate_iteration(bad),
            Err(ValidationError::MissingField("experiments"))
        ));
    }

    #[test]
    fn rejects_confidence_out_of_range() {
        let bad = VALID.replace("0.7", "1.5");
        assert!(matches!(
            validate_iteration(&bad),
            Err(ValidationError::ConfidenceOutOfRange(_))
        ));
    }

    #[test]
    fn rejects_unknown_status_signal() {
        let bad = VALID.replace("CONTINUE", "MAYBE");
        assert!(matches!(
            validate_iteration(&bad),
            Err(ValidationError::UnknownStatusSignal(_))
        ));
    }

    #[test]
    fn rejects_non_string_observations() {
        let bad = VALID.replace("[\"wrap index is never reset\"]", "[42]");
        assert!(matches!(
            validate_iteration(&bad),
            Err(ValidationError::WrongType("observations"))
        ));
    }

    #[test]
    fn salvages_envelope_embedded_in_prose() {
        let raw = format!("Here is my analysis:\n\n{VALID}\n\nLet me know.");
        let env = validate_iteration(&raw).unwrap();
        assert_eq!(env.status_signal, StatusSignal::Continue);
    }

    #[test]
    fn salvages_fenced_json_block() {
        let raw = format!("Thinking...\n```json\n{VALID}\n```\ndone");
        let env = validate_iteration(&raw).unwrap();
        assert_eq!(env.hypothesis, "off-by-one in the ring buffer");
    }

    #[test]
    fn salvages_trailing_commas() {
        let raw = r#"{
            "hypothesis": "h",
            "experiments": [],
            "proposed_changes": [],
            "confidence": 0.2,
            "status_signal": "DONE",
            "observations": ["a",],
        }"#;
        let env = validate_iteration(raw).unwrap();
        assert_eq!(env.observations, vec!["a"]);
    }

    #[test]
    fn salvages_unquoted_keys() {
        let raw = r#"{hypothesis: "h", experiments: [], proposed_changes: [],
            confidence: 0.1, status_signal: "BLOCKED", observations: []}"#;
        let env = validate_iteration(raw).unwrap();
        assert_eq!(env.status_signal, StatusSignal::Blocked);
    }

    #[test]
    fn salvage_keeps_braces_inside_strings_intact() {
        let raw = r#"noise {"hypothesis": "uses {braces} inside", "experiments": [],
            "proposed_changes": [], "confidence": 0.3,
            "status_signal": "CONTINUE", "observations": []} noise"#;
        let env = validate_iteration(raw).unwrap();
        assert_eq!(env.hypothesis, "uses {braces} inside");
    }

    #[test]
    fn no_json_at_all_is_an_error() {
        assert!(matches!(
            validate_iteration("I could not produce anything."),
            Err(ValidationError::NoJsonFound)
        ));
    }

    #[test]
    fn picks_largest_top_level_object() {
        let raw = format!("{{\"small\": 1}} and then {VALID}");
        let env = validate_iteration(&raw).unwrap();
        assert_eq!(env.hypothesis, "off-by-one in the ring buffer");
    }

    #[test]
    fn status_signal_round_trips() {
        for signal in [
            StatusSignal::Continue,
            StatusSignal::SkipToVerify,
            StatusSignal::NeedsMoreWork,
            StatusSignal::Done,
            StatusSignal::Blocked,
        ] {
            let json = serde_json::to_string(&signal).unwrap();
            assert_eq!(json, format!("\"{}\"", signal.as_str()));
            let back: StatusSignal = serde_json::from_str(&json).unwrap();
            assert_eq!(back, signal);
        }
    }

    // --- Patch extraction ---

    #[test]
    fn extracts_fenced_diff_block() {
        let raw = "Change:\n```diff\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-old\n+new\n```\n";
        let patch = extract_patch(raw).unwrap();
        assert!(patch.starts_with("--- a/src/lib.rs"));
        assert!(patch.ends_with("+new\n"));
    }

    #[test]
    fn extracts_bare_diff_git_block() {
        let raw = "prose\ndiff --git a/f b/f\nindex 000..111 100644\n--- a/f\n+++ b/f\n@@ -1 +1 @@\n-x\n+y\nAnd that's it, summary follows.";
        let patch = extract_patch(raw).unwrap();
        assert!(patch.starts_with("diff --git a/f b/f"));
        assert!(patch.contains("+y\n"));
        assert!(!patch.contains("summary follows"));
    }

    #[test]
    fn no_patch_returns_none() {
        assert!(extract_patch("nothing that looks like a diff").is_none());
        assert!(extract_patch("```diff\n```\n").is_none());
    }

    #[test]
    fn minimal_envelope_validates() {
        let env = IterationEnvelope::minimal("stub", StatusSignal::NeedsMoreWork);
        let json = serde_json::to_string(&env).unwrap();
        let back = validate_iteration(&json).unwrap();
        assert_eq!(back.status_signal, StatusSignal::NeedsMoreWork);
    }
}
