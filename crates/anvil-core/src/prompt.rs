//! Prompt assembly for agent iterations.
//!
//! Prompts are deterministic functions of their inputs: the same context
//! yields the same prompt bytes, which keeps resumed runs auditable.

use crate::types::Role;

/// Inputs for one iteration's prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs<'a> {
    pub track: &'a str,
    pub role: Option<Role>,
    pub iteration: u32,
    pub max_iters: u32,
    pub issue: Option<&'a str>,
    pub context_summary: Option<&'a str>,
    pub repro_plan: Option<&'a str>,
    pub blackboard: Option<&'a str>,
    pub directives: Option<&'a str>,
}

/// The envelope contract embedded in every prompt.
const ENVELOPE_INSTRUCTIONS: &str = r#"At the end of your reply, emit exactly one fenced ```json block containing:
{
  "hypothesis": "<non-empty: what you currently believe>",
  "experiments": [<records of what you tried>],
  "proposed_changes": [<records of what you want to change>],
  "confidence": <0.0..1.0>,
  "status_signal": "CONTINUE" | "SKIP_TO_VERIFY" | "NEEDS_MORE_WORK" | "DONE" | "BLOCKED",
  "observations": ["<short facts worth sharing with other tracks>"],
  "patch_present": <true if you are including a patch>
}
If you have a code change, also emit one fenced ```diff block with a unified diff."#;

/// Assemble the full prompt for one iteration.
pub fn build(inputs: &PromptInputs<'_>) -> String {
    let mut out = String::with_capacity(2048);

    out.push_str(&format!(
        "You are track `{}` (iteration {} of {}).\n\n",
        inputs.track, inputs.iteration, inputs.max_iters
    ));

    match inputs.role {
        Some(Role::Fixer) => out.push_str(
            "Role: FIXER. Your job is to produce a working patch for the issue below. \
             A fixer track that never produces a patch is disqualified.\n\n",
        ),
        Some(Role::Breaker) => out.push_str(
            "Role: BREAKER. Your job is to find latent defects. Disclose each finding \
             in `observations`, and include a patch or failing test when you can.\n\n",
        ),
        Some(Role::Debugger) => out.push_str(
            "Role: DEBUGGER. Narrow the root cause with targeted experiments before \
             proposing changes.\n\n",
        ),
        Some(Role::Experimental) => out.push_str(
            "Role: EXPERIMENTAL. Try an unconventional approach; record what you learn \
             even when it fails.\n\n",
        ),
        None => {}
    }

    if let Some(issue) = inputs.issue {
        out.push_str("## Issue\n\n");
        out.push_str(issue.trim());
        out.push_str("\n\n");
    }

    if let Some(context) = inputs.context_summary {
        out.push_str("## Repository context\n\n");
        out.push_str(context.trim());
        out.push_str("\n\n");
    }

    if let Some(repro) = inputs.repro_plan {
        out.push_str("## Reproduction plan\n\n");
        out.push_str(repro.trim());
        out.push_str("\n\n");
    }

    if let Some(blackboard) = inputs.blackboard {
        if !blackboard.trim().is_empty() {
            out.push_str("## Observations from other tracks\n\n");
            out.push_str(blackboard.trim());
            out.push_str("\n\n");
        }
    }

    if let Some(directives) = inputs.directives {
        out.push_str("## Track directives\n\n");
        out.push_str(directives.trim());
        out.push_str("\n\n");
    }

    out.push_str("## Output contract\n\n");
    out.push_str(ENVELOPE_INSTRUCTIONS);
    out.push('\n');

    out
}
