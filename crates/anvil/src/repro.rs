//! Reproduction planner.
//!
//! Produces `REPRO.md`, the shared reproduction plan debug-mode prompts
//! embed. The plan is derived from the issue text and the verify contract:
//! the contract's commands are the ground truth for "how do we observe this
//! defect".

use crate::layout;
use crate::store::{ArtifactStore, Result};
use anvil_core::VerifyCommand;

/// Write `REPRO.md` and return its content.
pub fn write(
    store: &ArtifactStore,
    issue: Option<&str>,
    contract: &[VerifyCommand],
) -> Result<String> {
    let mut out = String::from("# Reproduction plan\n\n");

    match issue {
        Some(issue) if !issue.trim().is_empty() => {
            out.push_str("## Reported issue\n\n");
            out.push_str(issue.trim());
            out.push_str("\n\n");
        }
        _ => out.push_str("No issue text was supplied; reproduce from verification alone.\n\n"),
    }

    out.push_str("## Steps\n\n");
    if contract.is_empty() {
        out.push_str(
            "1. Inspect the repository for the behavior described above.\n\
             2. Construct a minimal failing input or test.\n\
             3. Record the exact command and output as an experiment.\n",
        );
    } else {
        out.push_str("Run the declared verification commands and observe failures:\n\n");
        for (i, command) in contract.iter().enumerate() {
            let tag = if command.required { "" } else { " (optional)" };
            out.push_str(&format!("{}. `{}`{tag} ({})\n", i + 1, command.cmd, command.name));
        }
    }

    store.write_str(layout::REPRO_MD, &out)?;
    Ok(out)
}
