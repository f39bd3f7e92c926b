//! Verification contract loading.
//!
//! The contract is an ordered YAML list of `{name, cmd, required}` records.
//! Unknown fields are tolerated and preserved so downstream tooling can
//! attach metadata without breaking the verifier.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("failed to read verify contract: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse verify contract: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("verify command has an empty name")]
    EmptyName,
    #[error("verify command {0:?} has an empty cmd")]
    EmptyCmd(String),
}

pub type Result<T> = std::result::Result<T, ContractError>;

fn default_required() -> bool {
    true
}

/// One declared verification command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyCommand {
    pub name: String,
    pub cmd: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Load a verify contract from disk.
pub fn load_contract(path: &Path) -> Result<Vec<VerifyCommand>> {
    let content = std::fs::read_to_string(path)?;
    parse_contract(&content)
}

/// Parse verify contract content.
pub fn parse_contract(content: &str) -> Result<Vec<VerifyCommand>> {
    let commands: Vec<VerifyCommand> = serde_yaml::from_str(content)?;
    for command in &commands {
        if command.name.trim().is_empty() {
            return Err(ContractError::EmptyName);
        }
        if command.cmd.trim().is_empty() {
            return Err(ContractError::EmptyCmd(command.name.clone()));
        }
    }
    Ok(commands)
}

/// Filesystem-safe form of a command name, for log filenames.
pub fn sanitize_command_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_contract_with_defaults() {
        let yaml = "\
- name: unit
  cmd: cargo test
- name: lint
  cmd: cargo clippy
  required: false
";
        let commands = parse_contract(yaml).unwrap();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].required);
        assert!(!commands[1].required);
    }

    #[test]
    fn preserves_unknown_fields() {
        let yaml = "- {name: unit, cmd: cargo test, owner: ci-team, retries: 2}\n";
        let commands = parse_contract(yaml).unwrap();
        assert_eq!(commands[0].extra["owner"], "ci-team");
        assert_eq!(commands[0].extra["retries"], 2);

        // And they survive a serialize round-trip.
        let json = serde_json::to_string(&commands[0]).unwrap();
        assert!(json.contains("ci-team"));
    }

    #[test]
    fn rejects_empty_name_or_cmd() {
        assert!(matches!(
            parse_contract("- {name: \"\", cmd: x}"),
            Err(ContractError::EmptyName)
        ));
        assert!(matches!(
            parse_contract("- {name: a, cmd: \"  \"}"),
            Err(ContractError::EmptyCmd(_))
        ));
    }

    #[test]
    fn sanitize_command_name_replaces_unsafe_chars() {
        assert_eq!(sanitize_command_name("unit tests"), "unit_tests");
        assert_eq!(sanitize_command_name("a/b:c"), "a_b_c");
        assert_eq!(sanitize_command_name("ok-name_1.x"), "ok-name_1.x");
    }
}
