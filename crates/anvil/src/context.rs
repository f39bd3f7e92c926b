//! Repository context scanner.
//!
//! A pure read-only pass over the target working tree producing the shared
//! context artifacts (`CONTEXT.md`, `FILES.json`) every track's prompt
//! embeds. The scan is bounded so pathological repositories cannot stall
//! session startup.

use crate::layout;
use crate::store::{ArtifactStore, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Cap on files recorded in `FILES.json`.
const MAX_FILES: usize = 2000;

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[
    ".git", ".dbg", "target", "node_modules", ".venv", "__pycache__", "dist", "build",
];

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct ContextSummary {
    pub file_count: usize,
    pub truncated: bool,
    pub by_extension: BTreeMap<String, usize>,
    pub files: Vec<FileEntry>,
}

/// Scan the repository and persist the context artifacts. Returns the short
/// summary text embedded in prompts.
pub fn build(repo: &Path, store: &ArtifactStore) -> Result<String> {
    let mut files: Vec<FileEntry> = Vec::new();
    let mut truncated = false;
    walk(repo, repo, &mut files, &mut truncated);
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let mut by_extension: BTreeMap<String, usize> = BTreeMap::new();
    for entry in &files {
        let ext = Path::new(&entry.path)
            .extension()
            .map_or_else(|| "(none)".to_string(), |e| e.to_string_lossy().to_string());
        *by_extension.entry(ext).or_insert(0) += 1;
    }

    let summary = ContextSummary {
        file_count: files.len(),
        truncated,
        by_extension,
        files,
    };
    store.write_json(layout::FILES_JSON, &summary)?;

    let markdown = render_markdown(repo, &summary);
    store.write_str(layout::CONTEXT_MD, &markdown)?;
    Ok(markdown)
}

fn walk(root: &Path, dir: &Path, files: &mut Vec<FileEntry>, truncated: &mut bool) {
    if *truncated {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.filter_map(std::result::Result::ok).collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if !SKIP_DIRS.contains(&name.as_str()) {
                walk(root, &path, files, truncated);
            }
        } else if file_type.is_file() {
            if files.len() >= MAX_FILES {
                *truncated = true;
                return;
            }
            let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            files.push(FileEntry { path: rel, bytes });
        }
    }
}

fn render_markdown(repo: &Path, summary: &ContextSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# Repository context\n\nRoot: `{}`\nFiles scanned: {}{}\n\n## Files by extension\n\n",
        repo.display(),
        summary.file_count,
        if summary.truncated { " (truncated)" } else { "" },
    ));
    for (ext, count) in &summary.by_extension {
        out.push_str(&format!("- `{ext}`: {count}\n"));
    }

    // First lines of a README, when present, anchor the prompt.
    for candidate in ["README.md", "README.rst", "README.txt", "README"] {
        let Ok(content) = std::fs::read_to_string(repo.join(candidate)) else {
            continue;
        };
        out.push_str(&format!("\n## {candidate} (head)\n\n"));
        for line in content.lines().take(20) {
            out.push_str(line);
            out.push('\n');
        }
        break;
    }
    out
}
