//! Durable learning capture.
//!
//! After a task completes, the transcript of its final documentation phase
//! is scanned for decisions, patterns and gotchas worth keeping, and the
//! accepted entries are appended to the knowledge block of the project's
//! `CLAUDE.md` (the region between `<!-- orc:knowledge:begin -->` and
//! `<!-- orc:knowledge:end -->`).
//!
//! A hash gate protects against clobbering concurrent edits: the block is
//! hashed before the first phase and again after the task, and extraction
//! only runs when both hashes are non-empty and equal.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};

pub const KNOWLEDGE_BEGIN: &str = "<!-- orc:knowledge:begin -->";
pub const KNOWLEDGE_END: &str = "<!-- orc:knowledge:end -->";

/// Shortest line accepted as a capture candidate.
const MIN_CANDIDATE_LEN: usize = 40;

static DECISION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(I decided to|I chose|We decided)\b").unwrap());

static PATTERN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bFollowing the\b.*\bpattern\b").unwrap());

static GOTCHA_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(doesn't work|Watch out for|gotcha)").unwrap());

/// One captured learning.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeEntry {
    pub name: String,
    pub description: String,
    pub source_task: String,
}

/// Learnings captured from one task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeCapture {
    pub decisions: Vec<KnowledgeEntry>,
    pub patterns: Vec<KnowledgeEntry>,
    pub gotchas: Vec<KnowledgeEntry>,
}

impl KnowledgeCapture {
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty() && self.patterns.is_empty() && self.gotchas.is_empty()
    }
}

/// Extract the knowledge block (between the markers) from CLAUDE.md text.
pub fn knowledge_block(content: &str) -> Option<&str> {
    let begin = content.find(KNOWLEDGE_BEGIN)?;
    let end = content.find(KNOWLEDGE_END)?;
    if end < begin {
        return None;
    }
    Some(&content[begin + KNOWLEDGE_BEGIN.len()..end])
}

/// Hash the knowledge block of the given CLAUDE.md file.
///
/// Returns the empty string when the file or the markers are absent, which
/// disables extraction through the hash gate.
pub fn hash_knowledge_block(claude_md: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(claude_md) else {
        return String::new();
    };
    let Some(block) = knowledge_block(&content) else {
        return String::new();
    };
    let mut hasher = Sha256::new();
    hasher.update(block.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The hash gate: extract only when the block existed before and after the
/// task and was not modified in between.
pub fn hash_gate_passes(before: &str, after: &str) -> bool {
    !before.is_empty() && before == after
}

/// Derive a short entry name from its line.
fn entry_name(line: &str) -> String {
    let trimmed = line.trim().trim_start_matches(['-', '*', ' ']);
    let mut name: String = trimmed.chars().take(60).collect();
    if trimmed.chars().count() > 60 {
        name.push('…');
    }
    name
}

/// Scan a transcript line-by-line for capture candidates.
///
/// A candidate line matches a decision, pattern or gotcha marker and is at
/// least 40 characters long. Shorter matches are noise ("gotcha!" alone
/// teaches nothing).
pub fn extract_knowledge(transcript: &str, source_task: &str) -> KnowledgeCapture {
    let mut capture = KnowledgeCapture::default();

    for line in transcript.lines() {
        let trimmed = line.trim();
        if trimmed.chars().count() < MIN_CANDIDATE_LEN {
            continue;
        }

        let entry = KnowledgeEntry {
            name: entry_name(trimmed),
            description: trimmed.to_string(),
            source_task: source_task.to_string(),
        };

        if DECISION_REGEX.is_match(trimmed) {
            capture.decisions.push(entry);
        } else if PATTERN_REGEX.is_match(trimmed) {
            capture.patterns.push(entry);
        } else if GOTCHA_REGEX.is_match(trimmed) {
            capture.gotchas.push(entry);
        }
    }

    capture
}

/// Append captured entries to the markdown tables inside the knowledge
/// block of `claude_md`, preserving the markers. An empty capture leaves
/// the file bytes untouched.
pub fn append_knowledge(claude_md: &Path, capture: &KnowledgeCapture) -> Result<()> {
    if capture.is_empty() {
        return Ok(());
    }

    let content = std::fs::read_to_string(claude_md)
        .with_context(|| format!("Failed to read {}", claude_md.display()))?;

    let begin = content
        .find(KNOWLEDGE_BEGIN)
        .context("knowledge begin marker not found")?;
    let end = content
        .find(KNOWLEDGE_END)
        .context("knowledge end marker not found")?;
    anyhow::ensure!(begin < end, "knowledge markers out of order");

    let block_start = begin + KNOWLEDGE_BEGIN.len();
    let mut block = content[block_start..end].to_string();

    append_section(&mut block, "Decisions", &capture.decisions);
    append_section(&mut block, "Patterns", &capture.patterns);
    append_section(&mut block, "Gotchas", &capture.gotchas);

    let updated = format!("{}{}{}", &content[..block_start], block, &content[end..]);
    std::fs::write(claude_md, updated)
        .with_context(|| format!("Failed to write {}", claude_md.display()))?;
    Ok(())
}

/// Append rows to one `### <title>` table inside the block, creating the
/// section and its header row when absent.
fn append_section(block: &mut String, title: &str, entries: &[KnowledgeEntry]) {
    if entries.is_empty() {
        return;
    }

    let heading = format!("### {}", title);
    let rows: String = entries
        .iter()
        .map(|e| {
            format!(
                "| {} | {} | {} |\n",
                sanitize_cell(&e.name),
                sanitize_cell(&e.description),
                e.source_task
            )
        })
        .collect();

    if let Some(section_start) = block.find(&heading) {
        // Insert after the last table row of this section
        let after_heading = section_start + heading.len();
        let section_end = block[after_heading..]
            .find("\n### ")
            .map(|i| after_heading + i + 1)
            .unwrap_or(block.len());
        match block[after_heading..section_end].rfind("|\n") {
            Some(i) => block.insert_str(after_heading + i + 2, &rows),
            // Heading without a table yet: add the header row too
            None => block.insert_str(
                section_end,
                &format!("\n| Name | Description | Source |\n|---|---|---|\n{}", rows),
            ),
        }
    } else {
        if !block.ends_with('\n') {
            block.push('\n');
        }
        block.push_str(&format!(
            "\n{}\n\n| Name | Description | Source |\n|---|---|---|\n{}",
            heading, rows
        ));
    }
}

/// Pipes would break the table layout.
fn sanitize_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn claude_md_with_block(extra: &str) -> String {
        format!(
            "# Project\n\nSome intro.\n\n{}\n{}{}\n\nTrailing text.\n",
            KNOWLEDGE_BEGIN, extra, KNOWLEDGE_END
        )
    }

    // =========================================
    // Hash gate
    // =========================================

    #[test]
    fn test_hash_gate_requires_equal_nonempty() {
        assert!(hash_gate_passes("abc", "abc"));
        assert!(!hash_gate_passes("", ""));
        assert!(!hash_gate_passes("abc", "def"));
        assert!(!hash_gate_passes("", "abc"));
    }

    #[test]
    fn test_hash_changes_with_block_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CLAUDE.md");

        fs::write(&path, claude_md_with_block("v1\n")).unwrap();
        let h1 = hash_knowledge_block(&path);
        fs::write(&path, claude_md_with_block("v2\n")).unwrap();
        let h2 = hash_knowledge_block(&path);

        assert!(!h1.is_empty());
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_hash_ignores_text_outside_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CLAUDE.md");

        fs::write(&path, claude_md_with_block("stable\n")).unwrap();
        let h1 = hash_knowledge_block(&path);
        let edited = claude_md_with_block("stable\n").replace("Some intro.", "New intro.");
        fs::write(&path, edited).unwrap();
        let h2 = hash_knowledge_block(&path);

        assert_eq!(h1, h2);
    }

    #[test]
    fn test_hash_empty_without_markers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CLAUDE.md");
        fs::write(&path, "# No markers here\n").unwrap();
        assert_eq!(hash_knowledge_block(&path), "");
        assert_eq!(hash_knowledge_block(&dir.path().join("missing.md")), "");
    }

    // =========================================
    // Detection
    // =========================================

    #[test]
    fn test_extract_detects_all_three_kinds() {
        let transcript = "\
I decided to use a BTreeMap for deterministic serialization of state.
Following the repository pattern for all storage access in this module.
Watch out for the worktree prune API, it silently keeps locked trees.
Unrelated line that matches nothing at all in the scanners.
";
        let capture = extract_knowledge(transcript, "T-001");
        assert_eq!(capture.decisions.len(), 1);
        assert_eq!(capture.patterns.len(), 1);
        assert_eq!(capture.gotchas.len(), 1);
        assert_eq!(capture.decisions[0].source_task, "T-001");
        assert!(capture.decisions[0].description.contains("BTreeMap"));
    }

    #[test]
    fn test_extract_rejects_short_candidates() {
        let capture = extract_knowledge("I chose tokio.\ngotcha!\n", "T-001");
        assert!(capture.is_empty());
    }

    #[test]
    fn test_extract_additional_markers() {
        let transcript = "\
We decided that retries should clear the agent session to avoid stale context.
The --force flag doesn't work when the worktree is locked by another process.
";
        let capture = extract_knowledge(transcript, "T-002");
        assert_eq!(capture.decisions.len(), 1);
        assert_eq!(capture.gotchas.len(), 1);
    }

    #[test]
    fn test_entry_name_truncates() {
        let long = "x".repeat(100);
        let name = entry_name(&long);
        assert_eq!(name.chars().count(), 61); // 60 chars + ellipsis
    }

    // =========================================
    // Append
    // =========================================

    fn sample_capture() -> KnowledgeCapture {
        KnowledgeCapture {
            decisions: vec![KnowledgeEntry {
                name: "Use BTreeMap for state".into(),
                description: "I decided to use a BTreeMap for deterministic state".into(),
                source_task: "T-001".into(),
            }],
            patterns: vec![],
            gotchas: vec![],
        }
    }

    #[test]
    fn test_append_empty_capture_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CLAUDE.md");
        let original = claude_md_with_block("existing content\n");
        fs::write(&path, &original).unwrap();

        append_knowledge(&path, &KnowledgeCapture::default()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_append_creates_section_and_preserves_markers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CLAUDE.md");
        fs::write(&path, claude_md_with_block("")).unwrap();

        append_knowledge(&path, &sample_capture()).unwrap();

        let updated = fs::read_to_string(&path).unwrap();
        assert!(updated.contains(KNOWLEDGE_BEGIN));
        assert!(updated.contains(KNOWLEDGE_END));
        assert!(updated.contains("### Decisions"));
        assert!(updated.contains("| Name | Description | Source |"));
        assert!(updated.contains("| Use BTreeMap for state |"));
        assert!(updated.contains("| T-001 |"));
        // Text outside the block is untouched
        assert!(updated.contains("Some intro."));
        assert!(updated.contains("Trailing text."));
    }

    #[test]
    fn test_append_extends_existing_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CLAUDE.md");
        let block = "\n### Decisions\n\n| Name | Description | Source |\n|---|---|---|\n| Old | old entry | T-000 |\n";
        fs::write(&path, claude_md_with_block(block)).unwrap();

        append_knowledge(&path, &sample_capture()).unwrap();

        let updated = fs::read_to_string(&path).unwrap();
        // Both the old and the new row are present, one Decisions section
        assert_eq!(updated.matches("### Decisions").count(), 1);
        assert!(updated.contains("| Old | old entry | T-000 |"));
        assert!(updated.contains("| Use BTreeMap for state |"));
        // New row lands after the old one
        let old = updated.find("| Old |").unwrap();
        let new = updated.find("| Use BTreeMap for state |").unwrap();
        assert!(new > old);
    }

    #[test]
    fn test_append_without_markers_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CLAUDE.md");
        fs::write(&path, "# No block\n").unwrap();

        let result = append_knowledge(&path, &sample_capture());
        assert!(result.is_err());
    }

    #[test]
    fn test_append_escapes_pipes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CLAUDE.md");
        fs::write(&path, claude_md_with_block("")).unwrap();

        let capture = KnowledgeCapture {
            gotchas: vec![KnowledgeEntry {
                name: "a | b".into(),
                description: "pipe | inside".into(),
                source_task: "T-001".into(),
            }],
            ..Default::default()
        };
        append_knowledge(&path, &capture).unwrap();

        let updated = fs::read_to_string(&path).unwrap();
        assert!(updated.contains("a \\| b"));
    }
}
