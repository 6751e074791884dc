//! Structured artifact extraction from agent output.
//!
//! The agent is instructed to finish each phase with a JSON object. This
//! module locates the last balanced JSON object in the free-form output,
//! parses it and reads the fields the phase's schema expects:
//!
//! | Phase | Shape |
//! |---|---|
//! | `spec`, `tiny_spec`, `research`, `tdd_write`, `breakdown`, `docs` | `{"content": "..."}` |
//! | `review` (round 1) | `{"issues": [...]}` |
//! | `review` (round 2) | `{"gaps_addressed": [...]}` |
//! | `qa` | `{"tests_written": [...], ...}` |
//! | anything else | status object, no `content` |
//!
//! Failures return a [`SpecExtractionError`] with enough diagnostics to
//! debug the agent's output without re-running the phase.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Phases whose terminal JSON carries a `content` string.
pub const CONTENT_PHASES: &[&str] = &[
    "spec",
    "tiny_spec",
    "research",
    "tdd_write",
    "breakdown",
    "docs",
];

/// Phases whose content gets spec-class validation.
const SPEC_CLASS_PHASES: &[&str] = &["spec", "tiny_spec"];

/// Section headings that mark well-formed spec-class content.
const RECOGNIZED_SECTIONS: &[&str] = &[
    "## Intent",
    "## Success Criteria",
    "## Testing",
    "## Problem Statement",
    "## Overview",
    "## Requirements",
    "## Scope",
];

/// Noise the agent sometimes emits instead of real content.
const NOISE_MARKER: &str = "{\"status\": \"complete\"";

/// Characters kept in the output preview.
const PREVIEW_LEN: usize = 120;

/// Extraction failure with diagnostics.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("extraction failed: {reason} (output {output_len} chars, preview: {output_preview})")]
pub struct SpecExtractionError {
    pub reason: String,
    pub output_len: usize,
    /// First characters of the output with newlines escaped
    pub output_preview: String,
    /// Set when parsing succeeded but validation rejected the content
    pub validation_failure: Option<String>,
}

impl SpecExtractionError {
    fn new(reason: &str, output: &str) -> Self {
        Self {
            reason: reason.to_string(),
            output_len: output.len(),
            output_preview: preview(output),
            validation_failure: None,
        }
    }

    fn with_validation(reason: &str, output: &str, validation: &str) -> Self {
        Self {
            validation_failure: Some(validation.to_string()),
            ..Self::new(reason, output)
        }
    }
}

/// First `PREVIEW_LEN` characters with embedded newlines escaped.
fn preview(output: &str) -> String {
    output
        .chars()
        .take(PREVIEW_LEN)
        .collect::<String>()
        .replace('\n', "\\n")
}

/// Result of qa-phase extraction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QaResult {
    #[serde(default)]
    pub tests_written: Vec<String>,
    /// Remaining fields the qa schema may carry (pass/fail counts, notes)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Typed artifact produced by a completed phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseArtifact {
    /// Validated content from a content-producing phase
    Content { phase: String, content: String },
    /// Review round 1: issues found
    ReviewIssues(Vec<Value>),
    /// Review round 2: gaps addressed
    GapsAddressed(Vec<Value>),
    Qa(QaResult),
    /// Status object from a phase with no content schema
    Status(Value),
}

impl PhaseArtifact {
    /// Content string, for artifacts that carry one.
    pub fn content(&self) -> Option<&str> {
        match self {
            PhaseArtifact::Content { content, .. } => Some(content),
            _ => None,
        }
    }
}

/// Locate the last balanced top-level JSON object in `output`.
///
/// Scans forward tracking string/escape state and brace depth; every span
/// that opens at depth 0 and closes back to depth 0 is a candidate, and
/// the last candidate wins. Braces inside JSON strings do not count.
pub fn find_last_json_object(output: &str) -> Option<&str> {
    let bytes = output.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = None;
    let mut last_span = None;

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
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0
                        && let Some(s) = start
                    {
                        last_span = Some((s, i));
                    }
                }
            }
            _ => {}
        }
    }

    last_span.map(|(s, e)| &output[s..=e])
}

/// Extract and validate the artifact for a phase from its terminal output.
///
/// `review_round` distinguishes the two review schemas; it is ignored for
/// every other phase.
pub fn extract_artifact(
    phase_id: &str,
    review_round: u32,
    output: &str,
) -> Result<PhaseArtifact, SpecExtractionError> {
    let json_str = find_last_json_object(output)
        .ok_or_else(|| SpecExtractionError::new("no JSON object found in output", output))?;

    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| SpecExtractionError::new(&format!("invalid JSON object: {}", e), output))?;

    if CONTENT_PHASES.contains(&phase_id) {
        let content = value
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SpecExtractionError::new("no content field in JSON output", output))?;

        if SPEC_CLASS_PHASES.contains(&phase_id)
            && let Err(reason) = validate_spec_content(content)
        {
            return Err(SpecExtractionError::with_validation(
                "content failed validation",
                output,
                &reason,
            ));
        }

        return Ok(PhaseArtifact::Content {
            phase: phase_id.to_string(),
            content: content.to_string(),
        });
    }

    match phase_id {
        "review" if review_round <= 1 => {
            let issues = value
                .get("issues")
                .and_then(|v| v.as_array())
                .cloned()
                .ok_or_else(|| {
                    SpecExtractionError::new("no issues field in review output", output)
                })?;
            Ok(PhaseArtifact::ReviewIssues(issues))
        }
        "review" => {
            let gaps = value
                .get("gaps_addressed")
                .and_then(|v| v.as_array())
                .cloned()
                .ok_or_else(|| {
                    SpecExtractionError::new("no gaps_addressed field in review output", output)
                })?;
            Ok(PhaseArtifact::GapsAddressed(gaps))
        }
        "qa" => {
            let qa: QaResult = serde_json::from_value(value).map_err(|e| {
                SpecExtractionError::new(&format!("malformed qa output: {}", e), output)
            })?;
            Ok(PhaseArtifact::Qa(qa))
        }
        _ => Ok(PhaseArtifact::Status(value)),
    }
}

/// Validate spec-class content. Returns the rejection reason on failure.
///
/// Rules:
/// - shorter than 50 characters is always rejected;
/// - the noise marker `{"status": "complete"` in the first 50 characters
///   is rejected (the agent echoed its status object as content);
/// - 50..200 characters without a recognized section heading is rejected;
/// - 200 characters or more passes regardless of headings.
pub fn validate_spec_content(content: &str) -> Result<(), String> {
    let len = content.chars().count();
    if len < 50 {
        return Err(format!(
            "content too short ({} chars, need at least 50)",
            len
        ));
    }

    let head: String = content.chars().take(50).collect();
    if head.contains(NOISE_MARKER) {
        return Err("content starts with a status object, not real content".to_string());
    }

    let has_section = RECOGNIZED_SECTIONS.iter().any(|s| content.contains(s));
    if !has_section && len < 200 {
        return Err(format!(
            "content has no recognized sections and is only {} chars",
            len
        ));
    }

    Ok(())
}
