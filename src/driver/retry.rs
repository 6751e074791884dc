//! Retry back-jump policy and the retry-context file.
//!
//! A back-jump is a bounded state-machine transition: when a phase fails
//! (or its gate rejects), the policy maps the failed phase to an earlier
//! phase to restart from, capped at `max_retries` attempts per failed
//! phase. The context of each jump is persisted as a markdown file so the
//! retried phases can read why they are running again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::RetrySection;
use crate::state::RetryContext;

/// Maps failed phases to the phase execution restarts from.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    max_retries: u32,
    routes: HashMap<String, String>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, routes: HashMap<String, String>) -> Self {
        Self {
            max_retries,
            routes,
        }
    }

    pub fn from_config(section: &RetrySection) -> Self {
        Self::new(section.max_retries, section.from.clone())
    }

    /// The phase to restart from when `failed_phase` fails, if configured.
    pub fn should_retry_from(&self, failed_phase: &str) -> Option<&str> {
        self.routes.get(failed_phase).map(|s| s.as_str())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Tail length of failure output kept in the retry-context file.
const OUTPUT_TAIL: usize = 2000;

/// Write `retry-context-<phase>-<attempt>.md` into the task directory.
pub fn write_retry_context_file(task_dir: &Path, ctx: &RetryContext) -> Result<PathBuf> {
    std::fs::create_dir_all(task_dir)
        .with_context(|| format!("Failed to create task directory: {}", task_dir.display()))?;

    let path = task_dir.join(format!(
        "retry-context-{}-{}.md",
        ctx.from_phase, ctx.attempt
    ));

    let tail: String = ctx
        .failure_output
        .chars()
        .rev()
        .take(OUTPUT_TAIL)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    let content = format!(
        "# Retry Context\n\n\
         - **From**: {}\n\
         - **To**: {}\n\
         - **Attempt**: {}\n\
         - **Timestamp**: {}\n\n\
         ## Reason\n\n{}\n\n\
         ## Output\n\n```\n{}\n```\n",
        ctx.from_phase,
        ctx.to_phase,
        ctx.attempt,
        ctx.created_at.to_rfc3339(),
        ctx.reason,
        tail,
    );

    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write retry context: {}", path.display()))?;
    Ok(path)
}
