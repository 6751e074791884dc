//! Completion actions run after the last phase succeeds.
//!
//! Failures here are warnings, never task failures: the work itself
//! already landed on the task branch. The PR tool is an external
//! collaborator behind [`PrCreator`]; the default implementation shells
//! out to the `gh` CLI.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::info;

use crate::config::{CompletionAction, CompletionSection};
use crate::task::Task;
use crate::vcs::Vcs;

/// Template for PR titles.
const PR_TITLE_TEMPLATE: &str = "[orc] {{TASK_TITLE}}";

/// External pull-request tool.
#[async_trait]
pub trait PrCreator: Send + Sync {
    /// Create a PR for `branch`; returns its URL.
    async fn create_pr(&self, branch: &str, title: &str, body: &str) -> Result<String>;
    async fn enable_auto_merge(&self, url: &str) -> Result<()>;
}

/// `gh`-CLI-backed PR tool.
pub struct GhCli {
    work_dir: PathBuf,
}

impl GhCli {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl PrCreator for GhCli {
    async fn create_pr(&self, branch: &str, title: &str, body: &str) -> Result<String> {
        let output = tokio::process::Command::new("gh")
            .args(["pr", "create", "--head", branch, "--title", title, "--body", body])
            .current_dir(&self.work_dir)
            .output()
            .await
            .context("Failed to run gh pr create")?;

        if !output.status.success() {
            bail!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn enable_auto_merge(&self, url: &str) -> Result<()> {
        let output = tokio::process::Command::new("gh")
            .args(["pr", "merge", "--auto", "--squash", url])
            .current_dir(&self.work_dir)
            .output()
            .await
            .context("Failed to run gh pr merge")?;

        if !output.status.success() {
            bail!(
                "gh pr merge --auto failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Render the templated PR title for a task.
pub fn pr_title(task: &Task) -> String {
    PR_TITLE_TEMPLATE.replace("{{TASK_TITLE}}", &task.title)
}

/// Generate the PR body from task data.
pub fn pr_body(task: &Task) -> String {
    format!(
        "## {}\n\n{}\n\n---\nTask `{}` completed by the orc pipeline.\n",
        task.title, task.description, task.id
    )
}

/// Run the configured completion action.
///
/// Returns the PR URL when one was created, so the driver can record it
/// in the task metadata.
pub async fn run_completion(
    section: &CompletionSection,
    task: &Task,
    target_branch: &str,
    vcs: &dyn Vcs,
    pr_tool: Option<&dyn PrCreator>,
) -> Result<Option<String>> {
    match section.action {
        CompletionAction::None => Ok(None),
        CompletionAction::Merge => {
            let branch = vcs.branch_name(&task.id);
            vcs.fetch().ok(); // offline merge is still a merge
            vcs.rebase(&branch, target_branch)?;
            vcs.checkout(target_branch)?;
            vcs.merge(&branch, true)?;
            vcs.push(target_branch)?;
            if section.delete_branch {
                vcs.delete_branch(&branch)?;
            }
            info!(task = %task.id, branch, "merged task branch into {}", target_branch);
            Ok(None)
        }
        CompletionAction::Pr => {
            let Some(pr_tool) = pr_tool else {
                bail!("completion action is 'pr' but no PR tool is configured");
            };
            let branch = vcs.branch_name(&task.id);
            vcs.push(&branch)?;
            let url = pr_tool
                .create_pr(&branch, &pr_title(task), &pr_body(task))
                .await?;
            if section.auto_merge {
                pr_tool.enable_auto_merge(&url).await?;
            }
            info!(task = %task.id, url, "opened pull request");
            Ok(Some(url))
        }
    }
}
