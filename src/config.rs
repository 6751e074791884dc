//! Orchestrator runtime configuration.
//!
//! Read from `.orc/orc.toml` in the project root; every section has
//! serde defaults so a missing file yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! claude_cmd = "claude"
//! target_branch = "main"
//!
//! [defaults]
//! max_iterations = 10
//! phase_timeout_secs = 1800
//!
//! [worktree]
//! enabled = true
//! cleanup_on_success = true
//! cleanup_on_failure = false
//!
//! [retry]
//! max_retries = 2
//!
//! [retry.from]
//! review = "implement"
//! qa = "implement"
//!
//! [completion]
//! action = "pr"
//! delete_branch = false
//! auto_merge = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the orc metadata directory inside a project.
pub const ORC_DIR: &str = ".orc";

pub fn orc_dir(project_root: &Path) -> PathBuf {
    project_root.join(ORC_DIR)
}

pub fn tasks_dir(project_root: &Path) -> PathBuf {
    orc_dir(project_root).join("tasks")
}

pub fn task_dir(project_root: &Path, task_id: &str) -> PathBuf {
    tasks_dir(project_root).join(task_id)
}

/// Project-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Agent CLI command (default: "claude")
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    /// Branch worktrees are rooted at and merges target
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    /// Directory holding prompt templates (relative to the project root)
    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_templates_dir() -> String {
    ".orc/templates".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            claude_cmd: default_claude_cmd(),
            target_branch: default_target_branch(),
            templates_dir: default_templates_dir(),
        }
    }
}

/// Executor defaults applied when a phase does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Lines buffered before the transcript auto-flushes
    #[serde(default = "default_transcript_max_buffer")]
    pub transcript_max_buffer: usize,
    /// Seconds between periodic transcript flushes
    #[serde(default = "default_transcript_flush_secs")]
    pub transcript_flush_secs: u64,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_phase_timeout_secs() -> u64 {
    1800
}

fn default_transcript_max_buffer() -> usize {
    50
}

fn default_transcript_flush_secs() -> u64 {
    5
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            phase_timeout_secs: default_phase_timeout_secs(),
            transcript_max_buffer: default_transcript_max_buffer(),
            transcript_flush_secs: default_transcript_flush_secs(),
        }
    }
}

/// Worktree isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub cleanup_on_success: bool,
    #[serde(default)]
    pub cleanup_on_failure: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WorktreeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_on_success: true,
            cleanup_on_failure: false,
        }
    }
}

/// Retry back-jump policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// failed phase → phase execution restarts from
    #[serde(default)]
    pub from: HashMap<String, String>,
}

fn default_max_retries() -> u32 {
    2
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            from: HashMap::new(),
        }
    }
}

/// What to do once the last phase completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionAction {
    #[default]
    None,
    Merge,
    Pr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSection {
    #[serde(default)]
    pub action: CompletionAction,
    /// Delete the task branch after a merge
    #[serde(default)]
    pub delete_branch: bool,
    /// Request auto-merge on the created PR
    #[serde(default)]
    pub auto_merge: bool,
}

impl Default for CompletionSection {
    fn default() -> Self {
        Self {
            action: CompletionAction::None,
            delete_branch: false,
            auto_merge: false,
        }
    }
}

/// The complete orc.toml configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrcConfig {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub worktree: WorktreeSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub completion: CompletionSection,
}

impl OrcConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse orc.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load from `<projectRoot>/.orc/orc.toml`, defaults when absent.
    pub fn load_or_default(project_root: &Path) -> Result<Self> {
        let path = orc_dir(project_root).join("orc.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize orc.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn templates_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.project.templates_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempdir().unwrap();
        let config = OrcConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.project.claude_cmd, "claude");
        assert_eq!(config.project.target_branch, "main");
        assert_eq!(config.defaults.max_iterations, 10);
        assert!(config.worktree.enabled);
        assert!(config.worktree.cleanup_on_success);
        assert!(!config.worktree.cleanup_on_failure);
        assert_eq!(config.completion.action, CompletionAction::None);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = OrcConfig::parse(
            r#"
            [project]
            target_branch = "develop"

            [retry]
            max_retries = 3

            [retry.from]
            review = "implement"
            qa = "implement"

            [completion]
            action = "merge"
            delete_branch = true
            "#,
        )
        .unwrap();

        assert_eq!(config.project.target_branch, "develop");
        // Untouched sections keep defaults
        assert_eq!(config.project.claude_cmd, "claude");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.from["review"], "implement");
        assert_eq!(config.completion.action, CompletionAction::Merge);
        assert!(config.completion.delete_branch);
    }

    #[test]
    fn test_parse_invalid_toml_is_error() {
        let result = OrcConfig::parse("[[project");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orc.toml");

        let mut config = OrcConfig::default();
        config.retry.from.insert("review".into(), "implement".into());
        config.completion.action = CompletionAction::Pr;
        config.save(&path).unwrap();

        let loaded = OrcConfig::load(&path).unwrap();
        assert_eq!(loaded.retry.from["review"], "implement");
        assert_eq!(loaded.completion.action, CompletionAction::Pr);
    }

    #[test]
    fn test_path_helpers() {
        let root = Path::new("/work/project");
        assert_eq!(orc_dir(root), PathBuf::from("/work/project/.orc"));
        assert_eq!(
            task_dir(root, "T-1"),
            PathBuf::from("/work/project/.orc/tasks/T-1")
        );
    }
}
