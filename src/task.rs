//! Task and initiative data model plus the file-backed task store.
//!
//! A [`Task`] is one unit of work driven through the phase pipeline. Tasks
//! may belong to an [`Initiative`], a grouping of related tasks that is
//! auto-completed once every member task completes (unless the initiative
//! carries a branch base, in which case the merge flow owns its lifecycle).
//!
//! The default [`TaskStore`] persists tasks as JSON documents under
//! `.orc/tasks/<id>/task.json` and initiatives under
//! `.orc/initiatives/<id>.json`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Task weight selects the executor flavor and its defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskWeight {
    /// Small mechanical change, tight iteration cap
    Trivial,
    /// Normal feature work (default)
    #[default]
    Standard,
    /// Large multi-phase effort with session continuity
    Full,
}

impl std::fmt::Display for TaskWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskWeight::Trivial => write!(f, "trivial"),
            TaskWeight::Standard => write!(f, "standard"),
            TaskWeight::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for TaskWeight {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trivial" => Ok(TaskWeight::Trivial),
            "standard" => Ok(TaskWeight::Standard),
            "full" => Ok(TaskWeight::Full),
            _ => anyhow::bail!(
                "Invalid task weight '{}'. Valid values: trivial, standard, full",
                s
            ),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Created,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A single unit of work driven through the phase pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier (also names the task branch and worktree)
    pub id: String,
    /// Short human title, used in checkpoint messages and PR titles
    pub title: String,
    /// Full description handed to the agent
    #[serde(default)]
    pub description: String,
    /// Weight, selects the executor flavor
    #[serde(default)]
    pub weight: TaskWeight,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Parent initiative, if this task is part of a grouping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiative_id: Option<String>,
    /// Free-form metadata (e.g. the PR URL recorded by the completion action)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(id: &str, title: &str, description: &str, weight: TaskWeight) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            weight,
            status: TaskStatus::Created,
            created_at: Some(Utc::now()),
            started_at: None,
            completed_at: None,
            initiative_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_interrupted(&mut self) {
        self.status = TaskStatus::Interrupted;
    }
}

/// Lifecycle status of an initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitiativeStatus {
    #[default]
    Active,
    Completed,
}

/// A grouping of related tasks.
///
/// An initiative with a `branch_base` integrates its tasks through the
/// merge flow and is completed explicitly; one without a branch base is
/// auto-completed by the driver when every member task has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initiative {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_base: Option<String>,
    #[serde(default)]
    pub status: InitiativeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Backend for tasks and initiatives.
///
/// The driver consumes this interface; the default implementation is
/// [`FileTaskStore`]. All operations are synchronous filesystem reads and
/// writes and must be cheap enough to call between phases.
pub trait TaskStore: Send + Sync {
    fn get_task(&self, id: &str) -> Result<Option<Task>>;
    fn save_task(&self, task: &Task) -> Result<()>;
    /// All tasks belonging to the given initiative.
    fn tasks_in_initiative(&self, initiative_id: &str) -> Result<Vec<Task>>;
    fn get_initiative(&self, id: &str) -> Result<Option<Initiative>>;
    fn save_initiative(&self, initiative: &Initiative) -> Result<()>;
}

/// File-backed task store rooted at the `.orc` directory.
pub struct FileTaskStore {
    orc_dir: PathBuf,
}

impl FileTaskStore {
    pub fn new(orc_dir: &Path) -> Self {
        Self {
            orc_dir: orc_dir.to_path_buf(),
        }
    }

    pub fn task_dir(&self, id: &str) -> PathBuf {
        self.orc_dir.join("tasks").join(id)
    }

    fn task_file(&self, id: &str) -> PathBuf {
        self.task_dir(id).join("task.json")
    }

    fn initiative_file(&self, id: &str) -> PathBuf {
        self.orc_dir.join("initiatives").join(format!("{}.json", id))
    }
}

impl TaskStore for FileTaskStore {
    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let path = self.task_file(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read task file: {}", path.display()))?;
        let task = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse task file: {}", path.display()))?;
        Ok(Some(task))
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        let path = self.task_file(&task.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create task directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(task).context("Failed to serialize task")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write task file: {}", path.display()))?;
        Ok(())
    }

    fn tasks_in_initiative(&self, initiative_id: &str) -> Result<Vec<Task>> {
        let tasks_dir = self.orc_dir.join("tasks");
        if !tasks_dir.exists() {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        let entries = std::fs::read_dir(&tasks_dir)
            .with_context(|| format!("Failed to read tasks directory: {}", tasks_dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(id) = entry.path().file_name().and_then(|n| n.to_str())
                && let Some(task) = self.get_task(id)?
                && task.initiative_id.as_deref() == Some(initiative_id)
            {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    fn get_initiative(&self, id: &str) -> Result<Option<Initiative>> {
        let path = self.initiative_file(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read initiative file: {}", path.display()))?;
        let initiative = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse initiative file: {}", path.display()))?;
        Ok(Some(initiative))
    }

    fn save_initiative(&self, initiative: &Initiative) -> Result<()> {
        let path = self.initiative_file(&initiative.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create initiatives directory: {}", parent.display())
            })?;
        }
        let content =
            serde_json::to_string_pretty(initiative).context("Failed to serialize initiative")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write initiative file: {}", path.display()))?;
        Ok(())
    }
}
