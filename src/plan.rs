//! Plan and phase definitions plus JSON loading.
//!
//! A [`Plan`] is the ordered sequence of phases the driver executes for one
//! task. The plan is read-only to the driver except for per-phase status and
//! the recorded checkpoint commit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::resolver::PhaseClaudeConfig;

/// Status of a single phase within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Gate evaluation strategy attached to a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    /// Approve without evaluation when the phase completed successfully
    #[default]
    Auto,
    /// Ask the agent to judge the phase output against the criteria
    Llm,
    /// Every criterion string must appear in the phase output
    Rule,
    /// Interactive operator decision
    Human,
}

/// A pass/fail check attached to a phase, evaluated against its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default, rename = "type")]
    pub kind: GateKind,
    /// Criteria the phase output is judged against (meaning depends on kind)
    #[serde(default)]
    pub criteria: Vec<String>,
    /// For `auto` gates: approve immediately on successful completion
    #[serde(default = "default_auto_approve")]
    pub auto_approve_on_success: bool,
}

fn default_auto_approve() -> bool {
    true
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            kind: GateKind::default(),
            criteria: Vec::new(),
            auto_approve_on_success: default_auto_approve(),
        }
    }
}

/// A named stage of the plan, executed as one iteration loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Stable identifier (e.g. "implement"), used for template lookup and
    /// completion-tag matching
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Inline prompt used when no template file exists for this phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Per-phase agent configuration overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PhaseClaudeConfig>,
    /// Iteration cap override (wins over the executor default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<Gate>,
    #[serde(default)]
    pub status: PhaseStatus,
    /// Checkpoint commit recorded when the phase completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl Phase {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            prompt: None,
            config: None,
            max_iterations: None,
            gate: None,
            status: PhaseStatus::Pending,
            commit: None,
        }
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Some(prompt.to_string());
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }
}

/// The ordered phase sequence for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: String,
    pub phases: Vec<Phase>,
}

impl Plan {
    pub fn new(task_id: &str, phases: Vec<Phase>) -> Self {
        Self {
            task_id: task_id.to_string(),
            phases,
        }
    }

    /// Load a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        let plan: Plan = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))?;
        Ok(plan)
    }

    /// Save the plan to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize plan")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
        Ok(())
    }

    pub fn get_phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    /// Index of the first phase not yet completed, if any.
    pub fn first_incomplete(&self) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.status != PhaseStatus::Completed)
    }
}

/// The default five-phase pipeline for standard-weight tasks.
pub fn default_phases() -> Vec<Phase> {
    vec![
        Phase::new("research", "Research the codebase"),
        Phase::new("spec", "Write the specification"),
        Phase::new("implement", "Implement the specification"),
        Phase::new("review", "Review the implementation").with_gate(Gate {
            kind: GateKind::Auto,
            criteria: Vec::new(),
            auto_approve_on_success: true,
        }),
        Phase::new("finalize", "Finalize and document"),
    ]
}
