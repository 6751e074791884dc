//! Per-task execution state and its persistence.
//!
//! [`ExecutionState`] is the driver's canonical record of what has happened
//! to a task: per-phase status and iteration counters, token accounting,
//! gate decisions, content artifacts and the active retry context. It is
//! persisted after every phase transition so a restarted driver resumes
//! from the first non-completed phase.
//!
//! Invariants:
//! - iteration counters only increase within a phase;
//! - resetting a phase clears its status and iteration counter but
//!   preserves its token accounting.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::plan::PhaseStatus;
use crate::task::TaskStatus;

/// Mutable per-phase record inside the execution state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseState {
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// A recorded gate decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub phase: String,
    pub approved: bool,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// Context carried into a retry back-jump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryContext {
    /// Phase that failed and triggered the retry
    pub from_phase: String,
    /// Phase execution restarts from
    pub to_phase: String,
    pub reason: String,
    pub attempt: u32,
    /// Tail of the failing phase's output, carried into the retry prompt
    #[serde(default)]
    pub failure_output: String,
    pub created_at: DateTime<Utc>,
}

/// Per-task mutable execution record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    pub task_id: String,
    /// Phase id → phase record (BTreeMap keeps serialization stable)
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default)]
    pub gate_decisions: Vec<GateRecord>,
    /// Content artifacts captured from completed phases, keyed by phase id
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    /// Active retry context, cleared when the failed phase later succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryContext>,
    /// Back-jump attempts per failed phase
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TaskStatus>,
}

impl ExecutionState {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            ..Default::default()
        }
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseState> {
        self.phases.get(id)
    }

    pub fn phase_mut(&mut self, id: &str) -> &mut PhaseState {
        self.phases.entry(id.to_string()).or_default()
    }

    /// Advance and return the iteration counter for a phase.
    pub fn next_iteration(&mut self, phase_id: &str) -> u32 {
        let phase = self.phase_mut(phase_id);
        phase.iteration += 1;
        phase.iteration
    }

    pub fn set_status(&mut self, phase_id: &str, status: PhaseStatus) {
        self.phase_mut(phase_id).status = status;
    }

    pub fn add_tokens(&mut self, phase_id: &str, input: u64, output: u64) {
        let phase = self.phase_mut(phase_id);
        phase.input_tokens += input;
        phase.output_tokens += output;
    }

    /// Reset a phase for re-execution.
    ///
    /// Clears status, iteration counter and recorded commit; token counts
    /// are kept so task-level accounting survives back-jumps.
    pub fn reset_phase(&mut self, phase_id: &str) {
        let phase = self.phase_mut(phase_id);
        phase.status = PhaseStatus::Pending;
        phase.iteration = 0;
        phase.commit = None;
    }

    pub fn record_gate(&mut self, phase: &str, approved: bool, reason: &str) {
        self.gate_decisions.push(GateRecord {
            phase: phase.to_string(),
            approved,
            reason: reason.to_string(),
            decided_at: Utc::now(),
        });
    }

    /// Total tokens across all phases, including reset ones.
    pub fn total_tokens(&self) -> (u64, u64) {
        self.phases.values().fold((0, 0), |(i, o), p| {
            (i + p.input_tokens, o + p.output_tokens)
        })
    }

    /// Record a back-jump attempt for a failed phase and return the new count.
    pub fn bump_retry(&mut self, from_phase: &str) -> u32 {
        let count = self.retry_counts.entry(from_phase.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn retry_count(&self, from_phase: &str) -> u32 {
        self.retry_counts.get(from_phase).copied().unwrap_or(0)
    }
}

/// JSON persistence for [`ExecutionState`].
pub struct StateStore {
    state_file: PathBuf,
}

impl StateStore {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn save(&self, state: &ExecutionState) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }
        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize execution state")?;
        std::fs::write(&self.state_file, content)
            .with_context(|| format!("Failed to write state file: {}", self.state_file.display()))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<ExecutionState>> {
        if !self.state_file.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.state_file)
            .with_context(|| format!("Failed to read state file: {}", self.state_file.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.state_file.display()))?;
        Ok(Some(state))
    }

    /// Load existing state or start a fresh record for the task.
    pub fn load_or_new(&self, task_id: &str) -> Result<ExecutionState> {
        Ok(self.load()?.unwrap_or_else(|| ExecutionState::new(task_id)))
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_iteration_counter_is_monotonic() {
        let mut state = ExecutionState::new("T-001");
        assert_eq!(state.next_iteration("implement"), 1);
        assert_eq!(state.next_iteration("implement"), 2);
        assert_eq!(state.next_iteration("implement"), 3);
        // Independent counter per phase
        assert_eq!(state.next_iteration("review"), 1);
    }

    #[test]
    fn test_reset_phase_preserves_tokens() {
        let mut state = ExecutionState::new("T-001");
        state.next_iteration("implement");
        state.next_iteration("implement");
        state.add_tokens("implement", 1000, 500);
        state.set_status("implement", PhaseStatus::Failed);
        state.phase_mut("implement").commit = Some("abc".into());

        state.reset_phase("implement");

        let phase = state.phase("implement").unwrap();
        assert_eq!(phase.status, PhaseStatus::Pending);
        assert_eq!(phase.iteration, 0);
        assert!(phase.commit.is_none());
        // Token accounting history survives the reset
        assert_eq!(phase.input_tokens, 1000);
        assert_eq!(phase.output_tokens, 500);
    }

    #[test]
    fn test_total_tokens_sums_phases() {
        let mut state = ExecutionState::new("T-001");
        state.add_tokens("research", 100, 50);
        state.add_tokens("implement", 200, 75);
        assert_eq!(state.total_tokens(), (300, 125));
    }

    #[test]
    fn test_retry_counts_per_phase() {
        let mut state = ExecutionState::new("T-001");
        assert_eq!(state.retry_count("review"), 0);
        assert_eq!(state.bump_retry("review"), 1);
        assert_eq!(state.bump_retry("review"), 2);
        assert_eq!(state.retry_count("review"), 2);
        assert_eq!(state.retry_count("qa"), 0);
    }

    #[test]
    fn test_record_gate_appends_decision() {
        let mut state = ExecutionState::new("T-001");
        state.record_gate("review", true, "all criteria met");
        state.record_gate("qa", false, "tests missing");

        assert_eq!(state.gate_decisions.len(), 2);
        assert!(state.gate_decisions[0].approved);
        assert!(!state.gate_decisions[1].approved);
        assert_eq!(state.gate_decisions[1].phase, "qa");
    }

    #[test]
    fn test_state_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let mut state = ExecutionState::new("T-001");
        state.next_iteration("implement");
        state.add_tokens("implement", 10, 20);
        state.retry = Some(RetryContext {
            from_phase: "review".into(),
            to_phase: "implement".into(),
            reason: "gate rejected".into(),
            attempt: 1,
            failure_output: "issues found".into(),
            created_at: Utc::now(),
        });
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_state_store_load_or_new() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let fresh = store.load_or_new("T-005").unwrap();
        assert_eq!(fresh.task_id, "T-005");
        assert!(fresh.phases.is_empty());
    }
}
