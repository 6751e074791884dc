//! Single-phase execution.
//!
//! [`PhaseExecutor::execute`] drives one phase through its iteration loop:
//! build the prompt, invoke the agent, check for the completion or
//! blockage tags, and commit a checkpoint on success. Three executor
//! flavors exist, one per task weight; they share this implementation and
//! differ only in [`ExecutorDefaults`] (iteration cap, timeout, and
//! whether the agent session persists across iterations).

pub mod prompt;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::agent::{AgentClient, SessionManager, StreamTarget};
use crate::config::DefaultsSection;
use crate::errors::PhaseError;
use crate::events::{EventPublisher, TaskEvent};
use crate::extract::{CONTENT_PHASES, PhaseArtifact, extract_artifact};
use crate::plan::{Phase, PhaseStatus};
use crate::resolver::{ConfigResolver, McpRuntimeOptions};
use crate::state::ExecutionState;
use crate::task::{Task, TaskWeight};
use crate::transcript::{Role, TranscriptBuffer};
use crate::vcs::Vcs;

/// Tag the agent emits when any phase is done.
const PHASE_COMPLETE_TAG: &str = "<phase_complete>true</phase_complete>";
/// Tag the agent emits when it cannot proceed without clarification.
const PHASE_BLOCKED_TAG: &str = "<phase_blocked>";

/// True when the output carries the generic or phase-specific completion tag.
pub fn is_phase_complete(output: &str, phase_id: &str) -> bool {
    output.contains(PHASE_COMPLETE_TAG)
        || output.contains(&format!("<{0}_complete>true</{0}_complete>", phase_id))
}

pub fn is_phase_blocked(output: &str) -> bool {
    output.contains(PHASE_BLOCKED_TAG)
}

/// Per-weight executor defaults.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorDefaults {
    pub max_iterations: u32,
    pub timeout: Duration,
    /// Resume the agent session across iterations
    pub persist_session: bool,
}

impl ExecutorDefaults {
    pub fn for_weight(weight: TaskWeight, base: &DefaultsSection) -> Self {
        let base_timeout = base.phase_timeout_secs;
        match weight {
            TaskWeight::Trivial => Self {
                max_iterations: 3,
                timeout: Duration::from_secs(base_timeout / 3),
                persist_session: false,
            },
            TaskWeight::Standard => Self {
                max_iterations: base.max_iterations,
                timeout: Duration::from_secs(base_timeout),
                persist_session: false,
            },
            TaskWeight::Full => Self {
                max_iterations: base.max_iterations * 2,
                timeout: Duration::from_secs(base_timeout * 2),
                persist_session: true,
            },
        }
    }
}

/// Result of one phase execution.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub status: PhaseStatus,
    pub iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Checkpoint commit, absent when the VCS declined
    pub commit: Option<String>,
    pub artifacts: Vec<PhaseArtifact>,
    /// The terminal agent output of the final iteration
    pub output: String,
}

/// Executes single phases for one task's working directory.
pub struct PhaseExecutor {
    defaults: ExecutorDefaults,
    agent: Arc<dyn AgentClient>,
    vcs: Arc<dyn Vcs>,
    resolver: Arc<ConfigResolver>,
    buffer: Arc<TranscriptBuffer>,
    publisher: Arc<dyn EventPublisher>,
    sessions: Arc<SessionManager>,
    templates_dir: PathBuf,
    /// `.orc/tasks/<taskID>`, for legacy per-iteration snapshots
    task_dir: PathBuf,
}

impl PhaseExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        defaults: ExecutorDefaults,
        agent: Arc<dyn AgentClient>,
        vcs: Arc<dyn Vcs>,
        resolver: Arc<ConfigResolver>,
        buffer: Arc<TranscriptBuffer>,
        publisher: Arc<dyn EventPublisher>,
        sessions: Arc<SessionManager>,
        templates_dir: &Path,
        task_dir: &Path,
    ) -> Self {
        Self {
            defaults,
            agent,
            vcs,
            resolver,
            buffer,
            publisher,
            sessions,
            templates_dir: templates_dir.to_path_buf(),
            task_dir: task_dir.to_path_buf(),
        }
    }

    /// Run one phase to a terminal outcome.
    ///
    /// The loop walks Prompting → Executing → Checking each iteration;
    /// on completion it enters Committing (checkpoint) and returns. A
    /// blocked tag or an exhausted iteration cap fails the phase.
    pub async fn execute(
        &self,
        task: &Task,
        phase: &Phase,
        state: &mut ExecutionState,
    ) -> Result<PhaseResult, PhaseError> {
        let max_iterations = phase.max_iterations.unwrap_or(self.defaults.max_iterations);
        let qa_output_dir = std::env::temp_dir().join(format!("orc-qa-{}", task.id));
        std::fs::create_dir_all(&qa_output_dir)
            .map_err(|e| PhaseError::Infra(anyhow::anyhow!("Failed to create QA dir: {}", e)))?;

        let mut total_input = 0u64;
        let mut total_output = 0u64;

        for _ in 0..max_iterations {
            // Prompting
            let iteration = state.next_iteration(&phase.id);
            let template = prompt::load_template(&self.templates_dir, phase)?;
            let vars = prompt::build_vars(task, phase, iteration, state, &qa_output_dir);
            let rendered = prompt::substitute(&template, &vars);

            self.buffer
                .add(&phase.id, iteration, Role::Prompt, &rendered)
                .await;

            let mut config = self.resolver.resolve(None, phase.config.as_ref())?;
            self.resolver
                .enrich_for_task(&mut config, &task.id, &McpRuntimeOptions::default());

            // Executing
            let resume = if self.defaults.persist_session {
                self.sessions.get(&task.id)
            } else {
                None
            };
            let stream = StreamTarget {
                buffer: Arc::clone(&self.buffer),
                phase: phase.id.clone(),
                iteration,
            };
            let invocation =
                self.agent
                    .invoke(&rendered, &config, resume.as_deref(), Some(&stream));
            let outcome = tokio::time::timeout(self.defaults.timeout, invocation)
                .await
                .map_err(|_| PhaseError::Timeout {
                    seconds: self.defaults.timeout.as_secs(),
                })??;

            self.buffer
                .add(&phase.id, iteration, Role::Response, &outcome.output)
                .await;
            self.write_snapshot(&phase.id, iteration, &outcome.output);

            if let Some(session_id) = &outcome.session_id {
                self.sessions.record(&task.id, session_id);
            }

            total_input += outcome.input_tokens;
            total_output += outcome.output_tokens;
            state.add_tokens(&phase.id, outcome.input_tokens, outcome.output_tokens);
            self.publisher.publish(TaskEvent::TokenUsage {
                task_id: task.id.clone(),
                phase: phase.id.clone(),
                iteration,
                input_tokens: outcome.input_tokens,
                output_tokens: outcome.output_tokens,
            });

            // Checking
            if is_phase_blocked(&outcome.output) {
                return Err(PhaseError::Blocked {
                    detail: outcome.output.clone(),
                });
            }

            if is_phase_complete(&outcome.output, &phase.id) {
                let artifacts = self.collect_artifacts(phase, iteration, &outcome.output)?;

                // Committing
                let message = format!("{}: {} - completed", phase.id, task.title);
                let commit = match self.vcs.create_checkpoint(&task.id, &phase.id, &message) {
                    Ok(sha) => Some(sha),
                    Err(e) => {
                        warn!(task = %task.id, phase = %phase.id, error = %e,
                              "checkpoint failed; continuing without commit");
                        None
                    }
                };

                self.publisher.publish(TaskEvent::PhaseCompleted {
                    task_id: task.id.clone(),
                    phase: phase.id.clone(),
                    iterations: iteration,
                });

                return Ok(PhaseResult {
                    status: PhaseStatus::Completed,
                    iterations: iteration,
                    input_tokens: total_input,
                    output_tokens: total_output,
                    commit,
                    artifacts,
                    output: outcome.output,
                });
            }

            debug!(task = %task.id, phase = %phase.id, iteration,
                   "no completion tag; iterating");
        }

        Err(PhaseError::MaxIterations {
            max: max_iterations,
        })
    }

    /// Extract the phase's structured artifacts from its terminal output.
    ///
    /// Content, review and qa phases require their schema; any other phase
    /// captures a status object opportunistically.
    fn collect_artifacts(
        &self,
        phase: &Phase,
        iteration: u32,
        output: &str,
    ) -> Result<Vec<PhaseArtifact>, PhaseError> {
        let required =
            CONTENT_PHASES.contains(&phase.id.as_str()) || matches!(phase.id.as_str(), "review" | "qa");

        match extract_artifact(&phase.id, iteration, output) {
            Ok(artifact) => Ok(vec![artifact]),
            Err(e) if required => Err(PhaseError::Extraction(e)),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Legacy single-iteration snapshot at
    /// `<taskDir>/transcripts/<phase>-NNN.md`. Best-effort.
    fn write_snapshot(&self, phase_id: &str, iteration: u32, output: &str) {
        let dir = self.task_dir.join("transcripts");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(error = %e, "failed to create transcripts dir");
            return;
        }
        let path = dir.join(format!("{}-{:03}.md", phase_id, iteration));
        if let Err(e) = std::fs::write(&path, output) {
            warn!(path = %path.display(), error = %e, "failed to write transcript snapshot");
        }
    }
}
