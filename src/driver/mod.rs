//! Task orchestration.
//!
//! [`TaskDriver::execute_task`] drives a task's plan from the first
//! non-completed phase to a terminal state: worktree setup, per-phase
//! execution, gate evaluation, retry back-jumps, the completion action and
//! initiative auto-completion.
//!
//! ## Persistence ownership
//!
//! | Layer | What it persists |
//! |---|---|
//! | `state.rs` / `StateStore` | Phase status, iterations, tokens, retries |
//! | `plan.json` | Phase statuses and checkpoint commits |
//! | task store | Task status, timestamps, PR URL metadata |
//! | transcript sink | Prompt/response/chunk lines |
//!
//! The execution state is the source of truth for resume: a restarted
//! driver skips phases already recorded as completed.

pub mod completion;
pub mod retry;

pub use completion::{GhCli, PrCreator};
pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{AgentClient, ClaudeCliClient, SessionManager};
use crate::config::{self, OrcConfig};
use crate::errors::{DriverError, PhaseError};
use crate::events::{EventPublisher, TaskEvent};
use crate::executor::{ExecutorDefaults, PhaseExecutor};
use crate::extract::PhaseArtifact;
use crate::gate::GateEvaluator;
use crate::knowledge;
use crate::plan::{PhaseStatus, Plan};
use crate::resolver::{ConfigResolver, cleanup_task_dirs};
use crate::state::{ExecutionState, RetryContext, StateStore};
use crate::task::{InitiativeStatus, Task, TaskStatus, TaskStore, TaskWeight};
use crate::transcript::{TranscriptBuffer, TranscriptSink};
use crate::vcs::Vcs;

/// Builds an agent client bound to a working directory; called again
/// whenever the driver rebinds to a worktree.
pub type AgentFactory = Arc<dyn Fn(&Path) -> Arc<dyn AgentClient> + Send + Sync>;

pub struct TaskDriver {
    project_root: PathBuf,
    config: OrcConfig,
    vcs: Arc<dyn Vcs>,
    store: Arc<dyn TaskStore>,
    sink: Option<Arc<dyn TranscriptSink>>,
    publisher: Arc<dyn EventPublisher>,
    pr_tool: Option<Arc<dyn PrCreator>>,
    agent_factory: AgentFactory,
    retry_policy: RetryPolicy,

    // Rebound atomically on worktree setup
    work_dir: PathBuf,
    agent: Arc<dyn AgentClient>,
    sessions: Arc<SessionManager>,
    executors: HashMap<TaskWeight, Arc<PhaseExecutor>>,
}

impl TaskDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_root: &Path,
        config: OrcConfig,
        vcs: Arc<dyn Vcs>,
        store: Arc<dyn TaskStore>,
        sink: Option<Arc<dyn TranscriptSink>>,
        publisher: Arc<dyn EventPublisher>,
        pr_tool: Option<Arc<dyn PrCreator>>,
        agent_factory: AgentFactory,
    ) -> Self {
        let retry_policy = RetryPolicy::from_config(&config.retry);
        let agent = agent_factory(project_root);
        Self {
            project_root: project_root.to_path_buf(),
            work_dir: project_root.to_path_buf(),
            config,
            vcs,
            store,
            sink,
            publisher,
            pr_tool,
            agent_factory,
            retry_policy,
            agent,
            sessions: Arc::new(SessionManager::new(project_root)),
            executors: HashMap::new(),
        }
    }

    /// Driver wired with the production collaborators: git2 VCS, file
    /// stores, gh-CLI PR tool and the agent CLI client.
    pub fn with_default_services(project_root: &Path, config: OrcConfig) -> Self {
        let claude_cmd = config.project.claude_cmd.clone();
        let vcs: Arc<dyn Vcs> = Arc::new(crate::vcs::GitVcs::new(project_root));
        let store: Arc<dyn TaskStore> =
            Arc::new(crate::task::FileTaskStore::new(&config::orc_dir(project_root)));
        let sink: Arc<dyn TranscriptSink> = Arc::new(
            crate::transcript::FileTranscriptStore::new(&config::tasks_dir(project_root)),
        );
        let pr_tool: Arc<dyn PrCreator> = Arc::new(GhCli::new(project_root));
        let agent_factory: AgentFactory = Arc::new(move |work_dir: &Path| {
            Arc::new(ClaudeCliClient::new(&claude_cmd, work_dir)) as Arc<dyn AgentClient>
        });
        Self::new(
            project_root,
            config,
            vcs,
            store,
            Some(sink),
            Arc::new(crate::events::LogPublisher),
            Some(pr_tool),
            agent_factory,
        )
    }

    /// Rebind the agent client, session manager and executor cache to a
    /// new working directory. The swap happens before any executor is
    /// reacquired, so no phase ever runs against a stale checkout.
    fn rebind(&mut self, work_dir: &Path) {
        self.work_dir = work_dir.to_path_buf();
        self.agent = (self.agent_factory)(work_dir);
        self.sessions = Arc::new(SessionManager::new(work_dir));
        self.executors.clear();
    }

    fn executor_for(
        &mut self,
        weight: TaskWeight,
        buffer: &Arc<TranscriptBuffer>,
        task_dir: &Path,
    ) -> Arc<PhaseExecutor> {
        if let Some(executor) = self.executors.get(&weight) {
            return Arc::clone(executor);
        }
        let defaults = ExecutorDefaults::for_weight(weight, &self.config.defaults);
        let executor = Arc::new(PhaseExecutor::new(
            defaults,
            Arc::clone(&self.agent),
            Arc::clone(&self.vcs),
            Arc::new(ConfigResolver::for_project(&self.work_dir)),
            Arc::clone(buffer),
            Arc::clone(&self.publisher),
            Arc::clone(&self.sessions),
            &self.config.templates_dir(&self.work_dir),
            task_dir,
        ));
        self.executors.insert(weight, Arc::clone(&executor));
        executor
    }

    /// Drive the plan to a terminal state.
    pub async fn execute_task(
        &mut self,
        task: &mut Task,
        plan: &mut Plan,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), DriverError> {
        let task_dir = config::task_dir(&self.project_root, &task.id);
        let state_store = StateStore::new(task_dir.join("state.json"));
        let plan_path = task_dir.join("plan.json");
        let mut state = state_store
            .load_or_new(&task.id)
            .map_err(DriverError::Infra)?;

        // Worktree setup
        if self.config.worktree.enabled {
            let path = self
                .vcs
                .create_worktree(&task.id, &self.config.project.target_branch)
                .map_err(DriverError::Infra)?;
            self.rebind(&path);
        } else {
            let root = self.project_root.clone();
            self.rebind(&root);
        }

        let buffer = Arc::new(TranscriptBuffer::new(
            &task.id,
            self.sink.clone(),
            self.config.defaults.transcript_max_buffer,
            Some(Duration::from_secs(self.config.defaults.transcript_flush_secs)),
        ));
        let executor = self.executor_for(task.weight, &buffer, &task_dir);

        task.mark_running();
        self.store.save_task(task).map_err(DriverError::Infra)?;

        let knowledge_before = knowledge::hash_knowledge_block(&self.work_dir.join("CLAUDE.md"));

        let mut index = 0usize;
        while index < plan.phases.len() {
            let phase = plan.phases[index].clone();

            // Skip phases already completed (checkpoint recovery)
            if state.phase(&phase.id).map(|p| p.status) == Some(PhaseStatus::Completed) {
                index += 1;
                continue;
            }

            state.set_status(&phase.id, PhaseStatus::Running);
            plan.phases[index].status = PhaseStatus::Running;
            self.persist(&state_store, &state, plan, &plan_path, task)?;
            self.publisher.publish(TaskEvent::PhaseStarted {
                task_id: task.id.clone(),
                phase: phase.id.clone(),
            });

            let exec_outcome = {
                let exec_fut = executor.execute(task, &phase, &mut state);
                tokio::pin!(exec_fut);
                tokio::select! {
                    result = &mut exec_fut => Some(result),
                    _ = cancel.changed() => None,
                }
            };

            let Some(exec_result) = exec_outcome else {
                return self
                    .finish_interrupted(task, plan, index, &mut state, &state_store, &plan_path, &buffer)
                    .await;
            };

            match exec_result {
                Err(err) => {
                    let reason = err.to_string();
                    let failure_output = failure_output(&err);
                    if err.is_retryable()
                        && let Some(from_idx) = self.try_back_jump(
                            plan,
                            &mut state,
                            task,
                            &task_dir,
                            &phase.id,
                            &reason,
                            &failure_output,
                            index,
                        )
                    {
                        self.persist(&state_store, &state, plan, &plan_path, task)?;
                        index = from_idx;
                        continue;
                    }

                    let exhausted = err.is_retryable()
                        && self.retry_policy.should_retry_from(&phase.id).is_some()
                        && state.retry_count(&phase.id) >= self.retry_policy.max_retries();

                    return self
                        .finish_failed(
                            task, plan, index, &mut state, &state_store, &plan_path, &buffer,
                            err, exhausted,
                        )
                        .await;
                }
                Ok(result) => {
                    state.set_status(&phase.id, PhaseStatus::Completed);
                    state.phase_mut(&phase.id).commit = result.commit.clone();
                    plan.phases[index].status = PhaseStatus::Completed;
                    plan.phases[index].commit = result.commit.clone();
                    for artifact in &result.artifacts {
                        if let PhaseArtifact::Content { phase, content } = artifact {
                            state.artifacts.insert(phase.clone(), content.clone());
                        }
                    }
                    state.retry = None;
                    self.persist(&state_store, &state, plan, &plan_path, task)?;

                    if let Some(gate) = &phase.gate {
                        let evaluator =
                            GateEvaluator::new(Some(Arc::clone(&self.agent)), false);
                        let decision = evaluator
                            .evaluate(gate, &phase, &result.output)
                            .await
                            .map_err(DriverError::Infra)?;

                        state.record_gate(&phase.id, decision.approved, &decision.reason);
                        self.publisher.publish(TaskEvent::GateDecision {
                            task_id: task.id.clone(),
                            phase: phase.id.clone(),
                            approved: decision.approved,
                            reason: decision.reason.clone(),
                        });

                        if !decision.approved {
                            let reason = format!(
                                "Gate rejected for phase {}: {}",
                                phase.id, decision.reason
                            );
                            if let Some(from_idx) = self.try_back_jump(
                                plan,
                                &mut state,
                                task,
                                &task_dir,
                                &phase.id,
                                &reason,
                                &result.output,
                                index,
                            ) {
                                self.persist(&state_store, &state, plan, &plan_path, task)?;
                                index = from_idx;
                                continue;
                            }
                            // Automation-first: record, warn, advance
                            warn!(task = %task.id, phase = %phase.id,
                                  reason = %decision.reason,
                                  "gate rejected without retry budget; advancing");
                        }
                        self.persist(&state_store, &state, plan, &plan_path, task)?;
                    }

                    index += 1;
                }
            }
        }

        self.finish_completed(task, plan, &mut state, &state_store, &plan_path, &buffer, knowledge_before)
            .await
    }

    /// Reset every phase in `[retryFrom..failed]` and return the index to
    /// jump to, or `None` when policy or budget forbids the retry.
    #[allow(clippy::too_many_arguments)]
    fn try_back_jump(
        &self,
        plan: &mut Plan,
        state: &mut ExecutionState,
        task: &Task,
        task_dir: &Path,
        failed_phase: &str,
        reason: &str,
        failure_output: &str,
        index: usize,
    ) -> Option<usize> {
        let retry_from = self.retry_policy.should_retry_from(failed_phase)?.to_string();
        if state.retry_count(failed_phase) >= self.retry_policy.max_retries() {
            return None;
        }
        let Some(from_idx) = plan.phase_index(&retry_from) else {
            warn!(phase = %retry_from, "retry target not in plan; treating as non-retryable");
            return None;
        };
        if from_idx > index {
            warn!(phase = %retry_from, "retry target is after the failed phase; ignoring");
            return None;
        }

        let attempt = state.bump_retry(failed_phase);
        let ctx = RetryContext {
            from_phase: failed_phase.to_string(),
            to_phase: retry_from.clone(),
            reason: reason.to_string(),
            attempt,
            failure_output: failure_output.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = retry::write_retry_context_file(task_dir, &ctx) {
            warn!(error = %e, "failed to write retry context file");
        }
        state.retry = Some(ctx);

        // Reset is completed before the loop index moves
        for i in from_idx..=index {
            let id = plan.phases[i].id.clone();
            state.reset_phase(&id);
            plan.phases[i].status = PhaseStatus::Pending;
            plan.phases[i].commit = None;
        }
        self.sessions.clear(&task.id);

        info!(task = %task.id, from = failed_phase, to = %retry_from, attempt,
              "retry back-jump");
        self.publisher.publish(TaskEvent::RetryScheduled {
            task_id: task.id.clone(),
            from_phase: failed_phase.to_string(),
            to_phase: retry_from,
            attempt,
        });

        Some(from_idx)
    }

    fn persist(
        &self,
        state_store: &StateStore,
        state: &ExecutionState,
        plan: &Plan,
        plan_path: &Path,
        task: &Task,
    ) -> Result<(), DriverError> {
        state_store.save(state).map_err(DriverError::Infra)?;
        plan.save(plan_path).map_err(DriverError::Infra)?;
        self.store.save_task(task).map_err(DriverError::Infra)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_interrupted(
        &self,
        task: &mut Task,
        plan: &mut Plan,
        index: usize,
        state: &mut ExecutionState,
        state_store: &StateStore,
        plan_path: &Path,
        buffer: &TranscriptBuffer,
    ) -> Result<(), DriverError> {
        let phase_id = plan.phases[index].id.clone();
        // The phase re-runs on resume
        state.set_status(&phase_id, PhaseStatus::Pending);
        plan.phases[index].status = PhaseStatus::Pending;
        task.mark_interrupted();
        state.terminal = Some(TaskStatus::Interrupted);
        self.persist(state_store, state, plan, plan_path, task)?;

        buffer.close().await.ok();
        self.cleanup_after(task, false);
        info!(task = %task.id, phase = %phase_id, "task interrupted");
        Err(DriverError::Interrupted {
            task_id: task.id.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failed(
        &self,
        task: &mut Task,
        plan: &mut Plan,
        index: usize,
        state: &mut ExecutionState,
        state_store: &StateStore,
        plan_path: &Path,
        buffer: &TranscriptBuffer,
        err: PhaseError,
        retry_exhausted: bool,
    ) -> Result<(), DriverError> {
        let phase_id = plan.phases[index].id.clone();
        state.set_status(&phase_id, PhaseStatus::Failed);
        plan.phases[index].status = PhaseStatus::Failed;
        task.mark_failed();
        state.terminal = Some(TaskStatus::Failed);
        self.persist(state_store, state, plan, plan_path, task)?;

        self.publisher.publish(TaskEvent::TaskFailed {
            task_id: task.id.clone(),
            reason: err.to_string(),
        });
        buffer.close().await.ok();
        self.cleanup_after(task, false);

        if retry_exhausted {
            let attempts = state.retry_count(&phase_id);
            Err(DriverError::RetryExhausted {
                phase: phase_id,
                attempts,
            })
        } else {
            Err(DriverError::Phase {
                phase: phase_id,
                source: err,
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_completed(
        &self,
        task: &mut Task,
        plan: &mut Plan,
        state: &mut ExecutionState,
        state_store: &StateStore,
        plan_path: &Path,
        buffer: &TranscriptBuffer,
        knowledge_before: String,
    ) -> Result<(), DriverError> {
        task.mark_completed();
        state.terminal = Some(TaskStatus::Completed);
        self.persist(state_store, state, plan, plan_path, task)?;
        self.publisher.publish(TaskEvent::TaskCompleted {
            task_id: task.id.clone(),
        });

        // Completion action failures never un-complete the task
        match completion::run_completion(
            &self.config.completion,
            task,
            &self.config.project.target_branch,
            self.vcs.as_ref(),
            self.pr_tool.as_deref(),
        )
        .await
        {
            Ok(Some(url)) => {
                task.metadata.insert("pr_url".to_string(), url);
                self.store.save_task(task).map_err(DriverError::Infra)?;
            }
            Ok(None) => {}
            Err(e) => warn!(task = %task.id, error = %e, "completion action failed"),
        }

        buffer.close().await.ok();
        self.capture_knowledge(task, plan, &knowledge_before).await;
        self.cleanup_after(task, true);
        self.maybe_complete_initiative(task)?;

        info!(task = %task.id, "task completed");
        Ok(())
    }

    /// Extract learnings from the final phase's transcript, guarded by the
    /// CLAUDE.md knowledge-block hash. Best-effort.
    async fn capture_knowledge(&self, task: &Task, plan: &Plan, before: &str) {
        let claude_md = self.work_dir.join("CLAUDE.md");
        let after = knowledge::hash_knowledge_block(&claude_md);
        if !knowledge::hash_gate_passes(before, &after) {
            return;
        }
        let Some(sink) = &self.sink else { return };
        let Some(final_phase) = plan.phases.last() else { return };

        let lines = match sink.get_transcripts(&task.id).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "failed to read transcripts for knowledge capture");
                return;
            }
        };
        // Response lines are the canonical record; chunk lines duplicate
        // them as streaming fragments.
        let transcript: String = lines
            .iter()
            .filter(|l| l.phase == final_phase.id && l.role == crate::transcript::Role::Response)
            .map(|l| l.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let capture = knowledge::extract_knowledge(&transcript, &task.id);
        if capture.is_empty() {
            return;
        }
        if let Err(e) = knowledge::append_knowledge(&claude_md, &capture) {
            warn!(error = %e, "failed to append knowledge");
        }
    }

    /// Worktree and per-task temp-dir cleanup at terminal state.
    fn cleanup_after(&self, task: &Task, success: bool) {
        cleanup_task_dirs(&task.id);
        let qa_dir = std::env::temp_dir().join(format!("orc-qa-{}", task.id));
        std::fs::remove_dir_all(&qa_dir).ok();

        if !self.config.worktree.enabled {
            return;
        }
        let should_cleanup = if success {
            self.config.worktree.cleanup_on_success
        } else {
            self.config.worktree.cleanup_on_failure
        };
        if should_cleanup
            && let Err(e) = self.vcs.cleanup_worktree(&task.id)
        {
            warn!(task = %task.id, error = %e, "worktree cleanup failed");
        }
    }

    /// Transition the parent initiative to completed once every sibling
    /// task has completed. Initiatives with a branch base integrate
    /// through the merge flow and are skipped here.
    fn maybe_complete_initiative(&self, task: &Task) -> Result<(), DriverError> {
        let Some(initiative_id) = &task.initiative_id else {
            return Ok(());
        };
        let initiative = self
            .store
            .get_initiative(initiative_id)
            .map_err(DriverError::Infra)?
            .ok_or_else(|| DriverError::InitiativeNotFound {
                initiative_id: initiative_id.clone(),
            })?;

        if initiative.branch_base.is_some() || initiative.status == InitiativeStatus::Completed {
            return Ok(());
        }
        let siblings = self
            .store
            .tasks_in_initiative(initiative_id)
            .map_err(DriverError::Infra)?;
        if siblings.is_empty() {
            return Ok(());
        }
        if siblings.iter().all(|t| t.status == TaskStatus::Completed) {
            let mut initiative = initiative;
            initiative.status = InitiativeStatus::Completed;
            initiative.completed_at = Some(Utc::now());
            self.store
                .save_initiative(&initiative)
                .map_err(DriverError::Infra)?;
            info!(initiative = %initiative.id, "initiative auto-completed");
        }
        Ok(())
    }
}

/// Output carried into the retry context for each failure kind.
fn failure_output(err: &PhaseError) -> String {
    match err {
        PhaseError::Blocked { detail } => detail.clone(),
        PhaseError::Extraction(e) => e.output_preview.clone(),
        _ => String::new(),
    }
}
