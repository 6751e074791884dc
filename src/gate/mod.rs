//! Gate evaluation.
//!
//! A gate is a pass/fail check attached to a phase, evaluated against that
//! phase's output. Four strategies exist (`auto`, `rule`, `llm`, `human`);
//! the driver records every decision and, in automation-first mode, a
//! rejection without retry budget is logged and bypassed rather than
//! stopping the pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use dialoguer::{Select, theme::ColorfulTheme};
use tracing::debug;

use crate::agent::AgentClient;
use crate::extract::find_last_json_object;
use crate::plan::{Gate, GateKind, Phase};
use crate::resolver::PhaseClaudeConfig;

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub approved: bool,
    pub reason: String,
}

impl GateDecision {
    pub fn approved(reason: &str) -> Self {
        Self {
            approved: true,
            reason: reason.to_string(),
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            approved: false,
            reason: reason.to_string(),
        }
    }
}

/// How much of the phase output the LLM judge sees.
const LLM_OUTPUT_TAIL: usize = 4000;

/// Evaluates gates against phase output.
///
/// The agent client is only used for `llm` gates; `interactive` enables
/// the `human` variant (a non-interactive run treats `human` gates as
/// auto-approved with a recorded note, keeping unattended pipelines
/// moving).
pub struct GateEvaluator {
    agent: Option<Arc<dyn AgentClient>>,
    interactive: bool,
}

impl GateEvaluator {
    pub fn new(agent: Option<Arc<dyn AgentClient>>, interactive: bool) -> Self {
        Self { agent, interactive }
    }

    pub async fn evaluate(&self, gate: &Gate, phase: &Phase, output: &str) -> Result<GateDecision> {
        match gate.kind {
            GateKind::Auto => {
                // The executor only reaches the gate on successful
                // completion, so the shortcut approves outright.
                if gate.auto_approve_on_success {
                    Ok(GateDecision::approved("phase completed successfully"))
                } else {
                    self.evaluate_rule(gate, output)
                }
            }
            GateKind::Rule => self.evaluate_rule(gate, output),
            GateKind::Llm => self.evaluate_llm(gate, phase, output).await,
            GateKind::Human => self.evaluate_human(phase),
        }
    }

    /// Every criterion string must appear in the output (case-insensitive).
    fn evaluate_rule(&self, gate: &Gate, output: &str) -> Result<GateDecision> {
        let haystack = output.to_lowercase();
        let missing: Vec<&str> = gate
            .criteria
            .iter()
            .filter(|c| !haystack.contains(&c.to_lowercase()))
            .map(|c| c.as_str())
            .collect();

        if missing.is_empty() {
            Ok(GateDecision::approved("all criteria met"))
        } else {
            Ok(GateDecision::rejected(&format!(
                "criteria not met: {}",
                missing.join(", ")
            )))
        }
    }

    async fn evaluate_llm(
        &self,
        gate: &Gate,
        phase: &Phase,
        output: &str,
    ) -> Result<GateDecision> {
        let Some(agent) = &self.agent else {
            // No judge available: fail open, the decision is recorded
            debug!(phase = %phase.id, "llm gate without agent client; approving");
            return Ok(GateDecision::approved("no judge available, auto-approved"));
        };

        let tail: String = output
            .chars()
            .rev()
            .take(LLM_OUTPUT_TAIL)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let criteria = if gate.criteria.is_empty() {
            "The phase output indicates the work was completed correctly.".to_string()
        } else {
            gate.criteria
                .iter()
                .map(|c| format!("- {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            "You are a gate evaluator for the '{}' phase of an automated pipeline.\n\
             Judge whether the phase output satisfies the criteria.\n\n\
             ## CRITERIA\n{}\n\n## PHASE OUTPUT (tail)\n{}\n\n\
             Respond with a single JSON object: {{\"approved\": true|false, \"reason\": \"...\"}}",
            phase.id, criteria, tail
        );

        let config = PhaseClaudeConfig {
            tools: Some(vec![]),
            max_turns: 1,
            ..Default::default()
        };
        let outcome = agent
            .invoke(&prompt, &config, None, None)
            .await
            .map_err(|e| anyhow::anyhow!("gate judge invocation failed: {}", e))?;

        let json = find_last_json_object(&outcome.output)
            .context("gate judge returned no JSON decision")?;
        let value: serde_json::Value =
            serde_json::from_str(json).context("gate judge returned invalid JSON")?;
        let approved = value
            .get("approved")
            .and_then(|v| v.as_bool())
            .context("gate judge decision missing 'approved'")?;
        let reason = value
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("no reason given")
            .to_string();

        Ok(GateDecision { approved, reason })
    }

    fn evaluate_human(&self, phase: &Phase) -> Result<GateDecision> {
        if !self.interactive {
            return Ok(GateDecision::approved(
                "human gate skipped in non-interactive run",
            ));
        }

        let options = &["Approve", "Reject"];
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Approve output of phase '{}'?", phase.name))
            .items(options)
            .default(0)
            .interact()?;

        match selection {
            0 => Ok(GateDecision::approved("approved by operator")),
            _ => Ok(GateDecision::rejected("rejected by operator")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Phase;

    fn evaluator() -> GateEvaluator {
        GateEvaluator::new(None, false)
    }

    fn phase() -> Phase {
        Phase::new("review", "Review")
    }

    #[tokio::test]
    async fn test_auto_gate_approves_on_success() {
        let gate = Gate {
            kind: GateKind::Auto,
            criteria: vec![],
            auto_approve_on_success: true,
        };
        let decision = evaluator().evaluate(&gate, &phase(), "anything").await.unwrap();
        assert!(decision.approved);
        assert_eq!(decision.reason, "phase completed successfully");
    }

    #[tokio::test]
    async fn test_auto_gate_without_shortcut_falls_back_to_rule() {
        let gate = Gate {
            kind: GateKind::Auto,
            criteria: vec!["tests pass".into()],
            auto_approve_on_success: false,
        };
        let decision = evaluator()
            .evaluate(&gate, &phase(), "All tests pass now.")
            .await
            .unwrap();
        assert!(decision.approved);

        let decision = evaluator()
            .evaluate(&gate, &phase(), "Nothing to report.")
            .await
            .unwrap();
        assert!(!decision.approved);
    }

    #[tokio::test]
    async fn test_rule_gate_reports_missing_criteria() {
        let gate = Gate {
            kind: GateKind::Rule,
            criteria: vec!["tests pass".into(), "docs updated".into()],
            auto_approve_on_success: true,
        };
        let decision = evaluator()
            .evaluate(&gate, &phase(), "the tests pass")
            .await
            .unwrap();
        assert!(!decision.approved);
        assert!(decision.reason.contains("docs updated"));
        assert!(!decision.reason.contains("tests pass,"));
    }

    #[tokio::test]
    async fn test_rule_gate_is_case_insensitive() {
        let gate = Gate {
            kind: GateKind::Rule,
            criteria: vec!["Tests Pass".into()],
            auto_approve_on_success: true,
        };
        let decision = evaluator()
            .evaluate(&gate, &phase(), "TESTS PASS")
            .await
            .unwrap();
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn test_llm_gate_without_agent_fails_open() {
        let gate = Gate {
            kind: GateKind::Llm,
            criteria: vec!["whatever".into()],
            auto_approve_on_success: true,
        };
        let decision = evaluator().evaluate(&gate, &phase(), "output").await.unwrap();
        assert!(decision.approved);
        assert!(decision.reason.contains("auto-approved"));
    }

    #[tokio::test]
    async fn test_human_gate_non_interactive_approves() {
        let gate = Gate {
            kind: GateKind::Human,
            criteria: vec![],
            auto_approve_on_success: true,
        };
        let decision = evaluator().evaluate(&gate, &phase(), "output").await.unwrap();
        assert!(decision.approved);
        assert!(decision.reason.contains("non-interactive"));
    }
}
