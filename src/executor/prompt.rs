//! Prompt template resolution and variable substitution.
//!
//! Templates live at `<templatesDir>/prompts/<phaseName>.md` with a
//! fallback to `<phaseID>.md` and finally to the plan's inline prompt.
//! Variables use `{{NAME}}` syntax; unknown variables are left in place so
//! a template typo is visible in the transcript instead of silently
//! vanishing.

use std::collections::HashMap;
use std::path::Path;

use crate::errors::PhaseError;
use crate::plan::Phase;
use crate::state::ExecutionState;
use crate::task::Task;

/// Resolve the prompt template for a phase.
///
/// Lookup order: `prompts/<phase name>.md`, `prompts/<phase id>.md`, the
/// plan's inline prompt. No match is a [`PhaseError::PromptBuild`], fatal
/// to the phase.
pub fn load_template(templates_dir: &Path, phase: &Phase) -> Result<String, PhaseError> {
    let prompts_dir = templates_dir.join("prompts");

    for candidate in [&phase.name, &phase.id] {
        let path = prompts_dir.join(format!("{}.md", candidate));
        if path.exists() {
            return std::fs::read_to_string(&path).map_err(|e| {
                PhaseError::Infra(anyhow::anyhow!(
                    "Failed to read template {}: {}",
                    path.display(),
                    e
                ))
            });
        }
    }

    if let Some(inline) = &phase.prompt {
        return Ok(inline.clone());
    }

    Err(PhaseError::PromptBuild {
        phase: phase.id.clone(),
    })
}

/// Replace `{{NAME}}` placeholders with their values.
pub fn substitute(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut result = template.to_string();
    for (name, value) in vars {
        result = result.replace(&format!("{{{{{}}}}}", name), value);
    }
    result
}

/// Build the substitution map for one iteration.
///
/// Content variables (`RESEARCH_CONTENT`, `SPEC_CONTENT`, `DESIGN_CONTENT`)
/// come from artifacts captured by earlier phases; they substitute to the
/// empty string when the phase has not run.
#[allow(clippy::too_many_arguments)]
pub fn build_vars(
    task: &Task,
    phase: &Phase,
    iteration: u32,
    state: &ExecutionState,
    qa_output_dir: &Path,
) -> HashMap<&'static str, String> {
    let mut vars: HashMap<&'static str, String> = HashMap::new();
    vars.insert("TASK_ID", task.id.clone());
    vars.insert("TASK_TITLE", task.title.clone());
    vars.insert("TASK_DESCRIPTION", task.description.clone());
    vars.insert("PHASE", phase.id.clone());
    vars.insert("WEIGHT", task.weight.to_string());
    vars.insert("ITERATION", iteration.to_string());
    vars.insert(
        "RESEARCH_CONTENT",
        state.artifacts.get("research").cloned().unwrap_or_default(),
    );
    vars.insert(
        "SPEC_CONTENT",
        state.artifacts.get("spec").cloned().unwrap_or_default(),
    );
    vars.insert(
        "DESIGN_CONTENT",
        state.artifacts.get("design").cloned().unwrap_or_default(),
    );
    vars.insert("RETRY_CONTEXT", retry_context_section(state));
    vars.insert(
        "QA_OUTPUT_DIR",
        qa_output_dir.to_string_lossy().into_owned(),
    );
    vars
}

/// Render the active retry context as a prompt section, or empty.
fn retry_context_section(state: &ExecutionState) -> String {
    let Some(retry) = &state.retry else {
        return String::new();
    };
    format!(
        "## RETRY CONTEXT\n\nThis is retry attempt {} . Phase '{}' failed and execution \
         was restarted from '{}'.\n\nReason: {}\n\nPrevious failure output:\n{}\n",
        retry.attempt, retry.from_phase, retry.to_phase, retry.reason, retry.failure_output
    )
}
