//! Named agents from the project settings file.
//!
//! Agents live at `<projectRoot>/.claude/settings.json` under
//! `extensions.agents`. An agent is a reusable profile of prompt, tool
//! permissions and skill refs; a phase config points at one via
//! `agent_ref` and inherits its defaults.
//!
//! Agent merge rules (the base config always wins where it speaks):
//! - `system_prompt`: agent provides it only if the base is empty;
//! - `allowed_tools` / `disallowed_tools`: agent provides only if the base
//!   list is empty (replacement, never union);
//! - `skill_refs`: additive union, de-duplicated preserving first-seen
//!   order (base refs first).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::claude_config::{PhaseClaudeConfig, dedup_refs};
use crate::errors::ResolveError;

/// Allow/deny tool permission lists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolPermissions {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// A named agent profile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolPermissions>,
    #[serde(default)]
    pub skill_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Extensions {
    #[serde(default)]
    pub agents: Vec<AgentDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_permissions: Option<ToolPermissions>,
}

/// The parsed `.claude/settings.json` document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProjectSettings {
    #[serde(default)]
    pub extensions: Extensions,
}

impl ProjectSettings {
    pub fn settings_path(project_root: &Path) -> PathBuf {
        project_root.join(".claude").join("settings.json")
    }

    /// Load settings from `<projectRoot>/.claude/settings.json`.
    /// A missing file yields empty settings; a corrupt one is an error.
    pub fn load(project_root: &Path) -> Result<Self, ResolveError> {
        let path = Self::settings_path(project_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(&path).map_err(|source| ResolveError::SettingsUnreadable {
                path: path.clone(),
                source,
            })?;
        serde_json::from_str(&content)
            .map_err(|source| ResolveError::SettingsInvalid { path, source })
    }

    pub fn find_agent(&self, name: &str) -> Option<&AgentDef> {
        self.extensions.agents.iter().find(|a| a.name == name)
    }
}

/// Apply a named agent's defaults to a config, in place.
pub fn apply_agent(config: &mut PhaseClaudeConfig, agent: &AgentDef) {
    if config.system_prompt.is_empty() && !agent.prompt.is_empty() {
        config.system_prompt = agent.prompt.clone();
    }

    if let Some(tools) = &agent.tools {
        if config.allowed_tools.is_empty() && !tools.allow.is_empty() {
            config.allowed_tools = tools.allow.clone();
        }
        if config.disallowed_tools.is_empty() && !tools.deny.is_empty() {
            config.disallowed_tools = tools.deny.clone();
        }
    }

    if !agent.skill_refs.is_empty() {
        let mut combined = config.skill_refs.clone();
        combined.extend(agent.skill_refs.iter().cloned());
        config.skill_refs = dedup_refs(&combined);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sample_settings_json() -> &'static str {
        r#"{
            "extensions": {
                "agents": [
                    {
                        "name": "reviewer",
                        "description": "Code review agent",
                        "prompt": "You review code carefully.",
                        "tools": {"allow": ["Read", "Grep"], "deny": ["Write"]},
                        "skill_refs": ["review-checklist"]
                    }
                ],
                "tool_permissions": {"allow": ["Read"], "deny": []}
            }
        }"#
    }

    #[test]
    fn test_load_settings() {
        let dir = tempdir().unwrap();
        let claude_dir = dir.path().join(".claude");
        fs::create_dir_all(&claude_dir).unwrap();
        fs::write(claude_dir.join("settings.json"), sample_settings_json()).unwrap();

        let settings = ProjectSettings::load(dir.path()).unwrap();
        let agent = settings.find_agent("reviewer").unwrap();
        assert_eq!(agent.prompt, "You review code carefully.");
        assert_eq!(agent.tools.as_ref().unwrap().allow, vec!["Read", "Grep"]);
        assert_eq!(agent.skill_refs, vec!["review-checklist"]);
        assert!(settings.extensions.tool_permissions.is_some());
    }

    #[test]
    fn test_load_missing_settings_is_empty() {
        let dir = tempdir().unwrap();
        let settings = ProjectSettings::load(dir.path()).unwrap();
        assert!(settings.extensions.agents.is_empty());
    }

    #[test]
    fn test_load_corrupt_settings_is_error() {
        let dir = tempdir().unwrap();
        let claude_dir = dir.path().join(".claude");
        fs::create_dir_all(&claude_dir).unwrap();
        fs::write(claude_dir.join("settings.json"), "{ nope").unwrap();

        let result = ProjectSettings::load(dir.path());
        assert!(matches!(result, Err(ResolveError::SettingsInvalid { .. })));
    }

    #[test]
    fn test_apply_agent_base_prompt_wins() {
        let agent = AgentDef {
            name: "reviewer".into(),
            prompt: "A".into(),
            ..Default::default()
        };

        let mut config = PhaseClaudeConfig {
            system_prompt: "B".into(),
            ..Default::default()
        };
        apply_agent(&mut config, &agent);
        assert_eq!(config.system_prompt, "B");

        let mut empty = PhaseClaudeConfig::default();
        apply_agent(&mut empty, &agent);
        assert_eq!(empty.system_prompt, "A");
    }

    #[test]
    fn test_apply_agent_tools_fill_empty_lists_only() {
        let agent = AgentDef {
            name: "reviewer".into(),
            tools: Some(ToolPermissions {
                allow: vec!["Read".into()],
                deny: vec![],
            }),
            ..Default::default()
        };

        let mut config = PhaseClaudeConfig {
            disallowed_tools: vec!["Write".into()],
            ..Default::default()
        };
        apply_agent(&mut config, &agent);

        // Agent fills the empty allow list; the base deny list is preserved
        assert_eq!(config.allowed_tools, vec!["Read"]);
        assert_eq!(config.disallowed_tools, vec!["Write"]);
    }

    #[test]
    fn test_apply_agent_skill_refs_union_dedup() {
        let agent = AgentDef {
            name: "reviewer".into(),
            skill_refs: vec!["python-style".into(), "testing".into()],
            ..Default::default()
        };

        let mut config = PhaseClaudeConfig {
            skill_refs: vec!["python-style".into()],
            ..Default::default()
        };
        apply_agent(&mut config, &agent);

        assert_eq!(config.skill_refs, vec!["python-style", "testing"]);
    }
}
