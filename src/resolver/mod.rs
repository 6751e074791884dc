//! Layered configuration resolution.
//!
//! The resolver combines, in precedence order, a base config, a per-phase
//! override, a named agent's defaults and skill injections into one
//! effective [`PhaseClaudeConfig`] for the invocation. It is stateless:
//! every call reads the settings and skill files fresh and returns a new
//! config, so a settings edit between phases takes effect immediately.

pub mod agents;
pub mod claude_config;
pub mod mcp;
pub mod skills;

pub use agents::{AgentDef, ProjectSettings, ToolPermissions};
pub use claude_config::{
    HookEntry, HookKind, HookMatcher, InlineAgent, McpServer, PhaseClaudeConfig, merge,
};
pub use mcp::{McpRuntimeOptions, cleanup_task_dirs, enrich_mcp_servers};
pub use skills::{Skill, load_skill, split_frontmatter};

use std::path::{Path, PathBuf};

use crate::errors::ResolveError;

/// Stateless resolver bound to a project root and a Claude config
/// directory (the parent of `skills/`).
pub struct ConfigResolver {
    project_root: PathBuf,
    claude_dir: PathBuf,
}

impl ConfigResolver {
    pub fn new(project_root: &Path, claude_dir: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            claude_dir: claude_dir.to_path_buf(),
        }
    }

    /// Resolver whose Claude directory is the conventional
    /// `<projectRoot>/.claude`.
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root, &project_root.join(".claude"))
    }

    /// Produce the effective config for one phase invocation.
    ///
    /// Order: merge base with the phase override, then pull in the named
    /// agent's defaults (if `agent_ref` is set), then load and inject the
    /// referenced skills. A dangling agent ref or skill ref is a hard
    /// error surfaced to the driver.
    pub fn resolve(
        &self,
        base: Option<&PhaseClaudeConfig>,
        phase_override: Option<&PhaseClaudeConfig>,
    ) -> Result<PhaseClaudeConfig, ResolveError> {
        let mut config = merge(base, phase_override);

        if let Some(agent_name) = config.agent_ref.clone() {
            let settings = ProjectSettings::load(&self.project_root)?;
            let agent = settings
                .find_agent(&agent_name)
                .ok_or(ResolveError::AgentNotFound { name: agent_name })?;
            agents::apply_agent(&mut config, agent);
        }

        skills::apply_skills(&mut config, &self.claude_dir)?;

        Ok(config)
    }

    /// Apply per-task runtime enrichment (MCP servers that need task-scoped
    /// arguments). Called at invocation time, after [`Self::resolve`].
    pub fn enrich_for_task(
        &self,
        config: &mut PhaseClaudeConfig,
        task_id: &str,
        opts: &McpRuntimeOptions,
    ) {
        enrich_mcp_servers(&mut config.mcp_servers, task_id, opts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_project(dir: &Path) {
        let claude_dir = dir.join(".claude");
        fs::create_dir_all(&claude_dir).unwrap();
        fs::write(
            claude_dir.join("settings.json"),
            r#"{
                "extensions": {
                    "agents": [
                        {
                            "name": "reviewer",
                            "prompt": "A",
                            "tools": {"allow": ["Read"], "deny": []},
                            "skill_refs": ["python-style", "testing"]
                        }
                    ]
                }
            }"#,
        )
        .unwrap();

        for skill in ["python-style", "testing"] {
            let skill_dir = claude_dir.join("skills").join(skill);
            fs::create_dir_all(&skill_dir).unwrap();
            fs::write(
                skill_dir.join("SKILL.md"),
                format!("---\nname: {skill}\n---\nGuidance for {skill}."),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_resolve_agent_precedence() {
        let dir = tempdir().unwrap();
        setup_project(dir.path());
        let resolver = ConfigResolver::for_project(dir.path());

        let base = PhaseClaudeConfig {
            system_prompt: "B".into(),
            disallowed_tools: vec!["Write".into()],
            agent_ref: Some("reviewer".into()),
            ..Default::default()
        };

        let resolved = resolver.resolve(Some(&base), None).unwrap();
        // Base prompt wins over the agent's
        assert_eq!(resolved.system_prompt, "B");
        // Agent fills the empty allow list; base deny list preserved
        assert_eq!(resolved.allowed_tools, vec!["Read"]);
        assert_eq!(resolved.disallowed_tools, vec!["Write"]);
    }

    #[test]
    fn test_resolve_skill_dedup_and_injection() {
        let dir = tempdir().unwrap();
        setup_project(dir.path());
        let resolver = ConfigResolver::for_project(dir.path());

        let base = PhaseClaudeConfig {
            skill_refs: vec!["python-style".into()],
            agent_ref: Some("reviewer".into()),
            ..Default::default()
        };

        let resolved = resolver.resolve(Some(&base), None).unwrap();
        // Union of base and agent refs, first-seen order
        assert_eq!(resolved.skill_refs, vec!["python-style", "testing"]);
        // Each skill body injected exactly once
        assert_eq!(
            resolved.append_system_prompt,
            "Guidance for python-style.\n\nGuidance for testing."
        );
    }

    #[test]
    fn test_resolve_unknown_agent_is_error() {
        let dir = tempdir().unwrap();
        setup_project(dir.path());
        let resolver = ConfigResolver::for_project(dir.path());

        let base = PhaseClaudeConfig {
            agent_ref: Some("ghost".into()),
            ..Default::default()
        };
        let result = resolver.resolve(Some(&base), None);
        assert!(matches!(result, Err(ResolveError::AgentNotFound { .. })));
    }

    #[test]
    fn test_resolve_missing_skill_is_error() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".claude")).unwrap();
        let resolver = ConfigResolver::for_project(dir.path());

        let base = PhaseClaudeConfig {
            skill_refs: vec!["ghost".into()],
            ..Default::default()
        };
        let result = resolver.resolve(Some(&base), None);
        assert!(matches!(result, Err(ResolveError::SkillMissing { .. })));
    }

    #[test]
    fn test_resolve_merges_phase_override_first() {
        let dir = tempdir().unwrap();
        setup_project(dir.path());
        let resolver = ConfigResolver::for_project(dir.path());

        let base = PhaseClaudeConfig {
            max_turns: 10,
            ..Default::default()
        };
        let phase_override = PhaseClaudeConfig {
            max_turns: 30,
            ..Default::default()
        };

        let resolved = resolver
            .resolve(Some(&base), Some(&phase_override))
            .unwrap();
        assert_eq!(resolved.max_turns, 30);
    }

    #[test]
    fn test_enrich_for_task_touches_playwright() {
        let dir = tempdir().unwrap();
        let resolver = ConfigResolver::for_project(dir.path());

        let mut config = PhaseClaudeConfig::default();
        config.mcp_servers.insert(
            "playwright".into(),
            McpServer {
                command: "npx".into(),
                args: vec![],
                env: Default::default(),
            },
        );
        resolver.enrich_for_task(&mut config, "T-001", &McpRuntimeOptions::default());
        assert!(
            config.mcp_servers["playwright"]
                .args
                .iter()
                .any(|a| a == "--user-data-dir")
        );
    }
}
