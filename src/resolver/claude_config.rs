//! The effective per-invocation agent configuration and its merge rules.
//!
//! [`PhaseClaudeConfig`] is what the executor hands to the agent client:
//! system prompts, tool restrictions, MCP servers, limits, skills and
//! hooks. Configs come from several layers (plan defaults, per-phase
//! overrides, named agents, skills) and are combined with [`merge`].
//!
//! Merge semantics, in one line each:
//! - scalars: non-empty override replaces base;
//! - lists: non-empty override replaces base wholesale;
//! - maps: merged per key, override wins;
//! - `skill_refs`: appended;
//! - `hooks`: per event, base matchers first, override matchers appended;
//! - `strict_mcp_config`: true if either side is true;
//! - numeric limits: override wins when > 0.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One MCP server definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct McpServer {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// An agent defined inline on a config rather than in the settings file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InlineAgent {
    pub description: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The kind of a hook entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    /// Shell command receiving JSON on stdin
    #[default]
    Command,
    /// Agent-evaluated prompt
    Prompt,
}

/// A single hook entry inside a matcher block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HookEntry {
    #[serde(rename = "type", default)]
    pub kind: HookKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Run at most once per task
    #[serde(default)]
    pub once: bool,
}

/// A matcher block: which tool/event instances the entries apply to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HookMatcher {
    #[serde(default)]
    pub matcher: String,
    #[serde(default)]
    pub hooks: Vec<HookEntry>,
}

/// Effective agent configuration for one phase invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseClaudeConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub system_prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub append_system_prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub system_prompt_file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub append_system_prompt_file: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    /// Full tool list; `Some(vec![])` means disallow all tools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub mcp_servers: HashMap<String, McpServer>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub strict_mcp_config: bool,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub max_budget_usd: f64,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_turns: u32,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_dirs: Vec<String>,
    /// Skill names to load and inject into the appended system prompt
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skill_refs: Vec<String>,
    /// Named agent to inherit defaults from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub inline_agents: HashMap<String, InlineAgent>,
    /// Event name → ordered matcher blocks
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub hooks: HashMap<String, Vec<HookMatcher>>,
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

impl PhaseClaudeConfig {
    /// Parse a config from its JSON representation.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON. `from_json(c.to_json())` round-trips.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Merge two optional configs, override-biased.
///
/// `merge(a, None)` clones `a`; `merge(None, b)` clones `b`.
pub fn merge(
    base: Option<&PhaseClaudeConfig>,
    overlay: Option<&PhaseClaudeConfig>,
) -> PhaseClaudeConfig {
    match (base, overlay) {
        (None, None) => PhaseClaudeConfig::default(),
        (Some(base), None) => base.clone(),
        (None, Some(overlay)) => overlay.clone(),
        (Some(base), Some(overlay)) => {
            let mut merged = base.clone();

            merge_scalar(&mut merged.system_prompt, &overlay.system_prompt);
            merge_scalar(&mut merged.append_system_prompt, &overlay.append_system_prompt);
            merge_scalar(&mut merged.system_prompt_file, &overlay.system_prompt_file);
            merge_scalar(
                &mut merged.append_system_prompt_file,
                &overlay.append_system_prompt_file,
            );

            merge_list(&mut merged.allowed_tools, &overlay.allowed_tools);
            merge_list(&mut merged.disallowed_tools, &overlay.disallowed_tools);
            merge_list(&mut merged.add_dirs, &overlay.add_dirs);
            // `tools` keeps its Option: Some(vec![]) is a meaningful
            // "disallow everything" and must replace the base.
            if overlay.tools.is_some() {
                merged.tools = overlay.tools.clone();
            }

            for (key, server) in &overlay.mcp_servers {
                merged.mcp_servers.insert(key.clone(), server.clone());
            }
            for (key, value) in &overlay.env {
                merged.env.insert(key.clone(), value.clone());
            }
            for (key, agent) in &overlay.inline_agents {
                merged.inline_agents.insert(key.clone(), agent.clone());
            }

            merged.skill_refs.extend(overlay.skill_refs.iter().cloned());

            for (event, matchers) in &overlay.hooks {
                merged
                    .hooks
                    .entry(event.clone())
                    .or_default()
                    .extend(matchers.iter().cloned());
            }

            merged.strict_mcp_config = base.strict_mcp_config || overlay.strict_mcp_config;
            if overlay.max_budget_usd > 0.0 {
                merged.max_budget_usd = overlay.max_budget_usd;
            }
            if overlay.max_turns > 0 {
                merged.max_turns = overlay.max_turns;
            }

            if overlay.agent_ref.is_some() {
                merged.agent_ref = overlay.agent_ref.clone();
            }

            merged
        }
    }
}

fn merge_scalar(base: &mut String, overlay: &str) {
    if !overlay.is_empty() {
        *base = overlay.to_string();
    }
}

fn merge_list(base: &mut Vec<String>, overlay: &[String]) {
    if !overlay.is_empty() {
        *base = overlay.to_vec();
    }
}

/// De-duplicate preserving first-seen order.
pub fn dedup_refs(refs: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    refs.iter()
        .filter(|r| seen.insert(r.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(f: impl FnOnce(&mut PhaseClaudeConfig)) -> PhaseClaudeConfig {
        let mut config = PhaseClaudeConfig::default();
        f(&mut config);
        config
    }

    // =========================================
    // Merge identity
    // =========================================

    #[test]
    fn test_merge_with_none_is_identity() {
        let a = config_with(|c| {
            c.system_prompt = "base".into();
            c.max_turns = 5;
        });

        assert_eq!(merge(Some(&a), None), a);
        assert_eq!(merge(None, Some(&a)), a);
        assert_eq!(merge(None, None), PhaseClaudeConfig::default());
    }

    // =========================================
    // Scalar and list semantics
    // =========================================

    #[test]
    fn test_merge_scalar_right_bias() {
        let base = config_with(|c| c.system_prompt = "base".into());
        let overlay = config_with(|c| c.system_prompt = "override".into());

        let merged = merge(Some(&base), Some(&overlay));
        assert_eq!(merged.system_prompt, "override");

        // Empty override leaves base untouched
        let empty = PhaseClaudeConfig::default();
        let merged = merge(Some(&base), Some(&empty));
        assert_eq!(merged.system_prompt, "base");
    }

    #[test]
    fn test_merge_list_replaced_wholesale() {
        let base = config_with(|c| {
            c.allowed_tools = vec!["Read".into(), "Write".into()];
        });
        let overlay = config_with(|c| {
            c.allowed_tools = vec!["Bash".into()];
        });

        let merged = merge(Some(&base), Some(&overlay));
        assert_eq!(merged.allowed_tools, vec!["Bash"]);

        // Empty override list preserves base
        let empty = PhaseClaudeConfig::default();
        let merged = merge(Some(&base), Some(&empty));
        assert_eq!(merged.allowed_tools, vec!["Read", "Write"]);
    }

    #[test]
    fn test_merge_tools_some_empty_means_disallow_all() {
        let base = config_with(|c| c.tools = Some(vec!["Read".into()]));
        let overlay = config_with(|c| c.tools = Some(vec![]));

        let merged = merge(Some(&base), Some(&overlay));
        assert_eq!(merged.tools, Some(vec![]));

        // Absent override keeps base
        let merged = merge(Some(&base), Some(&PhaseClaudeConfig::default()));
        assert_eq!(merged.tools, Some(vec!["Read".to_string()]));
    }

    // =========================================
    // Map, skill and hook semantics
    // =========================================

    #[test]
    fn test_merge_maps_per_key() {
        let base = config_with(|c| {
            c.env.insert("A".into(), "1".into());
            c.env.insert("B".into(), "2".into());
        });
        let overlay = config_with(|c| {
            c.env.insert("B".into(), "override".into());
            c.env.insert("C".into(), "3".into());
        });

        let merged = merge(Some(&base), Some(&overlay));
        assert_eq!(merged.env.get("A").unwrap(), "1");
        assert_eq!(merged.env.get("B").unwrap(), "override");
        assert_eq!(merged.env.get("C").unwrap(), "3");
    }

    #[test]
    fn test_merge_mcp_servers_override_wins_per_key() {
        let base = config_with(|c| {
            c.mcp_servers.insert(
                "playwright".into(),
                McpServer {
                    command: "npx".into(),
                    args: vec!["playwright-mcp".into()],
                    env: HashMap::new(),
                },
            );
        });
        let overlay = config_with(|c| {
            c.mcp_servers.insert(
                "playwright".into(),
                McpServer {
                    command: "bunx".into(),
                    args: vec![],
                    env: HashMap::new(),
                },
            );
        });

        let merged = merge(Some(&base), Some(&overlay));
        assert_eq!(merged.mcp_servers["playwright"].command, "bunx");
    }

    #[test]
    fn test_merge_skill_refs_appended() {
        let base = config_with(|c| c.skill_refs = vec!["python-style".into()]);
        let overlay = config_with(|c| c.skill_refs = vec!["testing".into()]);

        let merged = merge(Some(&base), Some(&overlay));
        assert_eq!(merged.skill_refs, vec!["python-style", "testing"]);
    }

    #[test]
    fn test_merge_hooks_appended_per_event() {
        let base = config_with(|c| {
            c.hooks.insert(
                "PreToolUse".into(),
                vec![HookMatcher {
                    matcher: "Bash".into(),
                    hooks: vec![HookEntry::default()],
                }],
            );
        });
        let overlay = config_with(|c| {
            c.hooks.insert(
                "PreToolUse".into(),
                vec![HookMatcher {
                    matcher: "Write".into(),
                    hooks: vec![HookEntry::default()],
                }],
            );
            c.hooks.insert(
                "PostToolUse".into(),
                vec![HookMatcher::default()],
            );
        });

        let merged = merge(Some(&base), Some(&overlay));
        let pre = &merged.hooks["PreToolUse"];
        assert_eq!(pre.len(), 2);
        assert_eq!(pre[0].matcher, "Bash");
        assert_eq!(pre[1].matcher, "Write");
        assert_eq!(merged.hooks["PostToolUse"].len(), 1);
    }

    // =========================================
    // Flags and limits
    // =========================================

    #[test]
    fn test_merge_strict_mcp_is_or() {
        let strict = config_with(|c| c.strict_mcp_config = true);
        let lax = PhaseClaudeConfig::default();

        assert!(merge(Some(&strict), Some(&lax)).strict_mcp_config);
        assert!(merge(Some(&lax), Some(&strict)).strict_mcp_config);
        assert!(!merge(Some(&lax), Some(&lax)).strict_mcp_config);
    }

    #[test]
    fn test_merge_numeric_limits_override_when_positive() {
        let base = config_with(|c| {
            c.max_turns = 10;
            c.max_budget_usd = 2.5;
        });
        let overlay = config_with(|c| c.max_turns = 20);

        let merged = merge(Some(&base), Some(&overlay));
        assert_eq!(merged.max_turns, 20);
        // Zero override does not clobber
        assert_eq!(merged.max_budget_usd, 2.5);
    }

    // =========================================
    // JSON round-trip
    // =========================================

    #[test]
    fn test_json_round_trip() {
        let mut config = config_with(|c| {
            c.system_prompt = "You are a reviewer.".into();
            c.append_system_prompt = "Be brief.".into();
            c.allowed_tools = vec!["Read".into(), "Grep".into()];
            c.tools = Some(vec![]);
            c.strict_mcp_config = true;
            c.max_budget_usd = 1.5;
            c.max_turns = 40;
            c.add_dirs = vec!["/tmp/extra".into()];
            c.skill_refs = vec!["python-style".into()];
            c.agent_ref = Some("reviewer".into());
        });
        config.mcp_servers.insert(
            "playwright".into(),
            McpServer {
                command: "npx".into(),
                args: vec!["@playwright/mcp".into()],
                env: HashMap::from([("HEADLESS".into(), "1".into())]),
            },
        );
        config.inline_agents.insert(
            "fixer".into(),
            InlineAgent {
                description: "Fixes lint".into(),
                prompt: "Fix lint errors.".into(),
                tools: Some(vec!["Bash".into()]),
                model: None,
            },
        );
        config.hooks.insert(
            "PreToolUse".into(),
            vec![HookMatcher {
                matcher: "Bash".into(),
                hooks: vec![HookEntry {
                    kind: HookKind::Command,
                    command: Some("./check.sh".into()),
                    prompt: None,
                    timeout: Some(30),
                    once: true,
                }],
            }],
        );

        let json = config.to_json().unwrap();
        let parsed = PhaseClaudeConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_default_serializes_to_empty_object() {
        let json = PhaseClaudeConfig::default().to_json().unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_dedup_refs_preserves_first_seen_order() {
        let refs = vec![
            "python-style".to_string(),
            "testing".to_string(),
            "python-style".to_string(),
        ];
        assert_eq!(dedup_refs(&refs), vec!["python-style", "testing"]);
    }
}
