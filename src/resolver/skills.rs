//! Skill loading and injection.
//!
//! Skills are markdown snippets stored at `<claudeDir>/skills/<name>/SKILL.md`
//! with optional YAML frontmatter between `---` fences. The body of each
//! referenced skill is appended to the effective `append_system_prompt`,
//! separated by a blank line. A missing skill is a hard error: a phase that
//! names a skill depends on its guidance.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::claude_config::{PhaseClaudeConfig, dedup_refs};
use crate::errors::ResolveError;

pub const SKILLS_DIR: &str = "skills";
pub const SKILL_FILE: &str = "SKILL.md";

/// Frontmatter metadata of a skill file.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SkillMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A loaded skill.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub meta: SkillMeta,
    pub body: String,
}

/// Split YAML frontmatter (between leading `---` fences) from the body.
/// Content without a frontmatter block is returned whole as the body.
pub fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (None, content);
    };
    let Some(end) = rest.find("\n---") else {
        return (None, content);
    };
    let frontmatter = rest[..end].trim_start_matches('\n');
    let body = rest[end + 4..].trim_start_matches('\n');
    (Some(frontmatter), body)
}

fn skill_path(claude_dir: &Path, name: &str) -> PathBuf {
    claude_dir.join(SKILLS_DIR).join(name).join(SKILL_FILE)
}

/// Load one skill by name from the skills directory.
pub fn load_skill(claude_dir: &Path, name: &str) -> Result<Skill, ResolveError> {
    let path = skill_path(claude_dir, name);
    if !path.exists() {
        return Err(ResolveError::SkillMissing {
            name: name.to_string(),
            path,
        });
    }
    let content = std::fs::read_to_string(&path).map_err(|source| ResolveError::SkillUnreadable {
        name: name.to_string(),
        source,
    })?;

    let (frontmatter, body) = split_frontmatter(&content);
    let meta = frontmatter
        .and_then(|f| serde_yaml::from_str(f).ok())
        .unwrap_or_default();

    Ok(Skill {
        name: name.to_string(),
        meta,
        body: body.trim_end().to_string(),
    })
}

/// Load every referenced skill and append the bodies to
/// `append_system_prompt`, blank-line separated. References are
/// de-duplicated first so a skill is injected at most once.
pub fn apply_skills(config: &mut PhaseClaudeConfig, claude_dir: &Path) -> Result<(), ResolveError> {
    for name in dedup_refs(&config.skill_refs) {
        let skill = load_skill(claude_dir, &name)?;
        if skill.body.is_empty() {
            continue;
        }
        if !config.append_system_prompt.is_empty() {
            config.append_system_prompt.push_str("\n\n");
        }
        config.append_system_prompt.push_str(&skill.body);
    }
    Ok(())
}
