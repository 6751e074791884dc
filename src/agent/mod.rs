//! Agent invocation.
//!
//! [`AgentClient`] is the seam between the phase executor and the external
//! code-generation agent. The default implementation,
//! [`ClaudeCliClient`], spawns the agent CLI as a child process, feeds the
//! prompt on stdin, and consumes the stream-json event stream from stdout,
//! forwarding text fragments into the task's transcript buffer as chunks.

pub mod session;
pub mod stream;

pub use session::SessionManager;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::PhaseError;
use crate::resolver::PhaseClaudeConfig;
use crate::transcript::TranscriptBuffer;
use stream::{ContentBlock, StreamEvent};

/// Where streamed text fragments go while the agent runs.
pub struct StreamTarget {
    pub buffer: Arc<TranscriptBuffer>,
    pub phase: String,
    pub iteration: u32,
}

/// Result of one agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    /// The agent's terminal output (the result field, or accumulated text)
    pub output: String,
    /// Session id reported by the agent, for `--resume`
    pub session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// The agent reported its own run as an error
    pub is_error: bool,
}

/// Abstract agent invoker consumed by the phase executor.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn invoke(
        &self,
        prompt: &str,
        config: &PhaseClaudeConfig,
        resume: Option<&str>,
        stream: Option<&StreamTarget>,
    ) -> Result<AgentOutcome, PhaseError>;
}

/// Spawns the agent CLI as a child process bound to one working directory.
pub struct ClaudeCliClient {
    command: String,
    work_dir: PathBuf,
}

impl ClaudeCliClient {
    pub fn new(command: &str, work_dir: &Path) -> Self {
        Self {
            command: command.to_string(),
            work_dir: work_dir.to_path_buf(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Build CLI flags from the effective config. Returns the flags and
    /// the temporary MCP config file (if any) so the caller can clean up.
    fn build_args(
        &self,
        config: &PhaseClaudeConfig,
        resume: Option<&str>,
    ) -> anyhow::Result<(Vec<String>, Option<PathBuf>)> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        let system_prompt = non_empty_or_file(&config.system_prompt, &config.system_prompt_file)?;
        if let Some(prompt) = system_prompt {
            args.push("--system-prompt".to_string());
            args.push(prompt);
        }
        let append = non_empty_or_file(
            &config.append_system_prompt,
            &config.append_system_prompt_file,
        )?;
        if let Some(prompt) = append {
            args.push("--append-system-prompt".to_string());
            args.push(prompt);
        }

        if let Some(tools) = &config.tools {
            // An explicit empty list disallows every tool
            args.push("--tools".to_string());
            args.push(tools.join(","));
        } else {
            if !config.allowed_tools.is_empty() {
                args.push("--allowed-tools".to_string());
                args.push(config.allowed_tools.join(","));
            }
            if !config.disallowed_tools.is_empty() {
                args.push("--disallowed-tools".to_string());
                args.push(config.disallowed_tools.join(","));
            }
        }

        let mut mcp_file = None;
        if !config.mcp_servers.is_empty() {
            let path = std::env::temp_dir().join(format!("orc-mcp-{}.json", uuid::Uuid::new_v4()));
            let doc = serde_json::json!({ "mcpServers": config.mcp_servers });
            std::fs::write(&path, serde_json::to_string_pretty(&doc)?)
                .with_context(|| format!("Failed to write MCP config: {}", path.display()))?;
            args.push("--mcp-config".to_string());
            args.push(path.to_string_lossy().into_owned());
            mcp_file = Some(path);
        }
        if config.strict_mcp_config {
            args.push("--strict-mcp-config".to_string());
        }

        if config.max_turns > 0 {
            args.push("--max-turns".to_string());
            args.push(config.max_turns.to_string());
        }
        if config.max_budget_usd > 0.0 {
            args.push("--max-budget-usd".to_string());
            args.push(config.max_budget_usd.to_string());
        }

        for dir in &config.add_dirs {
            args.push("--add-dir".to_string());
            args.push(dir.clone());
        }

        if !config.inline_agents.is_empty() {
            args.push("--agents".to_string());
            args.push(serde_json::to_string(&config.inline_agents)?);
        }

        if let Some(session_id) = resume {
            args.push("--resume".to_string());
            args.push(session_id.to_string());
        }

        Ok((args, mcp_file))
    }
}

/// Prefer the inline value; fall back to reading the file variant.
fn non_empty_or_file(inline: &str, file: &str) -> anyhow::Result<Option<String>> {
    if !inline.is_empty() {
        return Ok(Some(inline.to_string()));
    }
    if !file.is_empty() {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read prompt file: {}", file))?;
        return Ok(Some(content));
    }
    Ok(None)
}

#[async_trait]
impl AgentClient for ClaudeCliClient {
    async fn invoke(
        &self,
        prompt: &str,
        config: &PhaseClaudeConfig,
        resume: Option<&str>,
        stream: Option<&StreamTarget>,
    ) -> Result<AgentOutcome, PhaseError> {
        let (args, mcp_file) = self
            .build_args(config, resume)
            .map_err(PhaseError::Infra)?;

        debug!(command = %self.command, args = ?args, "spawning agent");

        let mut cmd = Command::new(&self.command);
        cmd.args(&args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .current_dir(&self.work_dir)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PhaseError::AgentInvocation {
            message: format!("failed to spawn '{}': {}", self.command, e),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| PhaseError::AgentInvocation {
                    message: format!("failed to write prompt: {}", e),
                })?;
            stdin.shutdown().await.ok();
        }

        let stdout = child.stdout.take().ok_or_else(|| PhaseError::AgentInvocation {
            message: "failed to capture agent stdout".to_string(),
        })?;
        let mut reader = BufReader::new(stdout).lines();

        let mut accumulated = String::new();
        let mut outcome = AgentOutcome::default();
        let mut final_result: Option<String> = None;

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| PhaseError::AgentInvocation {
                message: format!("failed to read agent output: {}", e),
            })?
        {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::Assistant { message, session_id }) => {
                    if !session_id.is_empty() {
                        outcome.session_id = Some(session_id);
                    }
                    for block in message.content {
                        if let ContentBlock::Text { text } = block {
                            if let Some(target) = stream {
                                target
                                    .buffer
                                    .add_chunk(&target.phase, target.iteration, &text)
                                    .await;
                            }
                            accumulated.push_str(&text);
                            accumulated.push('\n');
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    result,
                    is_error,
                    usage,
                    session_id,
                    ..
                }) => {
                    final_result = result;
                    outcome.is_error = is_error;
                    if !session_id.is_empty() {
                        outcome.session_id = Some(session_id);
                    }
                    if let Some(usage) = usage {
                        outcome.input_tokens = usage.input_tokens;
                        outcome.output_tokens = usage.output_tokens;
                    }
                }
                Ok(StreamEvent::User {} | StreamEvent::System { .. }) => {}
                Err(_) => {
                    // Not stream-json; keep raw output
                    accumulated.push_str(&line);
                    accumulated.push('\n');
                }
            }
        }

        let status = child.wait().await.map_err(|e| PhaseError::AgentInvocation {
            message: format!("failed to wait for agent: {}", e),
        })?;

        if let Some(target) = stream {
            target.buffer.flush_chunks(&target.phase, target.iteration).await;
        }
        if let Some(path) = mcp_file
            && let Err(e) = std::fs::remove_file(&path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove temp MCP config");
        }

        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            return Err(PhaseError::AgentInvocation {
                message: format!("agent exited with code {}", exit_code),
            });
        }

        outcome.output = final_result.unwrap_or(accumulated);
        Ok(outcome)
    }
}
