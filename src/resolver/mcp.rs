//! MCP runtime enrichment.
//!
//! Some MCP servers need per-task runtime arguments that cannot live in
//! static configuration. Today that is the `playwright` server: each task
//! gets an isolated browser profile under `/tmp/playwright-<taskID>` so
//! parallel tasks never share browser state. The directory is removed at
//! task end.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use super::claude_config::McpServer;

/// Server name that receives runtime enrichment.
const PLAYWRIGHT: &str = "playwright";

const CHROMIUM_ARGS_ENV: &str = "PLAYWRIGHT_CHROMIUM_ARGS";
const CHROMIUM_ARGS_DEFAULT: &str = "--disable-gpu-video-decode";

/// Default browser; `--browser` is only passed for a different one.
const DEFAULT_BROWSER: &str = "chromium";

/// Runtime options for browser-backed MCP servers.
#[derive(Debug, Clone)]
pub struct McpRuntimeOptions {
    pub headless: bool,
    pub browser: Option<String>,
}

impl Default for McpRuntimeOptions {
    fn default() -> Self {
        Self {
            headless: true,
            browser: None,
        }
    }
}

/// The per-task browser profile directory.
pub fn playwright_user_data_dir(task_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("playwright-{}", task_id))
}

/// Enrich MCP server definitions with per-task runtime arguments, in place.
pub fn enrich_mcp_servers(
    servers: &mut HashMap<String, McpServer>,
    task_id: &str,
    opts: &McpRuntimeOptions,
) {
    let Some(server) = servers.get_mut(PLAYWRIGHT) else {
        return;
    };

    if !server.args.iter().any(|a| a == "--user-data-dir") {
        server.args.push("--user-data-dir".to_string());
        server
            .args
            .push(playwright_user_data_dir(task_id).to_string_lossy().into_owned());
    }

    if opts.headless && !server.args.iter().any(|a| a == "--headless") {
        server.args.push("--headless".to_string());
    }

    if let Some(browser) = &opts.browser
        && browser != DEFAULT_BROWSER
        && !server.args.iter().any(|a| a == "--browser")
    {
        server.args.push("--browser".to_string());
        server.args.push(browser.clone());
    }

    server
        .env
        .entry(CHROMIUM_ARGS_ENV.to_string())
        .or_insert_with(|| CHROMIUM_ARGS_DEFAULT.to_string());
}

/// Remove the per-task browser profile directory. Missing directory is fine.
pub fn cleanup_task_dirs(task_id: &str) {
    let dir = playwright_user_data_dir(task_id);
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            debug!(dir = %dir.display(), error = %e, "failed to remove playwright profile dir");
        }
    }
}
