//! Phase execution core for the orc workflow orchestrator.
//!
//! orc drives an external code-generation agent (a CLI child process)
//! through a sequence of named phases to complete a software task end to
//! end. The crate is organized around six cooperating components:
//!
//! - [`transcript`] — bounded buffering and durable persistence of the
//!   agent's prompt/response stream
//! - [`resolver`] — layered agent/skill/phase configuration resolution
//! - [`extract`] — typed artifact extraction from the agent's terminal
//!   JSON output
//! - [`executor`] — the single-phase iteration loop
//! - [`driver`] — the per-task orchestrator: gates, retries, worktrees,
//!   completion actions
//! - [`knowledge`] — durable learning capture into CLAUDE.md
//!
//! The agent itself, the git engine, the storage backend and the PR tool
//! are consumed through traits ([`agent::AgentClient`], [`vcs::Vcs`],
//! [`transcript::TranscriptSink`], [`driver::PrCreator`]).

pub mod agent;
pub mod config;
pub mod driver;
pub mod errors;
pub mod events;
pub mod executor;
pub mod extract;
pub mod gate;
pub mod knowledge;
pub mod plan;
pub mod resolver;
pub mod state;
pub mod task;
pub mod transcript;
pub mod vcs;
