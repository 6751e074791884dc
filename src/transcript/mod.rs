//! Transcript capture: line types, the persister interface, the bounded
//! buffer and the file-backed store.
//!
//! Everything the agent says (and is told) flows through here. The
//! [`TranscriptBuffer`] accepts lines and streaming chunks from the phase
//! executor and batches writes to a [`TranscriptSink`]; the sink assigns
//! sequence ids at write time so retrieval sorted by sequence id returns
//! lines in write order.

pub mod buffer;
pub mod store;

pub use buffer::TranscriptBuffer;
pub use store::FileTranscriptStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The full prompt sent to the agent for an iteration
    Prompt,
    /// The agent's terminal output for an iteration
    Response,
    /// A reassembled streaming fragment
    Chunk,
}

/// One immutable transcript record.
///
/// `seq` is 0 until the persister assigns it at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub task_id: String,
    pub phase: String,
    pub iteration: u32,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub seq: u64,
}

impl TranscriptLine {
    pub fn new(task_id: &str, phase: &str, iteration: u32, role: Role, content: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            iteration,
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            seq: 0,
        }
    }
}

/// Abstract transcript persister.
///
/// Implementations must be thread-safe: `add_batch` is called from
/// multiple tasks' buffers concurrently. Sequence ids are assigned inside
/// `add_batch`, strictly increasing per task.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn add_batch(&self, lines: Vec<TranscriptLine>) -> Result<()>;
    async fn get_transcripts(&self, task_id: &str) -> Result<Vec<TranscriptLine>>;
}
