//! Task lifecycle events.
//!
//! Publishing is fire-and-forget: the core never blocks on, or fails
//! because of, event delivery. Transports (WebSocket, UI, metrics) live
//! behind the [`EventPublisher`] trait outside this crate; the built-in
//! implementations log or drop events.

use serde::Serialize;
use tracing::info;

/// Events emitted by the driver and executors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    PhaseStarted {
        task_id: String,
        phase: String,
    },
    PhaseCompleted {
        task_id: String,
        phase: String,
        iterations: u32,
    },
    PhaseFailed {
        task_id: String,
        phase: String,
        reason: String,
    },
    TokenUsage {
        task_id: String,
        phase: String,
        iteration: u32,
        input_tokens: u64,
        output_tokens: u64,
    },
    GateDecision {
        task_id: String,
        phase: String,
        approved: bool,
        reason: String,
    },
    RetryScheduled {
        task_id: String,
        from_phase: String,
        to_phase: String,
        attempt: u32,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        reason: String,
    },
}

/// Fire-and-forget event sink.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: TaskEvent);
}

/// Drops every event.
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: TaskEvent) {}
}

/// Logs events through `tracing`.
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish(&self, event: TaskEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(event = %json, "task event"),
            Err(_) => info!(?event, "task event"),
        }
    }
}
