//! Event bus for explainability.
//!
//! The reasoning loop, tool fan-out, DAG nodes and research sub-agents all
//! publish lifecycle events through an [`EventCollector`] so a host can render
//! live progress or an audit trail.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Unique identifier for an event
pub type EventId = String;

/// Which part of a run produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// One iteration of the reasoning loop
    Loop,
    /// A single tool invocation
    Tool,
    /// A node of an executing task graph
    PlanNode,
    /// A research sub-agent working one sub-query
    SubAgent,
    /// Final compilation of plan or research results
    Synthesis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Loop => "loop",
            Stage::Tool => "tool",
            Stage::PlanNode => "plan_node",
            Stage::SubAgent => "sub_agent",
            Stage::Synthesis => "synthesis",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Start {
        event_id: EventId,
        timestamp: u64,
        subject: String,
        stage: Stage,
        description: String,
    },
    Finish {
        event_id: EventId,
        timestamp: u64,
        subject: String,
        stage: Stage,
        outcome: Outcome,
        duration_ms: u64,
    },
    /// Free-form progress note
    Message {
        event_id: EventId,
        timestamp: u64,
        subject: String,
        stage: Stage,
        content: String,
        metadata: serde_json::Value,
    },
}

impl Event {
    pub fn event_id(&self) -> &str {
        match self {
            Event::Start { event_id, .. } => event_id,
            Event::Finish { event_id, .. } => event_id,
            Event::Message { event_id, .. } => event_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Event::Start { timestamp, .. } => *timestamp,
            Event::Finish { timestamp, .. } => *timestamp,
            Event::Message { timestamp, .. } => *timestamp,
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            Event::Start { subject, .. } => subject,
            Event::Finish { subject, .. } => subject,
            Event::Message { subject, .. } => subject,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Event::Start { stage, .. } => *stage,
            Event::Finish { stage, .. } => *stage,
            Event::Message { stage, .. } => *stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { reason: String, retryable: bool },
    Cancelled,
}

impl Outcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Outcome::Failure {
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Cloneable sender half of the event bus.
///
/// Sending never blocks; if the receiver was dropped the event is discarded
/// with a warning, so emitting is always safe from worker tasks.
#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit_start(&self, subject: impl Into<String>, stage: Stage, description: impl Into<String>) {
        self.send(Event::Start {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            subject: subject.into(),
            stage,
            description: description.into(),
        });
    }

    pub fn emit_finish(
        &self,
        subject: impl Into<String>,
        stage: Stage,
        outcome: Outcome,
        duration_ms: u64,
    ) {
        self.send(Event::Finish {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            subject: subject.into(),
            stage,
            outcome,
            duration_ms,
        });
    }

    pub fn emit_message(
        &self,
        subject: impl Into<String>,
        stage: Stage,
        content: impl Into<String>,
        metadata: serde_json::Value,
    ) {
        self.send(Event::Message {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            subject: subject.into(),
            stage,
            content: content.into(),
            metadata,
        });
    }

    fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event) {
            tracing::trace!(error = %e, "event receiver dropped");
        }
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new().0
    }
}

fn generate_event_id() -> EventId {
    format!("evt_{}", uuid::Uuid::new_v4().simple())
}

/// Current Unix timestamp in milliseconds
fn current_timestamp() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Drain every event currently buffered in the receiver without waiting.
pub fn drain(receiver: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_event_reaches_receiver() {
        let (collector, mut receiver) = EventCollector::new();

        collector.emit_start("node-1", Stage::PlanNode, "search prices");

        let event = receiver.recv().await.unwrap();
        match event {
            Event::Start {
                subject, stage, ..
            } => {
                assert_eq!(subject, "node-1");
                assert_eq!(stage, Stage::PlanNode);
            }
            _ => panic!("Expected Start event"),
        }
    }

    #[tokio::test]
    async fn emitting_after_receiver_drop_is_harmless() {
        let (collector, receiver) = EventCollector::new();
        drop(receiver);
        collector.emit_finish("t", Stage::Tool, Outcome::Success, 3);
    }

    #[test]
    fn drain_returns_events_in_order() {
        let (collector, mut receiver) = EventCollector::new();
        collector.emit_message("run", Stage::Loop, "first", serde_json::Value::Null);
        collector.emit_message("run", Stage::Loop, "second", serde_json::Value::Null);

        let events = drain(&mut receiver);
        assert_eq!(events.len(), 2);
        assert_ne!(events[0].event_id(), events[1].event_id());
        assert!(matches!(&events[1], Event::Message { content, .. } if content == "second"));
    }
}
