//! Fire-and-forget notifications for downstream consumers.

use scorebook_core::{ClassDelta, Game, Playtype, UserId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "kebab-case")]
pub enum EngineEvent {
    ClassUpdate {
        user_id: UserId,
        delta: ClassDelta,
    },
    GoalAchieved {
        user_id: UserId,
        goal_id: String,
        game: Game,
        playtype: Playtype,
    },
    MilestoneAchieved {
        user_id: UserId,
        milestone_id: String,
        game: Game,
        playtype: Playtype,
    },
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("no subscribers for event")]
    NoSubscribers,
    #[error("event sink failed: {0}")]
    Sink(String),
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent) -> Result<(), EventError>;
}

#[derive(Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: EngineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Publishes onto a tokio broadcast channel; never blocks the import.
pub struct BroadcastEventSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: EngineEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| EventError::NoSubscribers)
    }
}

/// Emits and swallows failures; broadcast problems never fail an import.
pub fn emit_logged(sink: &dyn EventSink, event: EngineEvent) {
    if let Err(err) = sink.emit(event) {
        warn!(error = %err, "failed to broadcast engine event");
    }
}
