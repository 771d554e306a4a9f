//! Event recording
//!
//! Events are fire-and-forget: recorders never fail and callers never wait.

use std::sync::Mutex;

use tracing::{info, warn};

/// Severity of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Sink for events about cluster objects
pub trait EventRecorder: Send + Sync {
    /// Record an event on an object, e.g. kind "Node" and object "node-1"
    fn record(&self, kind: &str, object: &str, event_type: EventType, reason: &str, message: &str);
}

/// Writes events to the log
#[derive(Debug, Default)]
pub struct LogEventRecorder;

impl EventRecorder for LogEventRecorder {
    fn record(&self, kind: &str, object: &str, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!("Event {} {}/{}: {}", reason, kind, object, message),
            EventType::Warning => warn!("Event {} {}/{}: {}", reason, kind, object, message),
        }
    }
}

/// A recorded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: String,
    pub object: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether an event with this reason was recorded
    pub fn has_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }
}

impl EventRecorder for RecordingEventRecorder {
    fn record(&self, kind: &str, object: &str, event_type: EventType, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedEvent {
                kind: kind.to_string(),
                object: object.to_string(),
                event_type,
                reason: reason.to_string(),
                message: message.to_string(),
            });
    }
}
