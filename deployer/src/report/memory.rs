//! In-memory reporter, used by tests and by callers that want a transcript

use std::sync::Mutex;

use super::{DeployEvent, Level, Reporter};

#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<DeployEvent>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in the order they were published
    pub fn events(&self) -> Vec<DeployEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Messages of every log event
    pub fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DeployEvent::Log { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Messages logged at exactly `level`
    pub fn events_at(&self, level: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DeployEvent::Log { level: l, message } if l == level => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Whether any log line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

impl Reporter for MemoryReporter {
    fn publish(&self, event: DeployEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
