//! Push-channel reporter feeding dashboard subscribers

use tokio::sync::broadcast;

use super::{DeployEvent, Reporter};
use crate::utils::strip_ansi;

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcasts events to every live subscriber.
///
/// Log messages are stripped of ANSI sequences since subscribers render them
/// outside a terminal. Publishing with no subscriber is not an error.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    sender: broadcast::Sender<DeployEvent>,
}

impl ChannelReporter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChannelReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ChannelReporter {
    fn publish(&self, event: DeployEvent) {
        let event = match event {
            DeployEvent::Log { level, message } => DeployEvent::Log {
                level,
                message: strip_ansi(&message),
            },
            other => other,
        };
        let _ = self.sender.send(event);
    }
}
