//! Progress reporting
//!
//! Every deployment step emits through a [`Reporter`]. Components never write
//! to the terminal themselves, so the same run can feed the console, the
//! dashboard websocket, the log file, or all of them at once.

pub mod channel;
pub mod console;
pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::deploy::fsm::DeployState;

pub use channel::ChannelReporter;
pub use console::ConsoleReporter;
pub use memory::MemoryReporter;

/// Severity of a progress message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warn,
    Error,
}

/// Unit consumed by reporters, in execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployEvent {
    Log {
        level: Level,
        message: String,
    },
    Status {
        busy: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<DeployState>,
    },
    DeploySuccess {
        url: String,
    },
}

impl DeployEvent {
    pub fn log(level: Level, message: impl Into<String>) -> Self {
        DeployEvent::Log {
            level,
            message: message.into(),
        }
    }
}

/// Sink for deployment progress.
///
/// Delivery is best-effort: a sink that cannot deliver drops the event rather
/// than failing the deployment.
pub trait Reporter: Send + Sync {
    /// Deliver one event
    fn publish(&self, event: DeployEvent);

    /// Emit a leveled log line
    fn emit(&self, message: &str, level: Level) {
        self.publish(DeployEvent::log(level, message));
    }

    fn info(&self, message: &str) {
        self.emit(message, Level::Info);
    }

    fn success(&self, message: &str) {
        self.emit(message, Level::Success);
    }

    fn warn(&self, message: &str) {
        self.emit(message, Level::Warn);
    }

    fn error(&self, message: &str) {
        self.emit(message, Level::Error);
    }
}

impl<R: Reporter + ?Sized> Reporter for Arc<R> {
    fn publish(&self, event: DeployEvent) {
        (**self).publish(event);
    }
}

/// Forwards progress to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn publish(&self, event: DeployEvent) {
        match event {
            DeployEvent::Log { level, message } => match level {
                Level::Info | Level::Success => info!(target: "koram::progress", "{}", message),
                Level::Warn => warn!(target: "koram::progress", "{}", message),
                Level::Error => error!(target: "koram::progress", "{}", message),
            },
            DeployEvent::Status { busy, state } => {
                info!(target: "koram::progress", busy, state = ?state, "status")
            }
            DeployEvent::DeploySuccess { url } => {
                info!(target: "koram::progress", %url, "deploy succeeded")
            }
        }
    }
}

/// Delivers every event to several reporters, in registration order
#[derive(Default, Clone)]
pub struct FanoutReporter {
    sinks: Vec<Arc<dyn Reporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Reporter>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Reporter for FanoutReporter {
    fn publish(&self, event: DeployEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}
