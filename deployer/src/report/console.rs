//! Terminal reporter

use colored::Colorize;
use tracing::debug;

use super::{DeployEvent, Level, Reporter};

/// Prints progress to stdout with a colour per level
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for ConsoleReporter {
    fn publish(&self, event: DeployEvent) {
        match event {
            DeployEvent::Log { level, message } => {
                debug!(target: "koram::progress", ?level, "{}", message);
                match level {
                    Level::Info => println!("{}", message.blue()),
                    Level::Success => println!("{}", message.green()),
                    Level::Warn => println!("{}", message.yellow()),
                    Level::Error => eprintln!("{}", message.red()),
                }
            }
            DeployEvent::DeploySuccess { url } => {
                println!("{} {}", "Application URL:".green().bold(), url.green());
            }
            DeployEvent::Status { .. } => {}
        }
    }
}
