//! Koram deployer library
//!
//! Builds a web project locally, ships it to a remote host over SSH and
//! reloads the processes serving it.

pub mod app;
pub mod config;
pub mod credentials;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod report;
pub mod server;
pub mod utils;
