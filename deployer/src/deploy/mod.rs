//! Deployment pipeline

pub mod archive;
pub mod builder;
pub mod chain;
pub mod deps;
pub mod env;
pub mod fsm;
pub mod guard;
pub mod orchestrator;
pub mod release;
pub mod session;
pub mod supervisor;
pub mod transport;
