//! Deployment descriptors

pub mod descriptor;
pub mod loader;
