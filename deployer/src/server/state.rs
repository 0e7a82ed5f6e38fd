//! Server state

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::loader::ConfigLoader;
use crate::credentials::CredentialProvider;
use crate::deploy::guard::DeployGuard;
use crate::deploy::orchestrator::Orchestrator;
use crate::report::ChannelReporter;

/// Server state shared across handlers
pub struct ServerState {
    pub project_root: PathBuf,
    pub loader: ConfigLoader,
    pub credentials: Arc<dyn CredentialProvider>,
    pub orchestrator: Arc<Orchestrator>,
    pub guard: DeployGuard,
    pub events: ChannelReporter,
}

impl ServerState {
    pub fn new(
        project_root: PathBuf,
        credentials: Arc<dyn CredentialProvider>,
        orchestrator: Arc<Orchestrator>,
        events: ChannelReporter,
    ) -> Self {
        Self {
            loader: ConfigLoader::new(project_root.clone()),
            project_root,
            credentials,
            orchestrator,
            guard: DeployGuard::new(),
            events,
        }
    }
}
