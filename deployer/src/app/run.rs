//! Command entry points

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::config::loader::{resolve_config, ConfigLoader};
use crate::credentials::{CredentialProvider, FileCredentialProvider};
use crate::deploy::env::RemoteLoader;
use crate::deploy::orchestrator::{DeploySummary, Orchestrator};
use crate::deploy::session::{Connector, OpenSshConnector, SshTarget};
use crate::deploy::supervisor::{ProcessStatus, ProcessSupervisor};
use crate::errors::DeployError;
use crate::report::{ChannelReporter, ConsoleReporter, FanoutReporter, Reporter, TracingReporter};
use crate::server::serve::serve;
use crate::server::state::ServerState;

fn credentials(options: &AppOptions) -> Arc<dyn CredentialProvider> {
    Arc::new(FileCredentialProvider::new(options.credentials_file.clone()))
}

/// Deploy once from the command line
pub async fn run_deploy(
    options: AppOptions,
    reporter: Arc<dyn Reporter>,
) -> Result<DeploySummary, DeployError> {
    let loader = ConfigLoader::new(options.project_root.clone());
    let provider = credentials(&options);
    let (env, config) = resolve_config(
        &loader,
        options.environment.as_deref(),
        provider.as_ref(),
        &options.overrides,
    )
    .await?;
    info!("Using descriptor for '{}'", env);

    let orchestrator =
        Orchestrator::new(reporter).with_remote_profiles(options.remote_profiles);
    orchestrator.deploy(&options.project_root, &config).await
}

/// Serve the dashboard until `shutdown_signal` resolves
pub async fn run_dashboard(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeployError> {
    let events = ChannelReporter::new();
    let reporter = FanoutReporter::new()
        .with(Arc::new(TracingReporter))
        .with(Arc::new(events.clone()));
    let orchestrator = Orchestrator::new(Arc::new(reporter))
        .with_remote_profiles(options.remote_profiles);

    let state = Arc::new(ServerState::new(
        options.project_root.clone(),
        credentials(&options),
        Arc::new(orchestrator),
        events,
    ));

    let handle = serve(&options.server, state, shutdown_signal).await?;
    ConsoleReporter::new().info(&format!(
        "Dashboard listening on http://{}:{}",
        options.server.host, options.server.port
    ));

    match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!("Dashboard task failed: {}", e);
            Err(e.into())
        }
    }
}

/// Write a starter descriptor
pub async fn run_init(
    options: AppOptions,
    name: Option<String>,
    force: bool,
) -> Result<PathBuf, DeployError> {
    let loader = ConfigLoader::new(options.project_root.clone());
    let env = options
        .environment
        .clone()
        .unwrap_or_else(|| "production".to_string());
    let name = match name {
        Some(name) => name,
        None => project_name(&options.project_root).await,
    };
    loader.init_default(&env, &name, force).await
}

/// Print recent pm2 logs of one process
pub async fn run_logs(
    options: AppOptions,
    process: &str,
    lines: u32,
    reporter: Arc<dyn Reporter>,
) -> Result<(), DeployError> {
    let (target, supervisor) = remote_supervisor(&options).await?;
    let session = OpenSshConnector.connect(&target).await?;
    let result = supervisor.logs(session.as_ref(), process, lines).await;
    session.dispose().await?;

    let output = result?;
    for line in output.stdout.lines().chain(output.stderr.lines()) {
        reporter.info(line);
    }
    if !output.success() {
        return Err(DeployError::RemoteError(format!(
            "pm2 logs {} failed: {}",
            process,
            output.failure_reason()
        )));
    }
    Ok(())
}

/// List the pm2 processes of the configured host
pub async fn run_ps(
    options: AppOptions,
    reporter: Arc<dyn Reporter>,
) -> Result<Vec<ProcessStatus>, DeployError> {
    let (target, supervisor) = remote_supervisor(&options).await?;
    let session = OpenSshConnector.connect(&target).await?;
    let result = supervisor
        .report_status(session.as_ref(), reporter.as_ref(), &target.host_spec())
        .await;
    session.dispose().await?;
    result
}

/// Resolve the descriptor into an SSH target and a supervisor for it
async fn remote_supervisor(
    options: &AppOptions,
) -> Result<(SshTarget, ProcessSupervisor), DeployError> {
    let loader = ConfigLoader::new(options.project_root.clone());
    let provider = credentials(options);
    let (_, config) = resolve_config(
        &loader,
        options.environment.as_deref(),
        provider.as_ref(),
        &options.overrides,
    )
    .await?;

    let supervisor = ProcessSupervisor::new(
        RemoteLoader::new(&config.env, &[], options.remote_profiles),
        config.advanced.use_pm2,
    );
    Ok((SshTarget::from_config(&config.server), supervisor))
}

/// `name` from package.json, else the directory name
async fn project_name(root: &std::path::Path) -> String {
    let manifest = crate::filesys::file::File::new(root.join("package.json"));
    if let Ok(value) = manifest.read_json::<serde_json::Value>().await {
        if let Some(name) = value.get("name").and_then(|n| n.as_str()) {
            if !name.is_empty() {
                return name.trim_start_matches('@').replace('/', "-");
            }
        }
    }
    tokio::fs::canonicalize(root)
        .await
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "app".to_string())
}
