//! Deployment orchestrator
//!
//! Drives one deployment through the FSM: build and connect concurrently,
//! transfer, reconcile dependencies, activate, restart. The session is
//! disposed on every path out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::descriptor::DeploymentConfig;
use crate::deploy::builder::{BuildPlan, LocalBuilder};
use crate::deploy::chain::FallbackChain;
use crate::deploy::deps::{DependencyReconciler, InstallSite, ReconcileOutcome, ReconcileTarget};
use crate::deploy::env::{local_environment, RemoteLoader, ShellEnvironment};
use crate::deploy::fsm::{DeployFsm, DeployState, StageEvent};
use crate::deploy::release::{release_token, ReleaseManager};
use crate::deploy::session::{Connector, OpenSshConnector, RemoteSession, SshTarget};
use crate::deploy::supervisor::{env_file_contents, ProcessSupervisor};
use crate::deploy::transport::{
    downgrade_reason, select_transport, ArchiveTransfer, DeltaSync, LocalCommandRunner,
    SystemRunner, ToolAvailability, TransferPlan, TransferReport, TransferStrategy, TransportKind,
};
use crate::errors::DeployError;
use crate::report::{DeployEvent, Reporter};

/// What a finished deployment did
#[derive(Debug, Clone)]
pub struct DeploySummary {
    pub release: Option<String>,
    pub transport: TransportKind,
    pub failed_artifacts: Vec<String>,
    pub dependencies: ReconcileOutcome,
    pub failed_processes: Vec<String>,
    pub url: String,
    pub history: Vec<DeployState>,
}

pub struct Orchestrator {
    reporter: Arc<dyn Reporter>,
    connector: Arc<dyn Connector>,
    shell: Arc<dyn ShellEnvironment>,
    runner: Arc<dyn LocalCommandRunner>,
    tools: Option<ToolAvailability>,
    scratch_dir: PathBuf,
    remote_profiles: bool,
}

impl Orchestrator {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            connector: Arc::new(OpenSshConnector),
            shell: Arc::from(local_environment()),
            runner: Arc::new(SystemRunner),
            tools: None,
            scratch_dir: std::env::temp_dir(),
            remote_profiles: true,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn ShellEnvironment>) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn LocalCommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Skip tool detection
    pub fn with_tools(mut self, tools: ToolAvailability) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Whether remote commands source the remote shell profiles
    pub fn with_remote_profiles(mut self, enabled: bool) -> Self {
        self.remote_profiles = enabled;
        self
    }

    pub fn reporter(&self) -> &dyn Reporter {
        self.reporter.as_ref()
    }

    /// Run one deployment of the project in `root`
    pub async fn deploy(
        &self,
        root: &Path,
        config: &DeploymentConfig,
    ) -> Result<DeploySummary, DeployError> {
        let mut fsm = DeployFsm::new();
        self.advance(&mut fsm, StageEvent::Begin)?;
        info!("Deploying {} to {}", config.name, config.server.host);
        self.reporter.info(&format!(
            "Deploying {} to {}@{}:{}",
            config.name, config.server.user, config.server.host, config.deploy.path
        ));

        let target = SshTarget::from_config(&config.server);
        let plan = BuildPlan::from_config(config);
        let builder = LocalBuilder::new(self.shell.clone());

        let (built, connected) = tokio::join!(
            builder.build(root, &plan, self.reporter.as_ref()),
            self.connect(&target)
        );

        let (output_dir, session) = match (built, connected) {
            (Ok(output_dir), Ok(session)) => (output_dir, session),
            (Err(e), Ok(session)) => {
                self.dispose(session.as_ref()).await;
                return Err(self.fail(&mut fsm, e));
            }
            (Ok(_), Err(e)) => return Err(self.fail(&mut fsm, e)),
            (Err(build), Err(connect)) => {
                self.reporter.error(&connect.to_string());
                return Err(self.fail(&mut fsm, build));
            }
        };

        let result = self
            .run_remote(&mut fsm, root, config, &target, &output_dir, session.as_ref())
            .await;
        self.dispose(session.as_ref()).await;

        match result {
            Ok(mut summary) => {
                summary.history = fsm.history().to_vec();
                self.reporter
                    .success(&format!("Deployment of {} complete", config.name));
                self.reporter.publish(DeployEvent::DeploySuccess {
                    url: summary.url.clone(),
                });
                Ok(summary)
            }
            Err(e) => Err(self.fail(&mut fsm, e)),
        }
    }

    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError> {
        let session = self.connector.connect(target).await?;
        self.reporter
            .success(&format!("Connected to {}", target.host_spec()));
        Ok(session)
    }

    async fn run_remote(
        &self,
        fsm: &mut DeployFsm,
        root: &Path,
        config: &DeploymentConfig,
        target: &SshTarget,
        output_dir: &str,
        session: &dyn RemoteSession,
    ) -> Result<DeploySummary, DeployError> {
        let reporter = self.reporter.as_ref();
        let releases = ReleaseManager::new(&config.deploy.path);
        let base = releases.base().to_string();
        let atomic = config.atomic_deploys();

        let loader = RemoteLoader::new(&config.env, &config.deploy.pre_deploy, self.remote_profiles);
        let hook_loader = RemoteLoader::new(&config.env, &[], self.remote_profiles);

        self.advance(fsm, StageEvent::Prepared)?;

        let (work_dir, token, site) = if atomic {
            let token = release_token(Utc::now());
            let previous = releases.current_release(session).await?;
            let dir = releases.stage(session, &token).await?;
            reporter.info(&format!("Staging release {}", token));
            let previous_dir = previous.map(|p| releases.release_dir(&p));
            (dir, Some(token), InstallSite::FreshRelease { previous: previous_dir })
        } else {
            (base.clone(), None, InstallSite::InPlace)
        };

        let mut plan = TransferPlan::discover(root, output_dir, &work_dir).await?;
        if !atomic {
            plan = plan.with_stale_cleanup(output_dir);
        }
        let transfer = self.transfer(&plan, target, session).await?;
        reporter.success(&format!(
            "Transferred {} artifact(s) via {:?}",
            transfer.transferred.len(),
            transfer.kind
        ));

        self.run_hooks("pre-deploy", &config.deploy.pre_deploy, &work_dir, &hook_loader, session)
            .await;

        self.advance(fsm, StageEvent::Transferred)?;

        let reconciler = DependencyReconciler::new(loader.clone(), config.advanced.optimize_npm);
        let reconcile_target = ReconcileTarget {
            local_root: root.to_path_buf(),
            base_dir: base.clone(),
            work_dir: work_dir.clone(),
            site,
        };
        let mut dependencies = reconciler
            .reconcile(session, reporter, &reconcile_target)
            .await?;

        self.advance(fsm, StageEvent::Reconciled)?;

        let supervisor = ProcessSupervisor::new(loader, config.advanced.use_pm2);
        supervisor
            .write_env(session, &base, &env_file_contents(config))
            .await?;
        let active_dir = match &token {
            Some(token) => {
                releases.link_env(session, token).await?;
                releases.activate(session, token).await?;
                reporter.success(&format!("Release {} is live", token));
                if let ReconcileOutcome::Installed { marker_written, .. } = &mut dependencies {
                    if reconcile_target.defers_marker() {
                        *marker_written = reconciler
                            .commit_marker(session, reporter, &reconcile_target)
                            .await;
                    }
                }
                releases.prune(session, reporter, token).await;
                releases.current_link()
            }
            None => base.clone(),
        };

        self.advance(fsm, StageEvent::Activated)?;

        let failed_processes = supervisor
            .restart_all(session, reporter, &active_dir, &config.processes, output_dir)
            .await;
        self.run_hooks("post-deploy", &config.deploy.post_deploy, &active_dir, &hook_loader, session)
            .await;

        self.advance(fsm, StageEvent::Restarted)?;

        Ok(DeploySummary {
            release: token,
            transport: transfer.kind,
            failed_artifacts: transfer.failed,
            dependencies,
            failed_processes,
            url: format!("http://{}:{}", config.server.host, config.app_port()),
            history: Vec::new(),
        })
    }

    async fn transfer(
        &self,
        plan: &TransferPlan,
        target: &SshTarget,
        session: &dyn RemoteSession,
    ) -> Result<TransferReport, DeployError> {
        let reporter = self.reporter.as_ref();
        let tools = match self.tools {
            Some(tools) => tools,
            None => ToolAvailability::detect().await,
        };

        let delta = DeltaSync::new(self.runner.clone());
        let archive = ArchiveTransfer::new(self.scratch_dir.clone());

        let mut chain = FallbackChain::new();
        match select_transport(tools, target.auth.is_password_only()) {
            TransportKind::DeltaSync => {
                chain = chain.then(delta.label(), || delta.transfer(plan, session, reporter));
            }
            TransportKind::Archive => reporter.warn(&format!(
                "Using archive transfer: {}",
                downgrade_reason(tools)
            )),
        }
        chain = chain.then(archive.label(), || archive.transfer(plan, session, reporter));

        Ok(chain.run(reporter).await?.value)
    }

    /// Run user hooks. Failures are warnings.
    async fn run_hooks(
        &self,
        label: &str,
        commands: &[String],
        dir: &str,
        loader: &RemoteLoader,
        session: &dyn RemoteSession,
    ) {
        for command in commands.iter().filter(|c| !c.trim().is_empty()) {
            self.reporter.info(&format!("Running {} command: {}", label, command));
            match session.run(&loader.wrap(command), Some(dir)).await {
                Ok(output) => {
                    for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
                        self.reporter.info(line);
                    }
                    if !output.success() {
                        self.reporter.warn(&format!(
                            "{} command '{}' failed: {}",
                            label,
                            command,
                            output.failure_reason()
                        ));
                    }
                }
                Err(e) => self.reporter.warn(&format!(
                    "{} command '{}' failed: {}",
                    label, command, e
                )),
            }
        }
    }

    fn advance(&self, fsm: &mut DeployFsm, event: StageEvent) -> Result<(), DeployError> {
        let state = fsm.process(event).map_err(DeployError::StateError)?;
        self.reporter.publish(DeployEvent::Status {
            busy: !state.is_terminal(),
            state: Some(state),
        });
        Ok(())
    }

    fn fail(&self, fsm: &mut DeployFsm, err: DeployError) -> DeployError {
        error!("Deployment failed: {}", err);
        self.reporter.error(&format!("Deployment failed: {}", err));
        match fsm.process(StageEvent::Fail(err.to_string())) {
            Ok(state) => self.reporter.publish(DeployEvent::Status {
                busy: false,
                state: Some(state),
            }),
            Err(e) => warn!("{}", e),
        }
        err
    }

    async fn dispose(&self, session: &dyn RemoteSession) {
        if let Err(e) = session.dispose().await {
            warn!("Failed to close SSH session: {}", e);
        }
    }
}
