//! Transport selection and artifact transfer

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::archive::build_archive;
use crate::deploy::session::{run_best_effort, CommandOutput, RemoteSession};
use crate::errors::DeployError;
use crate::report::Reporter;
use crate::utils::shell_quote;

/// Top-level files shipped next to the build output
pub const EXTRA_ARTIFACTS: [&str; 5] = [
    "package.json",
    "package-lock.json",
    "public",
    "static",
    "ecosystem.config.js",
];

/// Build directories removed remotely before a non-atomic archive extract
pub const STALE_BUILD_DIRS: [&str; 3] = [".output", ".nuxt", ".cache"];

const RSYNC_FLAGS: [&str; 6] = [
    "-az",
    "--delete",
    "--no-perms",
    "--no-owner",
    "--no-group",
    "--copy-links",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    DeltaSync,
    Archive,
}

/// Local tools the transports depend on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolAvailability {
    pub rsync: bool,
    pub sshpass: bool,
}

impl ToolAvailability {
    pub async fn detect() -> Self {
        let (rsync, sshpass) = tokio::join!(probe("rsync", "--version"), probe("sshpass", "-V"));
        debug!("Local tools: rsync={} sshpass={}", rsync, sshpass);
        Self { rsync, sshpass }
    }
}

async fn probe(program: &str, arg: &str) -> bool {
    Command::new(program)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Delta-sync needs rsync, and `sshpass` too when a password is the only way in
pub fn select_transport(tools: ToolAvailability, password_only: bool) -> TransportKind {
    if tools.rsync && (!password_only || tools.sshpass) {
        TransportKind::DeltaSync
    } else {
        TransportKind::Archive
    }
}

/// Why delta-sync was not chosen, for the downgrade warning
pub fn downgrade_reason(tools: ToolAvailability) -> &'static str {
    if !tools.rsync {
        "rsync is not installed"
    } else {
        "password auth needs sshpass, which is not installed"
    }
}

/// What to ship and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub root: PathBuf,
    pub artifacts: Vec<String>,
    pub remote_dir: String,
    /// Remote directories to remove before extracting an archive
    pub clean_before: Vec<String>,
}

impl TransferPlan {
    /// The output directory plus every extra artifact that exists locally
    pub async fn discover(
        root: &Path,
        output_dir: &str,
        remote_dir: &str,
    ) -> Result<Self, DeployError> {
        let mut artifacts = vec![output_dir.to_string()];
        for extra in EXTRA_ARTIFACTS {
            if extra != output_dir && fs::metadata(root.join(extra)).await.is_ok() {
                artifacts.push(extra.to_string());
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            artifacts,
            remote_dir: remote_dir.to_string(),
            clean_before: Vec::new(),
        })
    }

    /// Clean stale build directories first, for deploys straight into the live directory
    pub fn with_stale_cleanup(mut self, output_dir: &str) -> Self {
        let mut dirs: Vec<String> = STALE_BUILD_DIRS.iter().map(|d| d.to_string()).collect();
        if !dirs.iter().any(|d| d == output_dir) {
            dirs.push(output_dir.to_string());
        }
        self.clean_before = dirs;
        self
    }
}

/// Outcome of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub kind: TransportKind,
    pub transferred: Vec<String>,
    pub failed: Vec<String>,
}

#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn label(&self) -> &'static str {
        match self.kind() {
            TransportKind::DeltaSync => "delta-sync",
            TransportKind::Archive => "archive",
        }
    }

    async fn transfer(
        &self,
        plan: &TransferPlan,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
    ) -> Result<TransferReport, DeployError>;
}

/// Runs local programs for a transport
#[async_trait]
pub trait LocalCommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<CommandOutput, DeployError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl LocalCommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<CommandOutput, DeployError> {
        let output = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

async fn ensure_remote_dir(session: &dyn RemoteSession, dir: &str) -> Result<(), DeployError> {
    let output = session
        .run(&format!("mkdir -p {}", shell_quote(dir)), None)
        .await?;
    if !output.success() {
        return Err(DeployError::TransferError {
            artifact: dir.to_string(),
            reason: format!("cannot create remote directory ({})", output.failure_reason()),
        });
    }
    Ok(())
}

/// rsync each artifact on its own. One failing artifact does not stop the others.
pub struct DeltaSync {
    runner: Arc<dyn LocalCommandRunner>,
}

impl DeltaSync {
    pub fn new(runner: Arc<dyn LocalCommandRunner>) -> Self {
        Self { runner }
    }
}

impl Default for DeltaSync {
    fn default() -> Self {
        Self::new(Arc::new(SystemRunner))
    }
}

#[async_trait]
impl TransferStrategy for DeltaSync {
    fn kind(&self) -> TransportKind {
        TransportKind::DeltaSync
    }

    async fn transfer(
        &self,
        plan: &TransferPlan,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
    ) -> Result<TransferReport, DeployError> {
        let endpoint = session.sync_endpoint().ok_or_else(|| DeployError::TransferError {
            artifact: plan.remote_dir.clone(),
            reason: "session cannot carry rsync".to_string(),
        })?;
        ensure_remote_dir(session, &plan.remote_dir).await?;

        let mut report = TransferReport {
            kind: TransportKind::DeltaSync,
            transferred: Vec::new(),
            failed: Vec::new(),
        };

        for artifact in &plan.artifacts {
            let local = plan.root.join(artifact);
            let is_dir = fs::metadata(&local).await.map(|m| m.is_dir()).unwrap_or(false);
            let (source, dest) = if is_dir {
                (
                    format!("{}/", local.display()),
                    format!("{}/{}/", plan.remote_dir, artifact),
                )
            } else {
                (local.display().to_string(), format!("{}/", plan.remote_dir))
            };

            let mut args: Vec<String> = RSYNC_FLAGS.iter().map(|f| f.to_string()).collect();
            args.extend([
                "-e".to_string(),
                endpoint.remote_shell.clone(),
                source,
                format!("{}:{}", endpoint.host_spec, dest),
            ]);

            let (program, args, env) = match &endpoint.password {
                Some(password) => {
                    let mut wrapped = vec!["-e".to_string(), "rsync".to_string()];
                    wrapped.extend(args);
                    (
                        "sshpass",
                        wrapped,
                        vec![("SSHPASS".to_string(), password.expose_secret().to_string())],
                    )
                }
                None => ("rsync", args, Vec::new()),
            };

            debug!("Syncing {} with {}", artifact, program);
            match self.runner.run(program, &args, &env).await {
                Ok(output) if output.success() => {
                    reporter.info(&format!("Synced {}", artifact));
                    report.transferred.push(artifact.clone());
                }
                Ok(output) => {
                    reporter.error(&format!(
                        "Failed to sync {}: {}",
                        artifact,
                        output.failure_reason()
                    ));
                    report.failed.push(artifact.clone());
                }
                Err(e) => {
                    reporter.error(&format!("Failed to sync {}: {}", artifact, e));
                    report.failed.push(artifact.clone());
                }
            }
        }

        if report.transferred.is_empty() && !report.failed.is_empty() {
            return Err(DeployError::TransferError {
                artifact: report.failed.join(", "),
                reason: "no artifact could be synced".to_string(),
            });
        }
        Ok(report)
    }
}

/// Pack everything locally, upload once, extract remotely. Any failure is fatal.
pub struct ArchiveTransfer {
    scratch_dir: PathBuf,
}

impl ArchiveTransfer {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    async fn ship(
        &self,
        plan: &TransferPlan,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        local: &Path,
        name: &str,
    ) -> Result<(), DeployError> {
        let summary = build_archive(&plan.root, &plan.artifacts, local).await?;
        reporter.info(&format!(
            "Packed {} artifacts ({} KiB)",
            summary.artifacts,
            summary.bytes / 1024
        ));

        let remote_archive = format!("{}/{}", plan.remote_dir, name);
        session.upload(local, &remote_archive).await?;
        reporter.info("Archive uploaded, extracting");

        let extract = session
            .run(
                &format!("tar --no-same-owner -xzf {} && rm -f {}", name, name),
                Some(&plan.remote_dir),
            )
            .await?;
        if !extract.success() {
            run_best_effort(session, &format!("rm -f {}", name), Some(&plan.remote_dir)).await;
            return Err(DeployError::TransferError {
                artifact: name.to_string(),
                reason: format!("remote extract failed ({})", extract.failure_reason()),
            });
        }
        Ok(())
    }
}

impl Default for ArchiveTransfer {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

#[async_trait]
impl TransferStrategy for ArchiveTransfer {
    fn kind(&self) -> TransportKind {
        TransportKind::Archive
    }

    async fn transfer(
        &self,
        plan: &TransferPlan,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
    ) -> Result<TransferReport, DeployError> {
        ensure_remote_dir(session, &plan.remote_dir).await?;
        if !plan.clean_before.is_empty() {
            let targets: Vec<String> = plan.clean_before.iter().map(|d| shell_quote(d)).collect();
            let cleanup = session
                .run(&format!("rm -rf {}", targets.join(" ")), Some(&plan.remote_dir))
                .await?;
            if !cleanup.success() {
                reporter.warn(&format!(
                    "Could not remove stale build directories: {}",
                    cleanup.failure_reason()
                ));
            }
        }

        let name = format!(
            "koram-{}-{}.tar.gz",
            std::process::id(),
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
        );
        let local = self.scratch_dir.join(&name);

        let result = self.ship(plan, session, reporter, &local, &name).await;
        if let Err(e) = fs::remove_file(&local).await {
            debug!("Local archive {} not removed: {}", local.display(), e);
        }
        result?;

        info!("Extracted archive into {}", plan.remote_dir);
        Ok(TransferReport {
            kind: TransportKind::Archive,
            transferred: plan.artifacts.clone(),
            failed: Vec::new(),
        })
    }
}
