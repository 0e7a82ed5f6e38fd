//! Remote session over the OpenSSH client
//!
//! `connect` opens a control master on a private socket. Commands, uploads and
//! rsync then multiplex over that one authenticated connection until `dispose`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::descriptor::ServerConfig;
use crate::errors::DeployError;
use crate::utils::shell_quote;

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Best single-line explanation of a failure
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        let text = if !stderr.is_empty() { stderr } else { stdout };
        match text.lines().last() {
            Some(line) => format!("exit code {}: {}", self.exit_code, line),
            None => format!("exit code {}", self.exit_code),
        }
    }
}

/// Run a cleanup command whose failure only gets a debug line
pub async fn run_best_effort(session: &dyn RemoteSession, command: &str, cwd: Option<&str>) {
    match session.run(command, cwd).await {
        Ok(output) if output.success() => {}
        Ok(output) => debug!("Cleanup '{}' failed: {}", command, output.failure_reason()),
        Err(e) => debug!("Cleanup '{}' failed: {}", command, e),
    }
}

/// How rsync reaches the host: the `-e` remote shell and the `user@host` prefix
#[derive(Debug, Clone)]
pub struct SyncEndpoint {
    pub remote_shell: String,
    pub host_spec: String,
    pub password: Option<SecretString>,
}

/// A live connection to the deployment host.
///
/// Exactly one per deployment. `dispose` must be called once on every path,
/// later calls are no-ops.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a shell command, optionally from `cwd`. A non-zero exit is not an error.
    async fn run(&self, command: &str, cwd: Option<&str>) -> Result<CommandOutput, DeployError>;

    /// Copy one local file to a remote path
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), DeployError>;

    async fn dispose(&self) -> Result<(), DeployError>;

    /// Endpoint for delta-sync, `None` when the session cannot carry rsync
    fn sync_endpoint(&self) -> Option<SyncEndpoint>;
}

/// Opens sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError>;
}

/// Authentication material for a host
#[derive(Debug, Clone, Default)]
pub struct SshAuth {
    pub key: Option<PathBuf>,
    pub password: Option<SecretString>,
}

impl SshAuth {
    /// Only a password is available, so every tool needs `sshpass`
    pub fn is_password_only(&self) -> bool {
        self.password.is_some() && self.key.is_none()
    }
}

/// Where to connect
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub auth: SshAuth,
}

impl SshTarget {
    pub fn from_config(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            user: server.user.clone(),
            port: server.port,
            auth: SshAuth {
                key: server.ssh_key.as_deref().map(expand_home),
                password: server.secret().map(|p| SecretString::from(p.to_string())),
            },
        }
    }

    pub fn host_spec(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(0);

fn control_socket_path() -> PathBuf {
    let n = SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("koram-{}-{}.ctl", std::process::id(), n))
}

/// Connects with the system `ssh` binary in control-master mode
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenSshConnector;

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError> {
        Ok(Box::new(SshSession::connect(target.clone()).await?))
    }
}

/// A control-master SSH connection
#[derive(Debug)]
pub struct SshSession {
    target: SshTarget,
    socket: PathBuf,
    disposed: AtomicBool,
}

impl SshSession {
    pub async fn connect(target: SshTarget) -> Result<Self, DeployError> {
        let socket = control_socket_path();
        info!("Connecting to {}:{}", target.host_spec(), target.port);

        let mut command = auth_command("ssh", &target.auth);
        command
            .args(["-M", "-N", "-f", "-S"])
            .arg(&socket)
            .args(["-p", &target.port.to_string()])
            .args(["-o", "ServerAliveInterval=15"])
            .args(["-o", "ServerAliveCountMax=4"])
            .args(["-o", "ConnectTimeout=20"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args([
                "-o",
                "PreferredAuthentications=publickey,password,keyboard-interactive",
            ]);
        if target.auth.password.is_none() {
            command.args(["-o", "BatchMode=yes"]);
        }
        if let Some(key) = &target.auth.key {
            command.arg("-i").arg(key);
        }
        command.arg(target.host_spec());

        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::ConnectError {
                host: target.host.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DeployError::ConnectError {
                host: target.host.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!("Control master up at {}", socket.display());
        Ok(Self {
            target,
            socket,
            disposed: AtomicBool::new(false),
        })
    }

    fn control_path_option(&self) -> String {
        format!("ControlPath={}", self.socket.display())
    }

    fn close_master(&self) -> std::io::Result<std::process::Child> {
        std::process::Command::new("ssh")
            .arg("-S")
            .arg(&self.socket)
            .args(["-O", "exit"])
            .arg(self.target.host_spec())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }
}

/// `program`, wrapped in `sshpass -e` when only a password is available
fn auth_command(program: &str, auth: &SshAuth) -> Command {
    match &auth.password {
        Some(password) => {
            let mut command = Command::new("sshpass");
            command
                .arg("-e")
                .arg(program)
                .env("SSHPASS", password.expose_secret());
            command
        }
        None => Command::new(program),
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&self, command: &str, cwd: Option<&str>) -> Result<CommandOutput, DeployError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DeployError::RemoteError("session already disposed".to_string()));
        }

        let line = match cwd {
            Some(dir) => format!("cd {} && {}", shell_quote(dir), command),
            None => command.to_string(),
        };
        debug!("ssh> {}", line);

        let output = Command::new("ssh")
            .arg("-S")
            .arg(&self.socket)
            .args(["-p", &self.target.port.to_string()])
            .arg(self.target.host_spec())
            .arg(&line)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::RemoteError(format!("Failed to run ssh: {}", e)))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), DeployError> {
        let artifact = local.display().to_string();
        let output = Command::new("scp")
            .args(["-q", "-o", &self.control_path_option()])
            .args(["-P", &self.target.port.to_string()])
            .arg(local)
            .arg(format!("{}:{}", self.target.host_spec(), remote))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::TransferError {
                artifact: artifact.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DeployError::TransferError {
                artifact,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<(), DeployError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing control master {}", self.socket.display());
        match self.close_master() {
            Ok(child) => {
                let _ = tokio::task::spawn_blocking(move || {
                    let mut child = child;
                    child.wait()
                })
                .await;
            }
            Err(e) => warn!("Failed to close SSH control master: {}", e),
        }
        let _ = tokio::fs::remove_file(&self.socket).await;
        Ok(())
    }

    fn sync_endpoint(&self) -> Option<SyncEndpoint> {
        Some(SyncEndpoint {
            remote_shell: format!(
                "ssh -p {} -o {}",
                self.target.port,
                shell_quote(&self.control_path_option())
            ),
            host_spec: self.target.host_spec(),
            password: self.target.auth.password.clone(),
        })
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            warn!("SSH session dropped without dispose, closing control master");
            let _ = self.close_master();
        }
    }
}
