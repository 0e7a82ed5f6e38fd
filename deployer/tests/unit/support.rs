//! Test doubles shared by the unit test modules

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use koram::deploy::session::{CommandOutput, Connector, RemoteSession, SshTarget, SyncEndpoint};
use koram::deploy::transport::LocalCommandRunner;
use koram::errors::DeployError;

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub fn fail(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

struct Rule {
    needle: String,
    outputs: VecDeque<CommandOutput>,
}

/// Session answering commands from scripted rules.
///
/// The first rule whose needle occurs in the command answers. Its outputs are
/// consumed in order and the last one repeats. Unmatched commands succeed.
#[derive(Default)]
pub struct ScriptedSession {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<(Option<String>, String)>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    disposed: AtomicUsize,
    endpoint: Option<SyncEndpoint>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: SyncEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn respond(&self, needle: &str, outputs: Vec<CommandOutput>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            outputs: outputs.into(),
        });
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn commands_in(&self, dir: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(cwd, _)| cwd.as_deref() == Some(dir))
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn run(&self, command: &str, cwd: Option<&str>) -> Result<CommandOutput, DeployError> {
        self.commands
            .lock()
            .unwrap()
            .push((cwd.map(str::to_string), command.to_string()));

        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if command.contains(&rule.needle) {
                let output = if rule.outputs.len() > 1 {
                    rule.outputs.pop_front()
                } else {
                    rule.outputs.front().cloned()
                };
                return Ok(output.unwrap_or_else(|| ok("")));
            }
        }
        Ok(ok(""))
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), DeployError> {
        self.uploads
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    async fn dispose(&self) -> Result<(), DeployError> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync_endpoint(&self) -> Option<SyncEndpoint> {
        self.endpoint.clone()
    }
}

/// Session whose "remote host" is the local machine, running `sh -c`
#[derive(Default)]
pub struct LocalShellSession {
    commands: Mutex<Vec<String>>,
    disposed: AtomicUsize,
}

impl LocalShellSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSession for LocalShellSession {
    async fn run(&self, command: &str, cwd: Option<&str>) -> Result<CommandOutput, DeployError> {
        self.commands.lock().unwrap().push(command.to_string());
        let line = match cwd {
            Some(dir) => format!("cd '{}' && {}", dir, command),
            None => command.to_string(),
        };
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&line)
            .output()
            .await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), DeployError> {
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), DeployError> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync_endpoint(&self) -> Option<SyncEndpoint> {
        None
    }
}

/// Hands out one shared session
pub struct SharedSession(pub Arc<dyn RemoteSession>);

#[async_trait]
impl RemoteSession for SharedSession {
    async fn run(&self, command: &str, cwd: Option<&str>) -> Result<CommandOutput, DeployError> {
        self.0.run(command, cwd).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), DeployError> {
        self.0.upload(local, remote).await
    }

    async fn dispose(&self) -> Result<(), DeployError> {
        self.0.dispose().await
    }

    fn sync_endpoint(&self) -> Option<SyncEndpoint> {
        self.0.sync_endpoint()
    }
}

pub struct FakeConnector {
    session: Arc<dyn RemoteSession>,
    refuse: Option<String>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self {
            session,
            refuse: None,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn refusing(session: Arc<dyn RemoteSession>, reason: &str) -> Self {
        Self {
            refuse: Some(reason.to_string()),
            ..Self::new(session)
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.refuse {
            return Err(DeployError::ConnectError {
                host: target.host.clone(),
                reason: reason.clone(),
            });
        }
        Ok(Box::new(SharedSession(self.session.clone())))
    }
}

/// Records local tool invocations and fails those mentioning a needle
#[derive(Default)]
pub struct FakeRunner {
    failing: Vec<String>,
    calls: Mutex<Vec<(String, Vec<String>, Vec<(String, String)>)>>,
}

impl FakeRunner {
    pub fn failing(needles: &[&str]) -> Self {
        Self {
            failing: needles.iter().map(|n| n.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>, Vec<(String, String)>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalCommandRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<CommandOutput, DeployError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec(), env.to_vec()));
        let source = args.iter().rev().nth(1).cloned().unwrap_or_default();
        if self.failing.iter().any(|n| source.contains(n.as_str())) {
            return Ok(fail(23, "rsync error: some files could not be transferred"));
        }
        Ok(ok(""))
    }
}

/// A project directory with a built output
pub fn project(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (path, contents) in files {
        let full = dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }
    dir
}
