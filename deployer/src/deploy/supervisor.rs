//! Remote process supervision through pm2

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::descriptor::{DeploymentConfig, ProcessEntry};
use crate::deploy::env::RemoteLoader;
use crate::deploy::session::{CommandOutput, RemoteSession};
use crate::errors::DeployError;
use crate::report::Reporter;
use crate::utils::shell_quote;

/// `.env` contents: `PORT` first, then every other key in declaration order
pub fn env_file_contents(config: &DeploymentConfig) -> String {
    let mut contents = format!("PORT={}\n", config.app_port());
    for (key, value) in &config.env {
        if key == "PORT" {
            continue;
        }
        contents.push_str(&format!("{}={}\n", key, value));
    }
    contents
}

/// pm2 process name: the `--name` argument of the command, else the entry name
pub fn pm2_identifier(entry: &ProcessEntry) -> String {
    let mut tokens = entry.command.split_whitespace();
    while let Some(token) = tokens.next() {
        let value = if token == "--name" {
            tokens.next()
        } else {
            token.strip_prefix("--name=")
        };
        if let Some(name) = value.map(|v| v.trim_matches(|c| c == '"' || c == '\'')) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    entry.name.clone()
}

/// The single remote command that reloads or starts an entry
pub fn restart_command(entry: &ProcessEntry, use_pm2: bool) -> String {
    if use_pm2 {
        format!(
            "pm2 reload {} --update-env || ({})",
            shell_quote(&pm2_identifier(entry)),
            entry.command
        )
    } else {
        entry.command.clone()
    }
}

/// Fallback start when nothing is configured and pm2 is off
pub fn legacy_start_command(output_dir: &str) -> String {
    format!(
        "nohup node {}/server/index.mjs > app.log 2>&1 &",
        output_dir.trim_end_matches('/')
    )
}

/// One process as reported by `pm2 jlist`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub pm_id: Option<u64>,
    pub status: String,
    pub cpu: f64,
    pub memory_bytes: u64,
}

impl ProcessStatus {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    pub fn memory_mb(&self) -> u64 {
        (self.memory_bytes as f64 / (1024.0 * 1024.0)).round() as u64
    }
}

#[derive(Debug, Deserialize)]
struct Pm2Process {
    name: String,
    #[serde(default)]
    pm_id: Option<u64>,
    #[serde(default)]
    pm2_env: Pm2Env,
    #[serde(default)]
    monit: Pm2Monit,
}

#[derive(Debug, Default, Deserialize)]
struct Pm2Env {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct Pm2Monit {
    #[serde(default)]
    cpu: f64,
    #[serde(default)]
    memory: u64,
}

/// Parse `pm2 jlist` output. Profile scripts and pm2 itself may print
/// notices first, so the last line holding a JSON array wins.
pub fn parse_jlist(stdout: &str) -> Result<Vec<ProcessStatus>, DeployError> {
    let json = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('['))
        .unwrap_or_else(|| stdout.trim());
    let processes: Vec<Pm2Process> = serde_json::from_str(json)?;
    Ok(processes
        .into_iter()
        .map(|p| ProcessStatus {
            name: p.name,
            pm_id: p.pm_id,
            status: p.pm2_env.status,
            cpu: p.monit.cpu,
            memory_bytes: p.monit.memory,
        })
        .collect())
}

fn status_row(process: &ProcessStatus) -> String {
    let id = process
        .pm_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<25} {:>4}  {:<10} {:>5}%  {:>6} MB",
        process.name,
        id,
        process.status,
        process.cpu,
        process.memory_mb()
    )
}

pub struct ProcessSupervisor {
    loader: RemoteLoader,
    use_pm2: bool,
}

impl ProcessSupervisor {
    pub fn new(loader: RemoteLoader, use_pm2: bool) -> Self {
        Self { loader, use_pm2 }
    }

    /// Write `<base>/.env`
    pub async fn write_env(
        &self,
        session: &dyn RemoteSession,
        base_dir: &str,
        contents: &str,
    ) -> Result<(), DeployError> {
        let path = format!("{}/.env", base_dir.trim_end_matches('/'));
        let output = session
            .run(
                &format!("printf '%s' {} > {}", shell_quote(contents), shell_quote(&path)),
                None,
            )
            .await?;
        if !output.success() {
            return Err(DeployError::ActivationError(format!(
                "cannot write {} ({})",
                path,
                output.failure_reason()
            )));
        }
        debug!("Wrote {}", path);
        Ok(())
    }

    /// Reload or start every process from `work_dir`.
    ///
    /// Each entry is independent: a failure is reported and the next one still
    /// runs. Returns the names that failed.
    pub async fn restart_all(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        work_dir: &str,
        processes: &[ProcessEntry],
        output_dir: &str,
    ) -> Vec<String> {
        if processes.is_empty() {
            if self.use_pm2 {
                reporter.info("No processes configured, nothing to restart");
                return Vec::new();
            }
            let legacy = ProcessEntry {
                name: "app".to_string(),
                command: legacy_start_command(output_dir),
                logs_path: None,
            };
            return self
                .restart_entries(session, reporter, work_dir, std::slice::from_ref(&legacy))
                .await;
        }
        self.restart_entries(session, reporter, work_dir, processes)
            .await
    }

    async fn restart_entries(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        work_dir: &str,
        processes: &[ProcessEntry],
    ) -> Vec<String> {
        let mut failed = Vec::new();
        for entry in processes {
            reporter.info(&format!("Restarting {}", entry.name));
            let command = self.loader.wrap(&restart_command(entry, self.use_pm2));
            let result = session.run(&command, Some(work_dir)).await;
            let error = match result {
                Ok(output) if output.success() => {
                    reporter.success(&format!("{} is running", entry.name));
                    continue;
                }
                Ok(output) => DeployError::ProcessRestartError {
                    name: entry.name.clone(),
                    reason: output.failure_reason(),
                },
                Err(e) => DeployError::ProcessRestartError {
                    name: entry.name.clone(),
                    reason: e.to_string(),
                },
            };
            reporter.error(&error.to_string());
            failed.push(entry.name.clone());
        }
        failed
    }

    /// Every pm2 process on the host
    pub async fn status(&self, session: &dyn RemoteSession) -> Result<Vec<ProcessStatus>, DeployError> {
        let output = session.run(&self.loader.wrap("pm2 jlist"), None).await?;
        if !output.success() {
            return Err(DeployError::RemoteError(format!(
                "pm2 jlist failed: {}",
                output.failure_reason()
            )));
        }
        parse_jlist(&output.stdout)
    }

    /// Fetch the process table and emit one line per process
    pub async fn report_status(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        host: &str,
    ) -> Result<Vec<ProcessStatus>, DeployError> {
        let processes = self.status(session).await?;
        reporter.info(&format!("Server: {}", host));
        if processes.is_empty() {
            reporter.warn("No pm2 processes on this server");
            return Ok(processes);
        }
        reporter.info(&format!(
            "{:<25} {:>4}  {:<10} {:>6}  {:>9}",
            "NAME", "ID", "STATUS", "CPU", "MEMORY"
        ));
        for process in &processes {
            let row = status_row(process);
            if process.is_online() {
                reporter.success(&row);
            } else {
                reporter.warn(&row);
            }
        }
        Ok(processes)
    }

    /// Recent log lines of one process
    pub async fn logs(
        &self,
        session: &dyn RemoteSession,
        name: &str,
        lines: u32,
    ) -> Result<CommandOutput, DeployError> {
        let command = format!("pm2 logs {} --lines {} --nostream", shell_quote(name), lines);
        session.run(&self.loader.wrap(&command), None).await
    }
}
