//! Local build step

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::config::descriptor::DeploymentConfig;
use crate::deploy::env::ShellEnvironment;
use crate::errors::DeployError;
use crate::report::Reporter;

/// Output directories probed, in order, when none is configured
pub const OUTPUT_DIR_CANDIDATES: [&str; 4] = [".output", "dist", "build", ".nuxt"];

/// Commands to run locally and where their output lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub steps: Vec<String>,
    pub output_dir: Option<String>,
}

impl BuildPlan {
    pub fn from_config(config: &DeploymentConfig) -> Self {
        let mut steps = Vec::new();
        if config.advanced.local_npm_install {
            steps.push("npm install".to_string());
        }
        let build = config
            .deploy
            .build_command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| format!("NODE_ENV={} npm run build", config.build_env_name()));
        steps.push(build);

        Self {
            steps,
            output_dir: config
                .deploy
                .output_dir
                .clone()
                .filter(|d| !d.trim().is_empty()),
        }
    }
}

/// Runs build commands in the project root and streams their output
pub struct LocalBuilder {
    shell: Arc<dyn ShellEnvironment>,
}

impl LocalBuilder {
    pub fn new(shell: Arc<dyn ShellEnvironment>) -> Self {
        Self { shell }
    }

    /// Run every step of the plan, then locate and prune the output directory.
    /// Returns the output directory relative to `root`.
    pub async fn build(
        &self,
        root: &Path,
        plan: &BuildPlan,
        reporter: &dyn Reporter,
    ) -> Result<String, DeployError> {
        for step in &plan.steps {
            self.run_step(root, step, reporter).await?;
        }

        let output_dir = resolve_output_dir(root, plan.output_dir.as_deref()).await?;
        remove_bundled_modules(root, &output_dir, reporter).await?;
        reporter.success(&format!("Build finished, output in {}", output_dir));
        Ok(output_dir)
    }

    /// Run one command, forwarding each stdout and stderr line as it is produced
    pub async fn run_step(
        &self,
        root: &Path,
        command: &str,
        reporter: &dyn Reporter,
    ) -> Result<(), DeployError> {
        reporter.info(&format!("Running: {}", command));
        let resolved = self.shell.resolve(command);
        debug!("Resolved build command: {:?}", resolved);

        let mut child = resolved
            .to_command(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                reporter.error(&format!("Failed to start '{}': {}", command, e));
                DeployError::BuildError {
                    command: command.to_string(),
                    exit_code: -1,
                }
            })?;

        // raw segments: build tools do not always print UTF-8
        let stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
        let stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));

        if let (Some(mut stdout), Some(mut stderr)) = (stdout, stderr) {
            let mut stdout_open = true;
            let mut stderr_open = true;
            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout.next_segment(), if stdout_open => match line? {
                        Some(line) => forward(reporter, &String::from_utf8_lossy(&line), false),
                        None => stdout_open = false,
                    },
                    line = stderr.next_segment(), if stderr_open => match line? {
                        Some(line) => forward(reporter, &String::from_utf8_lossy(&line), true),
                        None => stderr_open = false,
                    },
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            reporter.error(&format!("'{}' exited with code {}", command, exit_code));
            return Err(DeployError::BuildError {
                command: command.to_string(),
                exit_code,
            });
        }
        Ok(())
    }
}

fn forward(reporter: &dyn Reporter, line: &str, is_stderr: bool) {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return;
    }
    if is_stderr {
        reporter.warn(line);
    } else {
        reporter.info(line);
    }
}

/// The configured output directory, else the first candidate that exists
pub async fn resolve_output_dir(
    root: &Path,
    configured: Option<&str>,
) -> Result<String, DeployError> {
    let candidates: Vec<&str> = match configured {
        Some(dir) => vec![dir],
        None => OUTPUT_DIR_CANDIDATES.to_vec(),
    };

    for dir in &candidates {
        if fs::metadata(root.join(dir))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Ok(dir.trim_end_matches('/').to_string());
        }
    }
    Err(DeployError::MissingOutputError(candidates.join(", ")))
}

/// Native modules bundled for this workstation are never shipped
async fn remove_bundled_modules(
    root: &Path,
    output_dir: &str,
    reporter: &dyn Reporter,
) -> Result<(), DeployError> {
    let bundled = root.join(output_dir).join("server").join("node_modules");
    if fs::metadata(&bundled).await.is_ok() {
        info!("Removing {}", bundled.display());
        fs::remove_dir_all(&bundled).await?;
        reporter.info(&format!("Removed bundled {}/server/node_modules", output_dir));
    }
    Ok(())
}
