//! Atomic releases under `<base>/releases/<token>`

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::deploy::session::{run_best_effort, RemoteSession};
use crate::errors::DeployError;
use crate::report::Reporter;
use crate::utils::shell_quote;

/// Releases kept after a successful switch
pub const RELEASE_RETENTION: usize = 5;

/// Sortable, filesystem-safe release name, e.g. `2024-05-01T12-30-00-123`
pub fn release_token(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H-%M-%S-%3f").to_string()
}

/// Release names to delete so that only the `keep` newest remain
pub fn releases_to_prune(names: &[String], keep: usize) -> Vec<String> {
    let mut sorted: Vec<String> = names
        .iter()
        .filter(|n| !n.trim().is_empty())
        .cloned()
        .collect();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();
    sorted.into_iter().skip(keep).collect()
}

/// Manages the release layout of one deployment base directory
#[derive(Debug, Clone)]
pub struct ReleaseManager {
    base: String,
    retention: usize,
}

impl ReleaseManager {
    pub fn new(base: &str) -> Self {
        let trimmed = base.trim_end_matches('/');
        Self {
            base: if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() },
            retention: RELEASE_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn releases_dir(&self) -> String {
        format!("{}/releases", self.base)
    }

    pub fn release_dir(&self, token: &str) -> String {
        format!("{}/releases/{}", self.base, token)
    }

    pub fn current_link(&self) -> String {
        format!("{}/current", self.base)
    }

    /// Create an empty release directory
    pub async fn stage(&self, session: &dyn RemoteSession, token: &str) -> Result<String, DeployError> {
        let dir = self.release_dir(token);
        let output = session
            .run(&format!("mkdir -p {}", shell_quote(&dir)), None)
            .await?;
        if !output.success() {
            return Err(DeployError::ActivationError(format!(
                "cannot create {} ({})",
                dir,
                output.failure_reason()
            )));
        }
        debug!("Staged release {}", dir);
        Ok(dir)
    }

    /// Token of the release `current` points to, if any
    pub async fn current_release(
        &self,
        session: &dyn RemoteSession,
    ) -> Result<Option<String>, DeployError> {
        let output = session
            .run(&format!("readlink {}", shell_quote(&self.current_link())), None)
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output
            .stdout
            .trim()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|t| !t.is_empty())
            .map(str::to_string))
    }

    /// Link the shared `.env` into a release
    pub async fn link_env(&self, session: &dyn RemoteSession, token: &str) -> Result<(), DeployError> {
        let command = format!(
            "ln -sfn {} {}",
            shell_quote(&format!("{}/.env", self.base)),
            shell_quote(&format!("{}/.env", self.release_dir(token)))
        );
        let output = session.run(&command, None).await?;
        if !output.success() {
            return Err(DeployError::ActivationError(format!(
                "cannot link .env ({})",
                output.failure_reason()
            )));
        }
        Ok(())
    }

    /// Point `current` at a release with a single rename
    pub async fn activate(&self, session: &dyn RemoteSession, token: &str) -> Result<(), DeployError> {
        let target = shell_quote(&self.release_dir(token));
        let temp = shell_quote(&format!("{}.tmp-{}", self.current_link(), token));
        let current = shell_quote(&self.current_link());

        let output = session
            .run(
                &format!("ln -sfn {target} {temp} && mv -Tf {temp} {current}"),
                None,
            )
            .await?;
        if !output.success() {
            run_best_effort(session, &format!("rm -f {temp}"), None).await;
            return Err(DeployError::ActivationError(format!(
                "cannot switch current to {} ({})",
                token,
                output.failure_reason()
            )));
        }
        info!("Release {} is live", token);
        Ok(())
    }

    /// Release names present remotely, oldest first
    pub async fn list(&self, session: &dyn RemoteSession) -> Result<Vec<String>, DeployError> {
        let output = session
            .run(&format!("ls -1 {}", shell_quote(&self.releases_dir())), None)
            .await?;
        if !output.success() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Delete all but the newest releases. Failures are reported, never fatal.
    pub async fn prune(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        keep_token: &str,
    ) -> Vec<String> {
        let names = match self.list(session).await {
            Ok(names) => names,
            Err(e) => {
                reporter.warn(&format!("Could not list releases: {}", e));
                return Vec::new();
            }
        };

        let doomed: Vec<String> = releases_to_prune(&names, self.retention)
            .into_iter()
            .filter(|n| n != keep_token)
            .collect();
        if doomed.is_empty() {
            return doomed;
        }

        let paths: Vec<String> = doomed
            .iter()
            .map(|n| shell_quote(&self.release_dir(n)))
            .collect();
        match session.run(&format!("rm -rf {}", paths.join(" ")), None).await {
            Ok(output) if output.success() => {
                reporter.info(&format!("Pruned {} old release(s)", doomed.len()));
            }
            Ok(output) => reporter.warn(&format!(
                "Could not prune old releases: {}",
                output.failure_reason()
            )),
            Err(e) => reporter.warn(&format!("Could not prune old releases: {}", e)),
        }
        doomed
    }
}
