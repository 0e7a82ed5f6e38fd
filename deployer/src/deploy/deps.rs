//! Remote dependency reconciliation
//!
//! The SHA-256 of the local lockfile is compared with the marker left by the
//! last successful install. The marker is only written once install and
//! native rebuild are both done, so an interrupted run always reinstalls.
//! A staged release defers the marker until it is live; see
//! [`DependencyReconciler::commit_marker`].

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::deploy::chain::FallbackChain;
use crate::deploy::env::RemoteLoader;
use crate::deploy::session::{CommandOutput, RemoteSession};
use crate::errors::DeployError;
use crate::report::Reporter;
use crate::utils::{sha256_hash, shell_quote};

pub const MANIFEST_FILE: &str = "package.json";
pub const LOCKFILE: &str = "package-lock.json";
pub const MARKER_FILE: &str = ".lockhash";

const NPM_PERMISSIVE_ENV: &str = "NPM_CONFIG_ENGINE_STRICT=false NPM_CONFIG_LEGACY_PEER_DEPS=true";

/// Where dependencies get installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSite {
    /// The live directory, which keeps its `node_modules` between deploys
    InPlace,
    /// A freshly staged release. `previous` is the directory of the release it replaces.
    FreshRelease { previous: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileTarget {
    pub local_root: PathBuf,
    /// Directory holding the marker
    pub base_dir: String,
    /// Directory `npm install` runs in
    pub work_dir: String,
    pub site: InstallSite,
}

impl ReconcileTarget {
    pub fn marker_path(&self) -> String {
        format!("{}/{}", self.base_dir.trim_end_matches('/'), MARKER_FILE)
    }

    /// The marker describes what `current` runs, so a staged release only
    /// records it after activation.
    pub fn defers_marker(&self) -> bool {
        matches!(self.site, InstallSite::FreshRelease { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No `package.json` was shipped
    NoManifest,
    /// Lockfile unchanged and `node_modules` already in place
    Skipped,
    /// Lockfile unchanged, `node_modules` copied from the previous release
    Reused,
    Installed {
        nuclear_retry: bool,
        rebuilt: bool,
        marker_written: bool,
    },
}

impl ReconcileOutcome {
    pub fn installed(&self) -> bool {
        matches!(self, ReconcileOutcome::Installed { .. })
    }
}

/// SHA-256 of the local lockfile, `None` when there is none
pub async fn local_lock_hash(root: &Path) -> Result<Option<String>, DeployError> {
    match fs::read(root.join(LOCKFILE)).await {
        Ok(bytes) => Ok(Some(sha256_hash(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The `npm install` command line
pub fn install_command(optimize_npm: bool) -> String {
    let mut command = format!(
        "{} npm install --omit=dev --no-audit --no-progress",
        NPM_PERMISSIVE_ENV
    );
    if optimize_npm {
        command.push_str(" --prefer-offline");
    }
    command
}

pub struct DependencyReconciler {
    loader: RemoteLoader,
    optimize_npm: bool,
}

impl DependencyReconciler {
    pub fn new(loader: RemoteLoader, optimize_npm: bool) -> Self {
        Self {
            loader,
            optimize_npm,
        }
    }

    /// Marker content, `None` when the marker is absent
    pub async fn remote_marker(
        &self,
        session: &dyn RemoteSession,
        target: &ReconcileTarget,
    ) -> Result<Option<String>, DeployError> {
        let output = session
            .run(
                &format!("cat {} 2>/dev/null", shell_quote(&target.marker_path())),
                None,
            )
            .await?;
        if !output.success() {
            return Ok(None);
        }
        let marker = output.stdout.trim();
        Ok((!marker.is_empty()).then(|| marker.to_string()))
    }

    pub async fn reconcile(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        target: &ReconcileTarget,
    ) -> Result<ReconcileOutcome, DeployError> {
        if fs::metadata(target.local_root.join(MANIFEST_FILE)).await.is_err() {
            reporter.info("No package.json, skipping dependency install");
            return Ok(ReconcileOutcome::NoManifest);
        }

        let local_hash = local_lock_hash(&target.local_root).await?;
        match &local_hash {
            Some(hash) => {
                let remote = self.remote_marker(session, target).await?;
                debug!("Lockfile hash local={} remote={:?}", hash, remote);
                if remote.as_deref() == Some(hash.as_str()) {
                    if let Some(outcome) = self.reuse(session, reporter, target).await? {
                        return Ok(outcome);
                    }
                } else {
                    reporter.info("Lockfile changed, installing dependencies");
                }
            }
            None => reporter.warn("No package-lock.json, dependencies are always installed"),
        }

        self.diagnostics(session, reporter, target).await;
        let nuclear_retry = self.install(session, reporter, target).await?;
        let rebuilt = self.rebuild(session, reporter, target).await;

        let marker_written = match &local_hash {
            Some(_) if target.defers_marker() => {
                debug!("Marker deferred until {} is live", target.work_dir);
                false
            }
            Some(hash) => self.write_marker(session, reporter, target, hash).await,
            None => false,
        };

        reporter.success("Dependencies installed");
        Ok(ReconcileOutcome::Installed {
            nuclear_retry,
            rebuilt,
            marker_written,
        })
    }

    /// Unchanged lockfile: skip, or carry `node_modules` over into a fresh release.
    /// `None` means an install is still needed.
    async fn reuse(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        target: &ReconcileTarget,
    ) -> Result<Option<ReconcileOutcome>, DeployError> {
        let previous = match &target.site {
            InstallSite::InPlace => {
                reporter.success("Dependencies unchanged, skipping install");
                return Ok(Some(ReconcileOutcome::Skipped));
            }
            InstallSite::FreshRelease { previous: None } => {
                reporter.info("Dependencies unchanged but no previous release, installing");
                return Ok(None);
            }
            InstallSite::FreshRelease {
                previous: Some(previous),
            } => previous,
        };

        let source = format!("{}/node_modules", previous.trim_end_matches('/'));
        let command = format!(
            "[ -d {src} ] && cp -a {src} {dst}/",
            src = shell_quote(&source),
            dst = shell_quote(&target.work_dir)
        );
        let output = session.run(&command, None).await?;
        if output.success() {
            reporter.success(
                "Dependencies unchanged, skipping install (node_modules reused from previous release)",
            );
            Ok(Some(ReconcileOutcome::Reused))
        } else {
            reporter.info("Previous node_modules unavailable, installing");
            Ok(None)
        }
    }

    async fn run(
        &self,
        session: &dyn RemoteSession,
        target: &ReconcileTarget,
        command: &str,
    ) -> Result<CommandOutput, DeployError> {
        session
            .run(&self.loader.wrap(command), Some(&target.work_dir))
            .await
    }

    async fn diagnostics(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        target: &ReconcileTarget,
    ) {
        match self
            .run(session, target, "node -v; npm -v; which git")
            .await
        {
            Ok(output) => {
                let lines: Vec<&str> = output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                reporter.info(&format!("Remote toolchain: {}", lines.join(", ")));
                if !output.success() {
                    reporter.warn("Remote toolchain incomplete (node, npm or git missing)");
                }
            }
            Err(e) => reporter.warn(&format!("Remote diagnostics failed: {}", e)),
        }
    }

    /// Install, with exactly one clean retry. Returns whether the retry was needed.
    async fn install(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        target: &ReconcileTarget,
    ) -> Result<bool, DeployError> {
        let install = install_command(self.optimize_npm);
        reporter.info("Installing production dependencies");

        let first = self.run(session, target, &install).await?;
        if first.success() {
            report_tail(reporter, &first);
            return Ok(false);
        }

        reporter.warn(&format!(
            "npm install failed ({}), retrying from scratch",
            first.failure_reason()
        ));
        let retry = self
            .run(
                session,
                target,
                &format!("rm -rf node_modules {} && {}", LOCKFILE, install),
            )
            .await?;
        if retry.success() {
            report_tail(reporter, &retry);
            return Ok(true);
        }

        let reason = retry.failure_reason();
        reporter.error(&format!("npm install failed again: {}", reason));
        Err(DeployError::InstallError(reason))
    }

    /// Rebuild native modules. Failure leaves a warning, never an error.
    async fn rebuild(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        target: &ReconcileTarget,
    ) -> bool {
        let attempt = |command: &'static str| async move {
            let output = self.run(session, target, command).await?;
            if output.success() {
                Ok::<(), DeployError>(())
            } else {
                Err(DeployError::RemoteError(output.failure_reason()))
            }
        };

        let result = FallbackChain::new()
            .then("npm rebuild --update-binary", move || {
                attempt("npm rebuild --update-binary")
            })
            .then("npm rebuild --build-from-source", move || {
                attempt("npm rebuild --build-from-source")
            })
            .run(reporter)
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                let warning = DeployError::RebuildWarning(e.to_string());
                reporter.warn(&format!("{}, native modules may not load", warning));
                false
            }
        }
    }

    /// Record the lockfile hash of a release that just went live.
    /// Returns whether the marker was written.
    pub async fn commit_marker(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        target: &ReconcileTarget,
    ) -> bool {
        match local_lock_hash(&target.local_root).await {
            Ok(Some(hash)) => self.write_marker(session, reporter, target, &hash).await,
            Ok(None) => false,
            Err(e) => {
                reporter.warn(&format!("Could not hash {}: {}", LOCKFILE, e));
                false
            }
        }
    }

    async fn write_marker(
        &self,
        session: &dyn RemoteSession,
        reporter: &dyn Reporter,
        target: &ReconcileTarget,
        hash: &str,
    ) -> bool {
        let command = format!(
            "printf '%s' {} > {}",
            hash,
            shell_quote(&target.marker_path())
        );
        match session.run(&command, None).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                reporter.warn(&format!(
                    "Could not write {}: {}",
                    MARKER_FILE,
                    output.failure_reason()
                ));
                false
            }
            Err(e) => {
                reporter.warn(&format!("Could not write {}: {}", MARKER_FILE, e));
                false
            }
        }
    }
}

fn report_tail(reporter: &dyn Reporter, output: &CommandOutput) {
    if let Some(line) = output.stdout.lines().rev().find(|l| !l.trim().is_empty()) {
        reporter.info(line.trim());
    }
}
