//! End-to-end deployment tests
//!
//! The "remote host" is either a scripted session or a local shell rooted in a
//! temporary directory, so full runs can be checked on disk.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use koram::config::descriptor::DeploymentConfig;
use koram::deploy::deps::ReconcileOutcome;
use koram::deploy::env::PlainShell;
use koram::deploy::fsm::DeployState;
use koram::deploy::orchestrator::Orchestrator;
use koram::deploy::session::{RemoteSession, SyncEndpoint};
use koram::deploy::transport::{ToolAvailability, TransportKind};
use koram::errors::DeployError;
use koram::report::{DeployEvent, MemoryReporter, Reporter};
use serde_json::json;

use crate::support::{fail, ok, project, FakeConnector, FakeRunner, LocalShellSession, ScriptedSession};

struct Harness {
    reporter: Arc<MemoryReporter>,
    connector: Arc<FakeConnector>,
    scratch: tempfile::TempDir,
}

impl Harness {
    fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self {
            reporter: Arc::new(MemoryReporter::new()),
            connector: Arc::new(FakeConnector::new(session)),
            scratch: tempfile::tempdir().unwrap(),
        }
    }

    fn orchestrator(&self, tools: ToolAvailability, runner: Arc<FakeRunner>) -> Orchestrator {
        let reporter: Arc<dyn Reporter> = self.reporter.clone();
        Orchestrator::new(reporter)
            .with_connector(self.connector.clone())
            .with_shell(Arc::new(PlainShell))
            .with_runner(runner)
            .with_tools(tools)
            .with_scratch_dir(self.scratch.path())
            .with_remote_profiles(false)
    }

    fn states(&self) -> Vec<DeployState> {
        self.reporter
            .events()
            .into_iter()
            .filter_map(|event| match event {
                DeployEvent::Status { state, .. } => state,
                _ => None,
            })
            .collect()
    }
}

fn descriptor(value: serde_json::Value) -> DeploymentConfig {
    serde_json::from_value(value).unwrap()
}

fn atomic_config(base: &Path, version: &str) -> DeploymentConfig {
    descriptor(json!({
        "name": "shop",
        "server": {"host": "10.0.0.5", "user": "deploy"},
        "deploy": {
            "path": base.to_str().unwrap(),
            "buildCommand": format!("mkdir -p dist && echo {} > dist/index.html", version),
            "outputDir": "dist",
            "atomicDeploys": true
        },
        "env": {"NODE_ENV": "production"},
        "processes": [{"name": "web", "command": "echo up > started"}],
        "advanced": {"usePm2": false}
    }))
}

fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path).unwrap().trim().to_string()
}

#[tokio::test]
async fn test_atomic_deploy_twice() {
    let local = project(&[("README.md", "shop")]);
    let remote = tempfile::tempdir().unwrap();
    let base = remote.path().join("app");
    let session = Arc::new(LocalShellSession::new());
    let harness = Harness::new(session.clone());
    let orchestrator = harness.orchestrator(ToolAvailability::default(), Arc::default());

    let first = orchestrator
        .deploy(local.path(), &atomic_config(&base, "v1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = orchestrator
        .deploy(local.path(), &atomic_config(&base, "v2"))
        .await
        .unwrap();

    let first_token = first.release.unwrap();
    let second_token = second.release.unwrap();
    assert_ne!(first_token, second_token);
    assert_eq!(second.transport, TransportKind::Archive);
    assert_eq!(second.dependencies, ReconcileOutcome::NoManifest);
    assert!(second.failed_processes.is_empty());
    assert_eq!(second.url, "http://10.0.0.5:3000");

    assert_eq!(read(base.join("current/dist/index.html")), "v2");
    assert_eq!(
        read(base.join("releases").join(&first_token).join("dist/index.html")),
        "v1"
    );
    assert_eq!(
        std::fs::read_link(base.join("current")).unwrap(),
        base.join("releases").join(&second_token)
    );
    assert_eq!(read(base.join("current/started")), "up");

    assert_eq!(read(base.join(".env")), "PORT=3000\nNODE_ENV=production");
    assert_eq!(read(base.join("current/.env")), "PORT=3000\nNODE_ENV=production");

    assert_eq!(session.dispose_count(), 2);
    assert_eq!(harness.connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_atomic_deploy_keeps_five_releases() {
    let local = project(&[]);
    let remote = tempfile::tempdir().unwrap();
    let base = remote.path().join("app");
    let harness = Harness::new(Arc::new(LocalShellSession::new()));
    let orchestrator = harness.orchestrator(ToolAvailability::default(), Arc::default());

    let mut last = None;
    for n in 0..7 {
        let summary = orchestrator
            .deploy(local.path(), &atomic_config(&base, &format!("v{}", n)))
            .await
            .unwrap();
        last = summary.release;
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let releases: Vec<String> = std::fs::read_dir(base.join("releases"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(releases.len(), 5);
    assert!(releases.contains(last.as_ref().unwrap()));
    assert_eq!(read(base.join("current/dist/index.html")), "v6");
}

#[tokio::test]
async fn test_progress_events_follow_stages() {
    let local = project(&[]);
    let remote = tempfile::tempdir().unwrap();
    let harness = Harness::new(Arc::new(LocalShellSession::new()));
    let orchestrator = harness.orchestrator(ToolAvailability::default(), Arc::default());

    let summary = orchestrator
        .deploy(local.path(), &atomic_config(&remote.path().join("app"), "v1"))
        .await
        .unwrap();

    let expected = vec![
        DeployState::BuildingAndConnecting,
        DeployState::Transferring,
        DeployState::Reconciling,
        DeployState::Activating,
        DeployState::Restarting,
        DeployState::Done,
    ];
    assert_eq!(harness.states(), expected);
    assert_eq!(summary.history[1..], expected[..]);
    assert_eq!(
        harness.reporter.events().last(),
        Some(&DeployEvent::DeploySuccess {
            url: "http://10.0.0.5:3000".to_string()
        })
    );
    assert!(harness
        .reporter
        .contains("Using archive transfer"));
}

#[tokio::test]
async fn test_build_failure_disposes_session() {
    let local = project(&[]);
    let session = Arc::new(LocalShellSession::new());
    let harness = Harness::new(session.clone());
    let orchestrator = harness.orchestrator(ToolAvailability::default(), Arc::default());
    let mut config = atomic_config(Path::new("/srv/app"), "v1");
    config.deploy.build_command = Some("echo compiling && exit 3".to_string());

    let err = orchestrator.deploy(local.path(), &config).await.unwrap_err();

    assert!(matches!(err, DeployError::BuildError { exit_code: 3, .. }));
    assert!(session.commands().is_empty());
    assert_eq!(session.dispose_count(), 1);
    assert_eq!(harness.states().last(), Some(&DeployState::Failed));
    assert!(harness.reporter.contains("compiling"));
    assert!(matches!(
        harness.reporter.events().last(),
        Some(DeployEvent::Status { busy: false, .. })
    ));
}

#[tokio::test]
async fn test_connect_failure_aborts_before_remote_work() {
    let local = project(&[]);
    let session = Arc::new(ScriptedSession::new());
    let reporter = Arc::new(MemoryReporter::new());
    let sink: Arc<dyn Reporter> = reporter.clone();
    let orchestrator = Orchestrator::new(sink)
        .with_connector(Arc::new(FakeConnector::refusing(
            session.clone(),
            "Permission denied (publickey)",
        )))
        .with_shell(Arc::new(PlainShell))
        .with_tools(ToolAvailability::default())
        .with_remote_profiles(false);

    let err = orchestrator
        .deploy(local.path(), &atomic_config(Path::new("/srv/app"), "v1"))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ConnectError { ref host, .. } if host == "10.0.0.5"));
    assert!(session.commands().is_empty());
    assert!(reporter.contains("Permission denied"));
}

fn in_place_config() -> DeploymentConfig {
    descriptor(json!({
        "name": "shop",
        "server": {"host": "10.0.0.5", "user": "deploy", "port": 2222},
        "deploy": {
            "path": "/srv/app",
            "buildCommand": "mkdir -p .output/public && echo ok > .output/public/index.html",
            "preDeploy": ["nvm use 20"],
            "postDeploy": ["pm2 save"]
        },
        "env": {"PORT": 8080},
        "processes": {
            "web": {"command": "pm2 start .output/server/index.mjs --name web"},
            "worker": {"command": "pm2 start worker.js --name=queue"}
        }
    }))
}

fn npm_project() -> tempfile::TempDir {
    project(&[
        ("package.json", r#"{"name":"shop"}"#),
        ("package-lock.json", r#"{"lockfileVersion":3}"#),
    ])
}

fn rsync_session() -> Arc<ScriptedSession> {
    Arc::new(ScriptedSession::new().with_endpoint(SyncEndpoint {
        remote_shell: "ssh -p 2222".to_string(),
        host_spec: "deploy@10.0.0.5".to_string(),
        password: None,
    }))
}

#[tokio::test]
async fn test_in_place_deploy_with_pm2() {
    let local = npm_project();
    let session = rsync_session();
    session.respond("cat /srv/app/.lockhash", vec![fail(1, "")]);
    session.respond("pm2 reload web", vec![fail(1, "[PM2][ERROR] Script not found")]);
    let harness = Harness::new(session.clone());
    let runner = Arc::new(FakeRunner::default());
    let tools = ToolAvailability {
        rsync: true,
        sshpass: false,
    };

    let summary = harness
        .orchestrator(tools, runner.clone())
        .deploy(local.path(), &in_place_config())
        .await
        .unwrap();

    assert_eq!(summary.release, None);
    assert_eq!(summary.transport, TransportKind::DeltaSync);
    assert_eq!(summary.failed_processes, vec!["web"]);
    assert!(summary.dependencies.installed());
    assert_eq!(summary.url, "http://10.0.0.5:8080");
    assert_eq!(runner.calls().len(), 3);

    let commands = session.commands_in("/srv/app");
    let install = commands.iter().find(|c| c.contains("npm install")).unwrap();
    assert!(install.starts_with("export PORT=8080; nvm use 20; "));
    assert!(commands
        .iter()
        .any(|c| c.ends_with("pm2 reload queue --update-env || (pm2 start worker.js --name=queue)")));
    assert!(commands.iter().any(|c| c.ends_with("; pm2 save")));
    assert_eq!(session.count("ln -sfn"), 0);
    assert!(session
        .position("> /srv/app/.env")
        .is_some_and(|env| env < session.position("pm2 reload web").unwrap()));
    assert!(harness.reporter.contains("Process 'web' failed to restart"));
    assert_eq!(session.dispose_count(), 1);
}

#[tokio::test]
async fn test_delta_failure_falls_back_to_archive() {
    let local = npm_project();
    let session = rsync_session();
    let harness = Harness::new(session.clone());
    let tools = ToolAvailability {
        rsync: true,
        sshpass: false,
    };

    let summary = harness
        .orchestrator(tools, Arc::new(FakeRunner::failing(&[""])))
        .deploy(local.path(), &in_place_config())
        .await
        .unwrap();

    assert_eq!(summary.transport, TransportKind::Archive);
    assert!(summary.failed_artifacts.is_empty());
    assert_eq!(session.uploads().len(), 1);
    assert!(session.count("tar --no-same-owner -xzf") == 1);
    assert!(session.count("rm -rf .output .nuxt .cache") == 1);
}

#[tokio::test]
async fn test_install_failure_stops_before_activation() {
    let local = npm_project();
    let session = rsync_session();
    session.respond("npm install", vec![fail(1, "npm ERR! code E404")]);
    let harness = Harness::new(session.clone());

    let err = harness
        .orchestrator(
            ToolAvailability {
                rsync: true,
                sshpass: false,
            },
            Arc::default(),
        )
        .deploy(local.path(), &in_place_config())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::InstallError(_)));
    assert_eq!(session.count("npm install"), 2);
    assert_eq!(session.count(".env"), 0);
    assert_eq!(session.count("pm2 reload"), 0);
    assert_eq!(session.dispose_count(), 1);
    assert_eq!(harness.states().last(), Some(&DeployState::Failed));
}

#[tokio::test]
async fn test_skipped_install_on_unchanged_lockfile() {
    let local = npm_project();
    let hash = koram::deploy::deps::local_lock_hash(local.path())
        .await
        .unwrap()
        .unwrap();
    let session = rsync_session();
    session.respond("cat /srv/app/.lockhash", vec![ok(&hash)]);
    let harness = Harness::new(session.clone());

    let summary = harness
        .orchestrator(
            ToolAvailability {
                rsync: true,
                sshpass: false,
            },
            Arc::default(),
        )
        .deploy(local.path(), &in_place_config())
        .await
        .unwrap();

    assert_eq!(summary.dependencies, ReconcileOutcome::Skipped);
    assert_eq!(session.count("npm install"), 0);
    assert!(harness.reporter.contains("skipping install"));
}

fn scripted_atomic_config() -> DeploymentConfig {
    let mut config = atomic_config(Path::new("/srv/app"), "v1");
    config.processes.clear();
    config
}

#[tokio::test]
async fn test_failed_activation_leaves_marker_untouched() {
    let local = npm_project();
    let session = Arc::new(ScriptedSession::new());
    session.respond("mv -Tf", vec![fail(1, "mv: cannot move"), ok("")]);
    let harness = Harness::new(session.clone());
    let orchestrator = harness.orchestrator(ToolAvailability::default(), Arc::default());

    let err = orchestrator
        .deploy(local.path(), &scripted_atomic_config())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ActivationError(ref m) if m.contains("cannot switch current")));
    assert_eq!(session.count("npm install"), 1);
    assert_eq!(session.count("> /srv/app/.lockhash"), 0);
    assert_eq!(session.count("rm -f /srv/app/current.tmp-"), 1);
    assert_eq!(session.dispose_count(), 1);
    assert_eq!(harness.states().last(), Some(&DeployState::Failed));

    // the next run cannot trust a marker, so it installs again
    tokio::time::sleep(Duration::from_millis(5)).await;
    let summary = orchestrator
        .deploy(local.path(), &scripted_atomic_config())
        .await
        .unwrap();

    assert_eq!(session.count("npm install"), 2);
    assert_eq!(
        summary.dependencies,
        ReconcileOutcome::Installed {
            nuclear_retry: false,
            rebuilt: true,
            marker_written: true,
        }
    );
    let commands = session.commands();
    let switched = commands.iter().rposition(|c| c.contains("mv -Tf")).unwrap();
    let marker = session.position("> /srv/app/.lockhash").unwrap();
    assert!(marker > switched);
    assert_eq!(session.count("> /srv/app/.lockhash"), 1);
    assert_eq!(session.dispose_count(), 2);
}

#[tokio::test]
async fn test_env_write_failure_after_install_is_fatal() {
    let local = npm_project();
    let session = rsync_session();
    session.respond("> /srv/app/.env", vec![fail(1, "No space left on device")]);
    let harness = Harness::new(session.clone());

    let err = harness
        .orchestrator(
            ToolAvailability {
                rsync: true,
                sshpass: false,
            },
            Arc::default(),
        )
        .deploy(local.path(), &in_place_config())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ActivationError(ref m) if m.contains("No space left")));
    assert_eq!(session.count("npm install"), 1);
    assert_eq!(session.count("pm2 reload"), 0);
    assert_eq!(session.dispose_count(), 1);
    assert_eq!(harness.states().last(), Some(&DeployState::Failed));
    assert!(matches!(
        harness.reporter.events().last(),
        Some(DeployEvent::Status { busy: false, .. })
    ));
}
