//! Remote process status tests

use indexmap::IndexMap;
use koram::config::descriptor::EnvValue;
use koram::deploy::env::RemoteLoader;
use koram::deploy::supervisor::ProcessSupervisor;
use koram::errors::DeployError;
use koram::report::{Level, MemoryReporter};

use crate::support::{fail, ok, ScriptedSession};

const JLIST: &str = r#"[{"name":"web","pm_id":0,"pm2_env":{"status":"online"},"monit":{"cpu":3,"memory":104857600}},{"name":"queue","pm_id":1,"pm2_env":{"status":"errored"},"monit":{"cpu":0,"memory":0}}]"#;

#[tokio::test]
async fn test_status_lists_every_process() {
    let session = ScriptedSession::new();
    session.respond("pm2 jlist", vec![ok(&format!("{}\n", JLIST))]);
    let reporter = MemoryReporter::new();
    let supervisor = ProcessSupervisor::new(RemoteLoader::plain(), true);

    let processes = supervisor
        .report_status(&session, &reporter, "deploy@10.0.0.5")
        .await
        .unwrap();

    let names: Vec<&str> = processes.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["web", "queue"]);
    assert_eq!(processes[0].memory_mb(), 100);
    assert!(reporter.contains("Server: deploy@10.0.0.5"));

    let online = reporter.events_at(Level::Success);
    assert!(online.iter().any(|m| m.starts_with("web") && m.contains("100 MB")));
    let down = reporter.events_at(Level::Warn);
    assert!(down.iter().any(|m| m.starts_with("queue") && m.contains("errored")));
}

#[tokio::test]
async fn test_status_goes_through_remote_loader() {
    let session = ScriptedSession::new();
    session.respond("pm2 jlist", vec![ok("[]")]);
    let mut env = IndexMap::new();
    env.insert("PORT".to_string(), EnvValue::from("8080"));
    let supervisor = ProcessSupervisor::new(RemoteLoader::new(&env, &[], false), true);
    let reporter = MemoryReporter::new();

    let processes = supervisor
        .report_status(&session, &reporter, "deploy@10.0.0.5")
        .await
        .unwrap();

    assert!(processes.is_empty());
    assert!(reporter.contains("No pm2 processes"));
    assert_eq!(session.commands(), vec!["export PORT=8080; pm2 jlist".to_string()]);
}

#[tokio::test]
async fn test_status_failures() {
    let session = ScriptedSession::new();
    session.respond("pm2 jlist", vec![fail(127, "pm2: command not found"), ok("not json")]);
    let supervisor = ProcessSupervisor::new(RemoteLoader::plain(), true);

    let missing = supervisor.status(&session).await.unwrap_err();
    assert!(matches!(missing, DeployError::RemoteError(ref m) if m.contains("command not found")));

    let garbled = supervisor.status(&session).await.unwrap_err();
    assert!(matches!(garbled, DeployError::JsonError(_)));
}
