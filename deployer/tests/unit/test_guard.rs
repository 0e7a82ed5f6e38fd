//! Busy guard tests

use koram::deploy::guard::{DeployGuard, GuardState};
use koram::errors::DeployError;

#[test]
fn test_second_deploy_is_rejected_while_first_runs() {
    let guard = DeployGuard::new();
    let permit = guard.try_acquire("production").unwrap();
    assert!(guard.is_busy());

    let other = guard.clone();
    assert!(matches!(other.try_acquire("staging"), Err(DeployError::Busy)));
    match guard.state() {
        GuardState::Busy { config, .. } => assert_eq!(config, "production"),
        GuardState::Idle => panic!("guard should be busy"),
    }

    drop(permit);
    assert!(!guard.is_busy());
    assert_eq!(other.state(), GuardState::Idle);
}

#[tokio::test]
async fn test_permit_released_when_task_ends() {
    let guard = DeployGuard::new();
    let permit = guard.try_acquire("production").unwrap();

    let handle = tokio::spawn(async move {
        let _permit = permit;
        tokio::task::yield_now().await;
    });
    handle.await.unwrap();

    assert!(!guard.is_busy());
    assert!(guard.try_acquire("production").is_ok());
}

#[test]
fn test_guard_state_serializes_tagged() {
    let guard = DeployGuard::new();
    let idle = serde_json::to_value(guard.state()).unwrap();
    assert_eq!(idle["state"], "idle");

    let _permit = guard.try_acquire("production").unwrap();
    let busy = serde_json::to_value(guard.state()).unwrap();
    assert_eq!(busy["state"], "busy");
    assert_eq!(busy["config"], "production");
}
