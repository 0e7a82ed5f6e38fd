//! FSM unit tests

use koram::deploy::fsm::{DeployFsm, DeployState, StageEvent};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeployFsm::new();
    assert_eq!(fsm.state(), DeployState::Idle);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.history(), &[DeployState::Idle]);
}

#[test]
fn test_fsm_visits_every_stage_in_order() {
    let mut fsm = DeployFsm::new();

    assert_eq!(fsm.process(StageEvent::Begin).unwrap(), DeployState::BuildingAndConnecting);
    assert_eq!(fsm.process(StageEvent::Prepared).unwrap(), DeployState::Transferring);
    assert_eq!(fsm.process(StageEvent::Transferred).unwrap(), DeployState::Reconciling);
    assert_eq!(fsm.process(StageEvent::Reconciled).unwrap(), DeployState::Activating);
    assert_eq!(fsm.process(StageEvent::Activated).unwrap(), DeployState::Restarting);
    assert_eq!(fsm.process(StageEvent::Restarted).unwrap(), DeployState::Done);

    assert_eq!(
        fsm.history(),
        &[
            DeployState::Idle,
            DeployState::BuildingAndConnecting,
            DeployState::Transferring,
            DeployState::Reconciling,
            DeployState::Activating,
            DeployState::Restarting,
            DeployState::Done,
        ]
    );
}

#[test]
fn test_fsm_fails_from_any_middle_stage() {
    let mut fsm = DeployFsm::new();
    fsm.process(StageEvent::Begin).unwrap();
    fsm.process(StageEvent::Prepared).unwrap();
    fsm.process(StageEvent::Fail("rsync exploded".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), DeployState::Failed);
    assert_eq!(fsm.error(), Some("rsync exploded"));
}

#[test]
fn test_fsm_rejects_skipped_stages() {
    let mut fsm = DeployFsm::new();
    assert!(fsm.process(StageEvent::Transferred).is_err());

    fsm.process(StageEvent::Begin).unwrap();
    assert!(fsm.process(StageEvent::Reconciled).is_err());
    assert_eq!(fsm.state(), DeployState::BuildingAndConnecting);
}

#[test]
fn test_fsm_terminal_states_are_final() {
    let mut fsm = DeployFsm::new();
    assert!(fsm.process(StageEvent::Fail("too early".to_string())).is_err());

    fsm.process(StageEvent::Begin).unwrap();
    fsm.process(StageEvent::Fail("boom".to_string())).unwrap();
    assert!(fsm.process(StageEvent::Begin).is_err());
    assert!(fsm.process(StageEvent::Fail("again".to_string())).is_err());
    assert_eq!(fsm.error(), Some("boom"));
    assert!(fsm.state().is_terminal());
}
