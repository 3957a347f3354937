mod common;

use common::Fixture;
use vmdrive::error::VmError;
use vmdrive::power::{PowerState, PowerVerb};

#[tokio::test]
async fn succeeds_on_third_probe() {
    let fx = Fixture::new();
    fx.transport.fail_probes(2);

    let attempts = fx.orchestrator.wait_until_ready("builder").await.unwrap();

    assert_eq!(attempts, 3);
    assert_eq!(fx.transport.probe_count(), 3);
}

#[tokio::test]
async fn times_out_after_exactly_num_tries() {
    let fx = Fixture::new();
    fx.transport.fail_probes(u32::MAX);

    let err = fx.orchestrator.wait_until_ready("builder").await.unwrap_err();

    assert!(matches!(err, VmError::ReadinessTimeout { attempts: 3, .. }));
    assert_eq!(fx.transport.probe_count(), 3);
}

#[tokio::test]
async fn start_with_wait_probes_until_ready() {
    let fx = Fixture::new();
    fx.transport.fail_probes(1);

    let state = fx
        .orchestrator
        .set_power("Builder", PowerVerb::Start, true)
        .await
        .unwrap();

    assert_eq!(state, PowerState::Running);
    assert_eq!(fx.transport.probe_count(), 2);
}

#[tokio::test]
async fn stop_never_probes() {
    let fx = Fixture::new();
    fx.orchestrator
        .set_power("builder", PowerVerb::Start, false)
        .await
        .unwrap();

    let state = fx
        .orchestrator
        .set_power("builder", PowerVerb::Stop, true)
        .await
        .unwrap();

    assert_eq!(state, PowerState::Stopped);
    assert_eq!(fx.transport.probe_count(), 0);
}

#[tokio::test]
async fn pausing_a_stopped_guest_is_rejected() {
    let fx = Fixture::new();
    let err = fx
        .orchestrator
        .set_power("builder", PowerVerb::Pause, false)
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::InvalidTransition { .. }));
}

#[tokio::test]
async fn unknown_guest_is_a_resolution_error() {
    let fx = Fixture::new();
    let err = fx.orchestrator.power_state("nobody").await.unwrap_err();
    assert!(matches!(err, VmError::Resolution { .. }));
}
