//! Heartbeat monitoring wired into a session and its consumers.

use std::{sync::Arc, time::Duration};

use brokerframe::{
    BrokerError,
    HeartbeatMonitor,
    PushResponseCallback,
    ResponseConfig,
    ResponseEnumerator,
    SessionContext,
    heartbeat::{BrokerIdentity, ProbeError},
};
use brokerframe_testing::{CollectingHandler, ScriptedProbeFactory, TestResult};
use rstest::{fixture, rstest};
use tokio::time::sleep;

mod common;
use common::{SilentBroker, heartbeat_config, session};

#[fixture]
fn unreachable() -> ScriptedProbeFactory {
    let probes = ScriptedProbeFactory::new();
    probes.set_fallback(Err(ProbeError::Failed("connection refused".into())));
    probes
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn lost_broker_unblocks_a_waiting_enumerator(
    session: SessionContext,
    unreachable: ScriptedProbeFactory,
) -> TestResult {
    let monitor = HeartbeatMonitor::start(heartbeat_config(2), Arc::new(unreachable.clone()));
    session.attach_heartbeat(&monitor);
    let mut enumerator =
        ResponseEnumerator::open(session.clone(), Arc::new(SilentBroker), ResponseConfig::default())
            .await?;

    assert_eq!(
        enumerator.move_next().await,
        Err(BrokerError::heartbeat_failure(true))
    );
    assert!(session.is_broker_lost());
    assert!(monitor.is_tripped());
    assert_eq!(unreachable.created(), 2);

    monitor.shutdown().await;
    assert!(unreachable.is_closed());
    Ok(())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn lost_broker_is_reported_to_push_handlers_once(
    session: SessionContext,
    unreachable: ScriptedProbeFactory,
) -> TestResult {
    let monitor = HeartbeatMonitor::start(heartbeat_config(3), Arc::new(unreachable));
    session.attach_heartbeat(&monitor);
    let handler = CollectingHandler::new();
    let callback = PushResponseCallback::new(
        session.clone(),
        Arc::new(SilentBroker),
        ResponseConfig::default(),
        handler.clone(),
    );
    callback.start_listening().await?;

    sleep(Duration::from_secs(10)).await;
    assert_eq!(handler.errors(), vec![BrokerError::heartbeat_failure(true)]);
    assert!(callback.is_closed());
    assert!(session.registry().active_ids().is_empty());
    Ok(())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn recycled_broker_is_reported_as_process_failure(session: SessionContext) -> TestResult {
    let probes = ScriptedProbeFactory::new();
    probes.push(Ok(BrokerIdentity::Token("broker-1".into())));
    probes.set_fallback(Ok(BrokerIdentity::Token("broker-2".into())));
    let monitor = HeartbeatMonitor::start(heartbeat_config(3), Arc::new(probes));
    session.attach_heartbeat(&monitor);
    let mut enumerator =
        ResponseEnumerator::open(session.clone(), Arc::new(SilentBroker), ResponseConfig::default())
            .await?;

    assert_eq!(
        enumerator.move_next().await,
        Err(BrokerError::heartbeat_failure(false))
    );
    assert!(!session.is_node_down());
    Ok(())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn healthy_broker_keeps_one_client(session: SessionContext) {
    let probes = ScriptedProbeFactory::new();
    let monitor = HeartbeatMonitor::start(heartbeat_config(1), Arc::new(probes.clone()));
    session.attach_heartbeat(&monitor);

    sleep(Duration::from_millis(10_500)).await;
    assert!(monitor.is_running());
    assert_eq!(monitor.missed_count(), 0);
    assert_eq!(probes.probes(), 10);
    assert_eq!(probes.created(), 1);
    assert!(!session.is_broker_lost());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn traffic_postpones_probing(session: SessionContext) {
    let probes = ScriptedProbeFactory::new();
    let monitor = HeartbeatMonitor::start(heartbeat_config(1), Arc::new(probes.clone()));
    session.attach_heartbeat(&monitor);

    for _ in 0..5 {
        sleep(Duration::from_millis(900)).await;
        session.reset_heartbeat();
    }
    assert_eq!(probes.probes(), 0);
}
