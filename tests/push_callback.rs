//! End-to-end tests for push-model delivery against an in-memory broker.

use std::{sync::Arc, time::Duration};

use brokerframe::{
    BrokerError,
    EndReason,
    PushResponseCallback,
    ResponseConfig,
    SessionContext,
    transport::Position,
};
use brokerframe_testing::{CollectingHandler, FakeBroker, TestResult, responses};
use rstest::rstest;

mod common;
use common::{broker, session, windowed};

const PATIENCE: Duration = Duration::from_secs(5);

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delivers_every_response_in_order(session: SessionContext) -> TestResult {
    let broker = broker(&session, 600);
    let handler = CollectingHandler::new();
    let callback = PushResponseCallback::new(
        session.clone(),
        broker.clone(),
        ResponseConfig::default(),
        handler.clone(),
    );
    callback.start_listening().await?;

    assert!(handler.wait_for(600, PATIENCE).await, "responses missing");
    assert_eq!(handler.numbers(), (1..=600).collect::<Vec<_>>());
    assert_eq!(handler.last_positions(), vec![599]);

    let requests = broker.requests();
    let positions: Vec<_> = requests.iter().map(|request| request.position).collect();
    assert_eq!(
        positions,
        vec![Position::Begin, Position::Current, Position::Current]
    );
    assert!(requests.iter().all(|request| request.count == Some(256)));
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_windows_still_deliver_everything(session: SessionContext) -> TestResult {
    let broker = broker(&session, 25);
    let handler = CollectingHandler::new();
    let callback =
        PushResponseCallback::new(session.clone(), broker.clone(), windowed(4), handler.clone());
    callback.start_listening().await?;

    assert!(handler.wait_for(25, PATIENCE).await, "responses missing");
    assert_eq!(handler.numbers(), (1..=25).collect::<Vec<_>>());
    assert_eq!(handler.last_positions(), vec![24]);
    assert_eq!(broker.requests().len(), 7);
    Ok(())
}

#[rstest]
#[case::purged(EndReason::ClientPurged)]
#[case::timed_out(EndReason::ClientTimedOut)]
#[tokio::test]
async fn abnormal_end_follows_the_delivered_responses(
    session: SessionContext,
    #[case] reason: EndReason,
) -> TestResult {
    let broker = Arc::new(
        FakeBroker::new(Arc::clone(session.registry()), responses(3)).ending_with(reason),
    );
    let handler = CollectingHandler::new();
    let callback = PushResponseCallback::new(
        session.clone(),
        broker,
        ResponseConfig::default(),
        handler.clone(),
    );
    callback.start_listening().await?;

    assert!(handler.wait_for(4, PATIENCE).await, "end marker missing");
    assert_eq!(handler.numbers(), vec![1, 2, 3]);
    assert!(handler.last_positions().is_empty());
    assert_eq!(handler.errors(), reason.error().into_iter().collect::<Vec<_>>());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn closing_the_session_registry_closes_callbacks(session: SessionContext) -> TestResult {
    let broker = Arc::new(FakeBroker::new(Arc::clone(session.registry()), Vec::new()));
    let handler = CollectingHandler::new();
    let callback = PushResponseCallback::new(
        session.clone(),
        broker,
        ResponseConfig::default(),
        handler.clone(),
    );
    callback.start_listening().await?;

    session.registry().close_all();
    assert!(callback.is_closed());
    assert!(session.registry().active_ids().is_empty());
    assert_eq!(
        callback.start_listening().await,
        Err(BrokerError::NotListening)
    );
    Ok(())
}
