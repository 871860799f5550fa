//! Registry routing observed from outside the crate.

use std::sync::Arc;

use brokerframe::{
    BrokerMessage,
    CallbackRegistry,
    PushResponseCallback,
    ResponseConfig,
    ResponseSink,
    SessionContext,
};
use brokerframe_testing::{CollectingHandler, LoggerHandle, TestResult, logger, response};
use rstest::rstest;

mod common;
use common::SilentBroker;

struct Counting(std::sync::atomic::AtomicUsize);

impl ResponseSink for Counting {
    fn on_response(&self, _message: BrokerMessage) {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn on_broker_down(&self, _node_down: bool) {}

    fn close(&self) {}
}

#[rstest]
fn late_delivery_is_logged_and_dropped(mut logger: LoggerHandle) {
    let registry = CallbackRegistry::new();
    let sink = Arc::new(Counting(0.into()));
    let id = registry.register(&sink);
    assert!(registry.route(id, response(1)));
    assert!(registry.unregister(id));

    assert!(!registry.route(id, response(2)));
    assert_eq!(sink.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(logger.contains(&format!("dropping message for unregistered sink: id={id}")));
}

#[rstest]
fn dropped_sinks_are_pruned() {
    let registry = CallbackRegistry::new();
    let kept = Arc::new(Counting(0.into()));
    let kept_id = registry.register(&kept);
    let dropped_id = {
        let transient = Arc::new(Counting(0.into()));
        registry.register(&transient)
    };

    assert!(!registry.route(dropped_id, response(1)));
    assert_eq!(registry.active_ids(), vec![kept_id]);
}

#[rstest]
#[tokio::test]
async fn consumers_share_a_session_registry(mut logger: LoggerHandle) -> TestResult {
    let session = SessionContext::new("session-1");
    let first = CollectingHandler::new();
    let second = CollectingHandler::new();
    let callbacks = [first.clone(), second.clone()].map(|handler| {
        PushResponseCallback::new(
            session.clone(),
            Arc::new(SilentBroker),
            ResponseConfig::default(),
            handler,
        )
    });
    for callback in &callbacks {
        callback.start_listening().await?;
    }
    assert!(logger.contains("response sink registered"));

    let ids: Vec<_> = callbacks
        .iter()
        .filter_map(PushResponseCallback::registration_id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    session.registry().route(ids[0], response(1));
    session.registry().route(ids[0], response(2));
    session.registry().route(ids[1], response(7));
    session.registry().route(ids[1], response(8));

    assert_eq!(first.numbers(), vec![1]);
    assert_eq!(second.numbers(), vec![7]);
    Ok(())
}
