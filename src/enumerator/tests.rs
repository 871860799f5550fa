//! Tests for pull-model response enumeration.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use proptest::prelude::*;
use rstest::rstest;
use tokio::{task::yield_now, time::sleep};

use super::ResponseEnumerator;
use crate::{
    config::{ResponseConfig, WindowSize},
    error::BrokerError,
    message::{BrokerMessage, EndReason},
    registry::{RegistrationId, ResponseSink},
    session::SessionContext,
    test_support::{RecordingSource, eom, eom_with, number, response},
    transport::{Position, PullStrategy},
};

struct Harness {
    session: SessionContext,
    source: Arc<RecordingSource>,
    enumerator: ResponseEnumerator,
}

impl Harness {
    async fn open(config: ResponseConfig) -> Self {
        Self::open_with(config, RecordingSource::default()).await
    }

    async fn open_with(config: ResponseConfig, source: RecordingSource) -> Self {
        let session = SessionContext::new("session-1");
        let source = Arc::new(source);
        let enumerator = ResponseEnumerator::open(session.clone(), source.clone(), config)
            .await
            .expect("open enumerator");
        Self {
            session,
            source,
            enumerator,
        }
    }

    fn id(&self) -> RegistrationId { self.enumerator.registration_id().expect("registered") }

    fn push(&self, message: BrokerMessage) -> bool { self.session.registry().route(self.id(), message) }

    fn push_all(&self, range: std::ops::RangeInclusive<u32>) {
        for n in range {
            assert!(self.push(response(n)));
        }
    }

    async fn drain(&mut self) -> Vec<u32> {
        let mut numbers = Vec::new();
        while self.enumerator.move_next().await.expect("move next") {
            numbers.push(number(self.enumerator.current().expect("current item")));
        }
        numbers
    }
}

fn with_timeout(timeout: Duration) -> ResponseConfig {
    ResponseConfig::builder()
        .response_timeout(Some(timeout))
        .build()
        .expect("config")
}

fn windowed(size: usize) -> ResponseConfig {
    ResponseConfig::builder()
        .window_size(WindowSize::bounded(size).expect("window"))
        .response_timeout(Some(Duration::from_secs(5)))
        .build()
        .expect("config")
}

async fn settle() {
    for _ in 0..16 {
        yield_now().await;
    }
}

#[tokio::test]
async fn three_hundred_responses_arrive_in_two_windows() {
    let mut harness = Harness::open(windowed(256)).await;
    harness.push_all(1..=256);
    {
        let state = harness.enumerator.inner.lock_state();
        assert!(state.buffer.has_ready(), "full window sealed at capacity");
        assert_eq!(state.buffer.receiving_len(), 0);
    }
    harness.push_all(257..=300);
    assert_eq!(harness.enumerator.inner.lock_state().buffer.receiving_len(), 44);
    harness.push(eom(300));
    assert_eq!(harness.enumerator.inner.lock_state().buffer.receiving_len(), 0);

    assert_eq!(harness.drain().await, (1..=300).collect::<Vec<_>>());
    assert!(!harness.enumerator.move_next().await.expect("at end"));
}

#[rstest]
#[case::prefetch(PullStrategy::Prefetch, Some(512))]
#[case::single_window(PullStrategy::SingleWindow, Some(256))]
#[case::unbounded(PullStrategy::Unbounded, None)]
#[tokio::test]
async fn first_pull_follows_the_source_strategy(
    #[case] strategy: PullStrategy,
    #[case] count: Option<usize>,
) {
    let harness = Harness::open_with(windowed(256), RecordingSource::with_strategy(strategy)).await;
    let requests = harness.source.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].position, Position::Begin);
    assert_eq!(requests[0].count, count);
}

#[rstest]
#[case::prefetch(PullStrategy::Prefetch, 4)]
#[case::single_window(PullStrategy::SingleWindow, 2)]
#[tokio::test]
async fn next_window_is_requested_once_pulls_are_answered(
    #[case] strategy: PullStrategy,
    #[case] answered_after: u32,
) {
    let harness = Harness::open_with(windowed(2), RecordingSource::with_strategy(strategy)).await;
    harness.push_all(1..=answered_after - 1);
    settle().await;
    assert_eq!(harness.source.requests().len(), 1);

    harness.push(response(answered_after));
    settle().await;
    let requests = harness.source.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].position, Position::Current);
    assert_eq!(requests[1].count, Some(2));
}

#[tokio::test]
async fn unbounded_strategy_never_refills() {
    let harness =
        Harness::open_with(windowed(2), RecordingSource::with_strategy(PullStrategy::Unbounded))
            .await;
    harness.push_all(1..=10);
    settle().await;
    assert_eq!(harness.source.counts(), vec![None]);
}

#[tokio::test(start_paused = true)]
async fn timeout_without_data_is_an_error() {
    let timeout = Duration::from_millis(100);
    let mut harness = Harness::open(with_timeout(timeout)).await;
    assert_eq!(
        harness.enumerator.move_next().await,
        Err(BrokerError::ResponseTimeout(timeout))
    );
}

#[tokio::test(start_paused = true)]
async fn known_complete_stream_ends_without_error() {
    let mut harness = Harness::open(with_timeout(Duration::from_millis(100))).await;
    harness.push_all(1..=2);
    harness.push(eom(2));
    assert_eq!(harness.drain().await, vec![1, 2]);
    assert_eq!(harness.enumerator.move_next().await, Ok(false));

    let mut empty = Harness::open(with_timeout(Duration::from_millis(100))).await;
    empty.push(eom(0));
    assert_eq!(empty.enumerator.move_next().await, Ok(false));
}

#[tokio::test(start_paused = true)]
async fn partial_window_is_promoted_on_timeout() {
    let timeout = Duration::from_millis(100);
    let mut harness = Harness::open(with_timeout(timeout)).await;
    harness.push_all(1..=3);

    for expected in 1..=3 {
        assert_eq!(harness.enumerator.move_next().await, Ok(true));
        assert_eq!(number(harness.enumerator.current().expect("current")), expected);
    }
    assert_eq!(
        harness.enumerator.move_next().await,
        Err(BrokerError::ResponseTimeout(timeout))
    );
}

#[tokio::test(start_paused = true)]
async fn flush_ticker_releases_sparse_responses() {
    let config = ResponseConfig::builder()
        .flush_interval(Duration::from_millis(50))
        .build()
        .expect("config");
    let mut harness = Harness::open(config).await;
    harness.push_all(1..=2);

    let started = tokio::time::Instant::now();
    assert_eq!(harness.enumerator.move_next().await, Ok(true));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(harness.enumerator.move_next().await, Ok(true));
}

#[tokio::test(start_paused = true)]
async fn broker_down_unblocks_a_waiting_consumer() {
    let mut harness = Harness::open(ResponseConfig::default()).await;
    let session = harness.session.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(10)).await;
        session.broker_down(false);
    });

    assert_eq!(
        harness.enumerator.move_next().await,
        Err(BrokerError::heartbeat_failure(false))
    );

    harness.enumerator.close();
    assert_eq!(
        harness.enumerator.move_next().await,
        Err(BrokerError::heartbeat_failure(false)),
        "closed enumerator on a lost session still reports the failure"
    );
}

#[tokio::test]
async fn buffered_responses_drain_before_broker_failure() {
    let mut harness = Harness::open(windowed(2)).await;
    harness.push_all(1..=2);
    harness.enumerator.inner.on_broker_down(true);

    assert_eq!(harness.enumerator.move_next().await, Ok(true));
    assert_eq!(harness.enumerator.move_next().await, Ok(true));
    assert_eq!(
        harness.enumerator.move_next().await,
        Err(BrokerError::heartbeat_failure(true))
    );
}

#[rstest]
#[case::purged(EndReason::ClientPurged)]
#[case::timed_out(EndReason::ClientTimedOut)]
#[tokio::test]
async fn abnormal_end_overrides_buffered_data(#[case] reason: EndReason) {
    let mut harness = Harness::open(windowed(256)).await;
    harness.push(response(1));
    harness.push(eom_with(1, reason));

    let result = harness.enumerator.move_next().await;
    assert_eq!(result, Err(reason.error().expect("abnormal reason")));
}

#[tokio::test]
async fn client_fault_is_raised_in_sequence() {
    let mut harness = Harness::open(windowed(256)).await;
    harness.push(response(1));
    harness.push(BrokerMessage::ClientFault(BrokerError::decode("bad frame")));
    harness.push(response(2));
    harness.push(eom(2));

    assert_eq!(harness.enumerator.move_next().await, Ok(true));
    assert_eq!(
        harness.enumerator.move_next().await,
        Err(BrokerError::Decode("bad frame".into()))
    );
    assert!(harness.enumerator.current().is_none());
    assert_eq!(harness.enumerator.move_next().await, Ok(true));
    assert_eq!(number(harness.enumerator.current().expect("current")), 2);
    assert_eq!(harness.enumerator.move_next().await, Ok(false));
}

#[tokio::test]
async fn reset_replays_from_the_beginning() {
    let mut harness = Harness::open(windowed(4)).await;
    harness.push_all(1..=10);
    harness.push(eom(10));
    for _ in 0..3 {
        assert_eq!(harness.enumerator.move_next().await, Ok(true));
    }

    harness.enumerator.reset().await.expect("reset");
    assert!(harness.enumerator.current().is_none());
    let requests = harness.source.requests();
    let last = requests.last().expect("replay request");
    assert_eq!(last.position, Position::Begin);

    harness.push_all(1..=10);
    harness.push(eom(10));
    assert_eq!(harness.drain().await, (1..=10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn reset_proceeds_when_pulls_never_settle() {
    let mut harness = Harness::open(with_timeout(Duration::from_millis(100))).await;
    harness.push_all(1..=3);

    harness.enumerator.reset().await.expect("reset");
    assert_eq!(harness.source.requests().len(), 2);
    assert_eq!(harness.enumerator.inner.lock_state().buffer.receiving_len(), 0);
}

#[tokio::test]
async fn failed_refill_surfaces_after_buffered_items() {
    let harness_source = RecordingSource::with_strategy(PullStrategy::SingleWindow);
    let mut harness = Harness::open_with(windowed(1), harness_source).await;
    harness.source.fail_with(BrokerError::transport("connection reset"));
    harness.push(response(1));
    settle().await;

    assert_eq!(harness.enumerator.move_next().await, Ok(true));
    assert_eq!(
        harness.enumerator.move_next().await,
        Err(BrokerError::Transport("connection reset".into()))
    );
}

#[tokio::test]
async fn reset_recovers_from_a_failed_refill() {
    let source = RecordingSource::with_strategy(PullStrategy::SingleWindow);
    let mut harness = Harness::open_with(windowed(1), source).await;
    harness.source.fail_with(BrokerError::transport("connection reset"));
    harness.push(response(1));
    settle().await;
    assert_eq!(harness.enumerator.move_next().await, Ok(true));
    assert!(harness.enumerator.move_next().await.is_err());

    harness.source.recover();
    harness.enumerator.reset().await.expect("reset");
    harness.push(response(1));
    harness.push(eom(1));
    assert_eq!(harness.drain().await, vec![1]);
}

#[tokio::test]
async fn reset_keeps_a_lost_broker_terminal() {
    let mut harness = Harness::open(windowed(4)).await;
    harness.session.broker_down(true);
    assert_eq!(
        harness.enumerator.move_next().await,
        Err(BrokerError::heartbeat_failure(true))
    );

    assert_eq!(
        harness.enumerator.reset().await,
        Err(BrokerError::heartbeat_failure(true))
    );
    assert_eq!(harness.source.requests().len(), 1);
    assert_eq!(
        harness.enumerator.move_next().await,
        Err(BrokerError::heartbeat_failure(true))
    );
}

#[tokio::test]
async fn failed_open_unregisters() {
    let session = SessionContext::new("session-1");
    let source = Arc::new(RecordingSource::default());
    source.fail_with(BrokerError::transport("refused"));

    let result = ResponseEnumerator::open(session.clone(), source, ResponseConfig::default()).await;
    assert!(matches!(result, Err(BrokerError::Transport(_))));
    assert!(session.registry().active_ids().is_empty());
}

#[tokio::test]
async fn closed_enumerator_ends_quietly() {
    let mut harness = Harness::open(windowed(4)).await;
    let id = harness.id();
    harness.push(response(1));
    harness.enumerator.close();
    harness.enumerator.close();

    assert!(!harness.session.registry().route(id, response(2)));
    assert_eq!(harness.enumerator.move_next().await, Ok(false));
    harness.enumerator.reset().await.expect("reset is a no-op once closed");
    assert_eq!(harness.source.requests().len(), 1);
}

#[tokio::test]
async fn stream_adapter_yields_every_response() {
    let harness = Harness::open(windowed(3)).await;
    harness.push_all(1..=7);
    harness.push(eom(7));

    let items: Vec<_> = harness.enumerator.into_stream().collect().await;
    let numbers: Vec<_> = items
        .iter()
        .map(|item| number(item.as_ref().expect("response")))
        .collect();
    assert_eq!(numbers, (1..=7).collect::<Vec<_>>());
}

#[derive(Clone, Debug)]
enum Arrival {
    Response,
    Flush,
}

fn arrival() -> impl Strategy<Value = Arrival> {
    prop_oneof![4 => Just(Arrival::Response), 1 => Just(Arrival::Flush)]
}

proptest! {
    #[test]
    fn arrival_order_is_preserved(
        window in 1usize..8,
        arrivals in proptest::collection::vec(arrival(), 0..60),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let (yielded, total) = runtime.block_on(async {
            let source = RecordingSource::with_strategy(PullStrategy::Unbounded);
            let mut harness = Harness::open_with(windowed(window), source).await;
            let mut total = 0u32;
            for step in &arrivals {
                match step {
                    Arrival::Response => {
                        total += 1;
                        harness.push(response(total));
                    }
                    Arrival::Flush => {
                        harness.enumerator.inner.flush();
                    }
                }
            }
            harness.push(eom(u64::from(total)));
            (harness.drain().await, total)
        });
        prop_assert_eq!(yielded, (1..=total).collect::<Vec<_>>());
    }
}
