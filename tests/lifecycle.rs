//! Tests for adapter shutdown and channel lifecycle state.

use std::time::Duration;

use broker_pubsub::{
    ChannelState,
    MemoryBroker,
    PubSub,
    PubSubConfig,
    PubSubError,
    backoff::BackoffConfig,
};
use broker_pubsub_testing::{FaultyBroker, Probe, next_expect};
use rstest::rstest;
use tokio::time::{advance, timeout};

mod common;
use common::{TestResult, broker, faulty, impatient_pubsub, pubsub_over, settle};

#[rstest]
#[tokio::test]
async fn close_resolves_pending_pulls(broker: MemoryBroker) -> TestResult {
    let pubsub = pubsub_over(&broker);
    let cursor = pubsub.async_iterator("closing").await?;

    let (pulled, ()) = tokio::join!(cursor.next(), async {
        tokio::task::yield_now().await;
        pubsub.close().await;
    });
    assert_eq!(pulled?, None);
    assert!(cursor.is_terminated());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn close_stops_every_consumer(broker: MemoryBroker) -> TestResult {
    let pubsub = pubsub_over(&broker);
    pubsub.subscribe("a", |_: Probe| {}).await?;
    let _cursor = pubsub.async_iterator("b").await?;
    assert_eq!(pubsub.active_channels(), vec!["a".to_owned(), "b".to_owned()]);

    timeout(Duration::from_secs(1), pubsub.close()).await?;
    assert!(pubsub.is_closed());
    assert!(pubsub.active_channels().is_empty());
    assert_eq!(broker.consumer_count("a"), 0);
    assert_eq!(broker.consumer_count("b"), 0);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn operations_after_close_fail(broker: MemoryBroker) {
    let pubsub = pubsub_over(&broker);
    pubsub.close().await;

    assert!(matches!(
        pubsub.publish("x", &Probe::new("late")).await,
        Err(PubSubError::Closed)
    ));
    assert!(matches!(
        pubsub.subscribe("x", |_: Probe| {}).await,
        Err(PubSubError::Closed)
    ));
    assert!(matches!(
        pubsub.async_iterator("x").await,
        Err(PubSubError::Closed)
    ));
    assert_eq!(broker.produced("x"), 0);
}

#[rstest]
#[tokio::test]
async fn close_is_idempotent_across_clones(broker: MemoryBroker) -> TestResult {
    let pubsub = pubsub_over(&broker);
    let clone = pubsub.clone();
    pubsub.subscribe("a", |_: Probe| {}).await?;

    pubsub.close().await;
    clone.close().await;
    assert!(clone.is_closed());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn channel_state_passes_through_starting(faulty: FaultyBroker) -> TestResult {
    let pubsub = impatient_pubsub(&faulty);
    faulty.delay_start(Some(Duration::from_millis(20)));
    assert_eq!(pubsub.channel_state("s"), ChannelState::Unconsumed);

    let subscribing = pubsub.subscribe("s", |_: Probe| {});
    let (id, ()) = tokio::join!(subscribing, async {
        tokio::task::yield_now().await;
        assert_eq!(pubsub.channel_state("s"), ChannelState::Starting);
    });
    let id = id?;
    assert_eq!(pubsub.channel_state("s"), ChannelState::Active);

    pubsub.unsubscribe(id);
    assert_eq!(pubsub.channel_state("s"), ChannelState::Unconsumed);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn cancelled_subscribe_releases_channel(faulty: FaultyBroker) -> TestResult {
    let pubsub = impatient_pubsub(&faulty);
    faulty.delay_start(Some(Duration::from_millis(500)));

    let abandoned = timeout(Duration::from_millis(5), pubsub.subscribe("c", |_: Probe| {})).await;
    assert!(abandoned.is_err(), "subscribe should still be pending");
    assert_eq!(pubsub.channel_state("c"), ChannelState::Unconsumed);

    faulty.delay_start(None);
    pubsub.subscribe("c", |_: Probe| {}).await?;
    assert_eq!(pubsub.channel_state("c"), ChannelState::Active);
    pubsub.close().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn broker_ending_stream_tears_channel_down(broker: MemoryBroker) -> TestResult {
    let pubsub = pubsub_over(&broker);
    let cursor = pubsub.async_iterator("ending").await?;

    broker.shutdown();
    let pulled = timeout(Duration::from_secs(1), cursor.next()).await??;
    assert_eq!(pulled, None);
    settle().await;
    assert_eq!(pubsub.channel_state("ending"), ChannelState::Unconsumed);
    assert_eq!(pubsub.listener_count("ending"), 0);

    pubsub.close().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn buffered_payloads_survive_broker_stream_end(broker: MemoryBroker) -> TestResult {
    let pubsub = pubsub_over(&broker);
    let cursor = pubsub.async_iterator("draining").await?;
    pubsub.publish("draining", &Probe::new("d-0")).await?;
    pubsub.publish("draining", &Probe::new("d-1")).await?;

    broker.shutdown();
    settle().await;
    assert_eq!(pubsub.channel_state("draining"), ChannelState::Unconsumed);
    assert!(!cursor.is_terminated());

    assert_eq!(next_expect!(cursor), Probe::new("d-0"));
    assert_eq!(next_expect!(cursor), Probe::new("d-1"));
    assert_eq!(cursor.next().await?, None);
    assert!(cursor.is_terminated());

    pubsub.close().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn stream_end_releases_callback_that_owns_a_cursor(broker: MemoryBroker) -> TestResult {
    let pubsub = pubsub_over(&broker);
    let other = pubsub.async_iterator("other").await?;
    pubsub
        .subscribe("orders", move |_: Probe| {
            let _ = other.id();
        })
        .await?;

    broker.shutdown();
    settle().await;
    assert!(pubsub.active_channels().is_empty());

    timeout(Duration::from_secs(1), pubsub.close()).await?;
    Ok(())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failing_consumer_backs_off(faulty: FaultyBroker) -> TestResult {
    let config = PubSubConfig::builder()
        .consumer_backoff(BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        })
        .build()?;
    let pubsub: PubSub<Probe, FaultyBroker> = PubSub::new(faulty.clone(), config);
    faulty.fail_records(true);
    pubsub.subscribe("flaky", |_: Probe| {}).await?;

    settle().await;
    assert_eq!(faulty.record_errors(), 1);
    for (ms, expected) in [(5, 2), (10, 3), (20, 4), (20, 5)] {
        advance(Duration::from_millis(ms)).await;
        settle().await;
        assert_eq!(faulty.record_errors(), expected, "after advancing {ms}ms");
    }

    assert_eq!(pubsub.channel_state("flaky"), ChannelState::Active);
    pubsub.close().await;
    Ok(())
}
