#![cfg(feature = "metrics")]
//! Tests for `broker_pubsub` metrics helpers.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.
use broker_pubsub::{MemoryBroker, PubSub, PubSubConfig, metrics as pubsub_metrics};
use broker_pubsub_testing::Probe;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rstest::rstest;

/// Creates a debugging recorder and snapshotter for metrics testing.
fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn assert_counter_eq(snapshotter: &Snapshotter, name: &str, expected: u64) {
    let metrics = snapshotter.snapshot().into_vec();
    assert!(
        metrics.iter().any(|(key, _, _, value)| {
            key.key().name() == name && matches!(value, DebugValue::Counter(c) if *c == expected)
        }),
        "expected {name} == {expected}, got {metrics:#?}"
    );
}

#[rstest]
#[case::callback(pubsub_metrics::Delivery::Callback, "callback")]
#[case::cursor(pubsub_metrics::Delivery::Cursor, "cursor")]
fn delivery_metric_is_labelled(#[case] delivery: pubsub_metrics::Delivery, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || pubsub_metrics::inc_delivered(delivery));

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == pubsub_metrics::MESSAGES_DELIVERED
            && k.key()
                .labels()
                .any(|l| l.key() == "sink" && l.value() == label)
            && matches!(v, DebugValue::Counter(c) if *c > 0)
    });
    assert!(found, "{label} delivery metric not recorded");
}

#[rstest]
#[case(1)]
#[case(3)]
fn listener_error_counter_counts(#[case] expected: u64) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        (0..expected).for_each(|_| pubsub_metrics::inc_listener_errors());
    });
    assert_counter_eq(&snapshotter, pubsub_metrics::LISTENER_ERRORS, expected);
}

#[test]
fn channel_gauge_tracks_activation_and_teardown() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        pubsub_metrics::inc_channels();
        pubsub_metrics::inc_channels();
        pubsub_metrics::dec_channels();
    });

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == pubsub_metrics::CHANNELS_ACTIVE
            && matches!(v, DebugValue::Gauge(g) if (g.into_inner() - 1.0).abs() < f64::EPSILON)
    });
    assert!(found, "channel gauge not recorded, got {metrics:#?}");
}

#[test]
fn adapter_records_acknowledged_publishes() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let broker = MemoryBroker::new();
            let pubsub: PubSub<Probe> = PubSub::new(broker.clone(), PubSubConfig::default());
            let cursor = pubsub.async_iterator("m").await.expect("cursor");
            for i in 0..2 {
                pubsub
                    .publish("m", &Probe::new(format!("m-{i}")))
                    .await
                    .expect("publish");
                cursor.next().await.expect("pull").expect("payload");
            }
            pubsub.close().await;
        });
    });

    assert_counter_eq(&snapshotter, pubsub_metrics::MESSAGES_PUBLISHED, 2);
}
