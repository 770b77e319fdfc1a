//! End-to-end rules: sources, window, sink and checkpointing under paused time.

use std::sync::Arc;
use std::time::Duration;

use edgeflow_core::checkpoint::{InMemoryStore, Store};
use edgeflow_core::runtime::{OperatorNode, SinkNode, SourceNode, Topology, WindowNode};
use edgeflow_core::time::VirtualClock;
use edgeflow_core::types::{Message, Qos, StreamEvent, Tuple, WindowTuplesSet};
use edgeflow_core::window::WindowConfig;
use edgeflow_core::{RuleOptions, StreamContext};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const ORIGIN_MS: i64 = 1_000_000;

fn message(value: Value) -> Message {
    value.as_object().cloned().unwrap_or_default()
}

async fn next_window(results: &mut mpsc::Receiver<StreamEvent>) -> WindowTuplesSet {
    match results.recv().await {
        Some(StreamEvent::Window(window)) => window,
        other => panic!("expected window, got {other:?}"),
    }
}

/// `sources` -> window -> sink.
fn build_rule(
    options: &RuleOptions,
    window: WindowConfig,
    sources: &[&str],
    store: Arc<InMemoryStore>,
    clock: Arc<VirtualClock>,
) -> (
    Topology,
    Vec<mpsc::Sender<Tuple>>,
    mpsc::Receiver<StreamEvent>,
) {
    let mut topology = Topology::new("rule", options.clone())
        .unwrap()
        .with_store(store)
        .with_clock(clock);
    let streams: Vec<String> = sources.iter().map(|s| s.to_string()).collect();
    let window = WindowNode::new("window", window, streams, options).unwrap();
    let (sink, results) = SinkNode::new("sink", options);
    topology.add_operator(window).unwrap();
    topology.add_sink(sink).unwrap();

    let mut feeds = Vec::new();
    for name in sources {
        let (source, feed) = SourceNode::channel(name, 64);
        let source = if options.is_event_time {
            source.with_timestamp_field("ts")
        } else {
            source
        };
        topology.add_source(source).unwrap();
        topology.connect(name, "window").unwrap();
        feeds.push(feed);
    }
    topology.connect("window", "sink").unwrap();
    (topology, feeds, results)
}

#[tokio::test(start_paused = true)]
async fn tumbling_rule_with_at_least_once_checkpoints() {
    let options = RuleOptions {
        qos: Qos::AtLeastOnce,
        checkpoint_interval: 300,
        ..RuleOptions::default()
    };
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(VirtualClock::new(ORIGIN_MS));
    let (mut topology, feeds, mut results) = build_rule(
        &options,
        WindowConfig::tumbling(1_000),
        &["demo"],
        store.clone(),
        clock,
    );
    topology.open().await.unwrap();

    for i in 0..5 {
        feeds[0]
            .send(Tuple::new("demo", message(json!({ "i": i })), 0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let window = next_window(&mut results).await;
    assert_eq!(window.window_end, ORIGIN_MS + 1_000);
    assert_eq!(
        window.timestamps(),
        vec![ORIGIN_MS, ORIGIN_MS + 100, ORIGIN_MS + 200, ORIGIN_MS + 300, ORIGIN_MS + 400]
    );

    let coordinator = topology.coordinator().unwrap();
    assert!(coordinator.complete_count().unwrap() >= 3);
    assert!(coordinator.latest().unwrap() >= Some(ORIGIN_MS + 900));
    assert_eq!(
        store.restore_state("demo").unwrap().get("$$offset"),
        Some(&json!(5))
    );
    assert_eq!(topology.stats("window").unwrap().records_out, 1);

    topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn restarted_rule_resumes_window_from_checkpoint() {
    let options = RuleOptions {
        qos: Qos::AtLeastOnce,
        checkpoint_interval: 300,
        ..RuleOptions::default()
    };
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(VirtualClock::new(ORIGIN_MS));

    let (mut first, feeds, _results) = build_rule(
        &options,
        WindowConfig::tumbling(1_000),
        &["demo"],
        store.clone(),
        clock.clone(),
    );
    first.open().await.unwrap();
    for i in 0..3 {
        feeds[0]
            .send(Tuple::new("demo", message(json!({ "i": i })), 0))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(first.coordinator().unwrap().complete_count().unwrap(), 1);
    first.close().await.unwrap();

    let (mut second, _feeds, mut results) = build_rule(
        &options,
        WindowConfig::tumbling(1_000),
        &["demo"],
        store.clone(),
        clock,
    );
    second.open().await.unwrap();

    let window = next_window(&mut results).await;
    assert_eq!(window.len(), 3);
    assert!(window.window_end >= ORIGIN_MS + 1_400);
    second.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exactly_once_rule_aligns_two_sources() {
    let options = RuleOptions {
        qos: Qos::ExactlyOnce,
        checkpoint_interval: 250,
        ..RuleOptions::default()
    };
    let store = Arc::new(InMemoryStore::new());
    let (mut topology, feeds, mut results) = build_rule(
        &options,
        WindowConfig::tumbling(1_000),
        &["a", "b"],
        store.clone(),
        Arc::new(VirtualClock::new(ORIGIN_MS)),
    );
    topology.open().await.unwrap();

    for i in 0..4 {
        for feed in &feeds {
            feed.send(Tuple::new("", message(json!({ "i": i })), 0))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let window = next_window(&mut results).await;
    assert_eq!(window.len(), 8);
    assert_eq!(window.content.len(), 2);
    assert!(topology.coordinator().unwrap().complete_count().unwrap() >= 3);
    assert_eq!(
        store.restore_state("a").unwrap().get("$$offset"),
        Some(&json!(4))
    );

    topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn event_time_rule_fires_on_watermarks_and_drops_late_tuples() {
    let options = RuleOptions {
        is_event_time: true,
        ..RuleOptions::default()
    };
    let (mut topology, feeds, mut results) = build_rule(
        &options,
        WindowConfig::tumbling(100),
        &["demo"],
        Arc::new(InMemoryStore::new()),
        Arc::new(VirtualClock::new(0)),
    );
    topology.open().await.unwrap();

    for ts in [10, 50, 120, 250] {
        feeds[0]
            .send(Tuple::new("demo", message(json!({ "ts": ts })), 0))
            .await
            .unwrap();
    }
    let first = next_window(&mut results).await;
    let second = next_window(&mut results).await;
    assert_eq!((first.window_end, second.window_end), (100, 200));
    assert_eq!(first.timestamps(), vec![10, 50]);
    assert_eq!(second.timestamps(), vec![120]);

    for ts in [30, 400] {
        feeds[0]
            .send(Tuple::new("demo", message(json!({ "ts": ts })), 0))
            .await
            .unwrap();
    }
    let third = next_window(&mut results).await;
    let fourth = next_window(&mut results).await;
    assert_eq!(third.window_end, 300);
    assert_eq!(third.timestamps(), vec![250]);
    assert_eq!(fourth.timestamps(), vec![400]);

    topology.close().await.unwrap();
}

#[tokio::test]
async fn rule_finishes_when_feeds_close() {
    let options = RuleOptions::default();
    let mut topology = Topology::new("rule", options.clone()).unwrap();
    let (source, feed) = SourceNode::channel("demo", 8);
    let filter = OperatorNode::from_fn(
        "filter",
        |event, _ctx: &StreamContext| {
            let dropped =
                matches!(&event, StreamEvent::Tuple(tuple) if tuple.value("drop").is_some());
            Ok((!dropped).then_some(event))
        },
        &options,
    );
    let window = WindowNode::new("window", WindowConfig::not_window(), Vec::new(), &options).unwrap();
    let (sink, mut results) = SinkNode::new("sink", &options);
    topology.add_source(source).unwrap();
    topology.add_operator(filter).unwrap();
    topology.add_operator(window).unwrap();
    topology.add_sink(sink).unwrap();
    topology.connect("demo", "filter").unwrap();
    topology.connect("filter", "window").unwrap();
    topology.connect("window", "sink").unwrap();
    topology.open().await.unwrap();
    assert!(topology.coordinator().is_none());

    for value in [json!({"v": 1}), json!({"drop": true}), json!({"v": 2})] {
        feed.send(Tuple::new("demo", message(value), 0)).await.unwrap();
    }
    drop(feed);
    topology.wait().await.unwrap();

    let mut windows = 0;
    while let Some(event) = results.recv().await {
        assert!(matches!(event, StreamEvent::Window(_)));
        windows += 1;
    }
    assert_eq!(windows, 2);
}

#[test]
fn topology_rejects_invalid_wiring() {
    let options = RuleOptions::default();
    let mut topology = Topology::new("rule", options.clone()).unwrap();
    let (source, _feed) = SourceNode::channel("demo", 8);
    let (sink, _results) = SinkNode::new("sink", &options);
    topology.add_source(source).unwrap();
    topology.add_sink(sink).unwrap();

    let (duplicate, _feed) = SourceNode::channel("demo", 8);
    assert!(topology
        .add_source(duplicate)
        .unwrap_err()
        .to_string()
        .contains("duplicate node name"));
    assert!(topology.connect("sink", "demo").is_err());
    assert!(topology.connect("demo", "missing").is_err());
    assert!(topology.connect("demo", "demo").is_err());
    topology.connect("demo", "sink").unwrap();
}

#[tokio::test]
async fn topology_without_source_cannot_open() {
    let mut topology = Topology::new("rule", RuleOptions::default()).unwrap();
    let err = topology.open().await.unwrap_err();
    assert!(err.to_string().contains("has no source"));
}

#[test]
fn invalid_options_are_rejected() {
    let options = RuleOptions {
        qos: Qos::ExactlyOnce,
        checkpoint_interval: 0,
        ..RuleOptions::default()
    };
    let err = Topology::new("rule", options).err().unwrap();
    assert!(err.to_string().contains("checkpointInterval"));
}
