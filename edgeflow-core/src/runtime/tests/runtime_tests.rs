use super::*;
use crate::channel::local_channel;
use crate::checkpoint::{signal_channel, Responder, SignalMessage};
use crate::config::RuleOptions;
use crate::context::StreamContext;
use crate::time::VirtualClock;
use crate::types::{Barrier, Message, Qos, StreamEvent, StreamItem, Tuple, WindowTuplesSet};
use crate::window::WindowConfig;
use anyhow::anyhow;
use serde_json::{json, Value};
use std::sync::Arc;

fn message(value: Value) -> Message {
    value.as_object().cloned().unwrap_or_default()
}

fn tuple_item(emitter: &str, timestamp: i64) -> StreamItem {
    StreamItem::Event(StreamEvent::Tuple(Tuple::new(
        emitter,
        Message::new(),
        timestamp,
    )))
}

fn expect_tuple(item: Option<StreamItem>) -> Tuple {
    match item.map(StreamItem::into_event) {
        Some(StreamEvent::Tuple(tuple)) => tuple,
        other => panic!("expected tuple, got {other:?}"),
    }
}

fn expect_window(item: Option<StreamItem>) -> WindowTuplesSet {
    match item.map(StreamItem::into_event) {
        Some(StreamEvent::Window(window)) => window,
        other => panic!("expected window, got {other:?}"),
    }
}

fn expect_error(item: Option<StreamItem>) -> String {
    match item.map(StreamItem::into_event) {
        Some(StreamEvent::Error(message)) => message,
        other => panic!("expected error, got {other:?}"),
    }
}

// ── Emitter ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_emitter_tags_items_only_when_checkpointed() {
    let (tx, mut rx) = local_channel(4);
    let mut emitter = Emitter::new("src");
    emitter.add_output(tx);

    emitter
        .broadcast(StreamEvent::Error("plain".into()))
        .await
        .unwrap();
    assert!(matches!(rx.recv().await, Some(StreamItem::Event(_))));

    emitter.set_qos(Qos::ExactlyOnce);
    emitter
        .broadcast(StreamEvent::Error("tagged".into()))
        .await
        .unwrap();
    match rx.recv().await {
        Some(StreamItem::Tagged(tagged)) => assert_eq!(tagged.channel, "src"),
        other => panic!("expected tagged item, got {other:?}"),
    }
}

#[tokio::test]
async fn test_emitter_broadcasts_to_every_output() {
    let (tx1, mut rx1) = local_channel(4);
    let (tx2, mut rx2) = local_channel(4);
    let mut emitter = Emitter::new("src");
    emitter.add_output(tx1);
    emitter.add_output(tx2);
    assert_eq!(emitter.output_count(), 2);

    emitter.broadcast(tuple_item("src", 1).into_event()).await.unwrap();
    assert_eq!(expect_tuple(rx1.recv().await).timestamp, 1);
    assert_eq!(expect_tuple(rx2.recv().await).timestamp, 1);
}

#[test]
fn test_try_broadcast_drops_on_full_output() {
    let (tx, _rx) = local_channel(1);
    let mut emitter = Emitter::new("src");
    emitter.add_output(tx);

    assert_eq!(emitter.try_broadcast(StreamEvent::Error("a".into())).unwrap(), 0);
    assert_eq!(emitter.try_broadcast(StreamEvent::Error("b".into())).unwrap(), 1);
}

#[test]
fn test_try_broadcast_fails_on_closed_output() {
    let (tx, rx) = local_channel(1);
    drop(rx);
    let mut emitter = Emitter::new("src");
    emitter.add_output(tx);
    assert!(emitter.try_broadcast(StreamEvent::Error("a".into())).is_err());
}

// ── Stats ─────────────────────────────────────────────────────────────────

#[test]
fn test_stat_manager_snapshot() {
    let stats = StatManager::new();
    stats.inc_records_in();
    stats.inc_records_in();
    stats.inc_records_out();
    stats.inc_exceptions("bad tuple");
    stats.set_buffer_length(3);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.records_in, 2);
    assert_eq!(snapshot.records_out, 1);
    assert_eq!(snapshot.exceptions, 1);
    assert_eq!(snapshot.buffer_length, 3);
    assert_eq!(snapshot.last_exception.as_deref(), Some("bad tuple"));
}

// ── Source ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_source_stamps_emitter_and_tracks_offset() {
    let (source, feed) = SourceNode::channel("src", 8);
    let mut source = source.preserve_timestamps();
    let (out_tx, mut out_rx) = local_channel(8);
    source.add_output(out_tx).unwrap();
    let stats = source.stats();
    let ctx = StreamContext::new("rule").with_operator("src");
    let handle = Box::new(source).exec(ctx.clone());

    feed.send(Tuple::new("ignored", Message::new(), 7))
        .await
        .unwrap();
    feed.send(Tuple::new("ignored", Message::new(), 9))
        .await
        .unwrap();
    let first = expect_tuple(out_rx.recv().await);
    assert_eq!(first.emitter, "src");
    assert_eq!(first.timestamp, 7);
    assert_eq!(expect_tuple(out_rx.recv().await).timestamp, 9);

    drop(feed);
    handle.await.unwrap().unwrap();
    assert_eq!(ctx.get_state::<u64>(OFFSET_KEY).unwrap(), Some(2));
    assert_eq!(stats.snapshot().records_out, 2);
}

#[tokio::test(start_paused = true)]
async fn test_source_uses_clock_for_ingestion_time() {
    let (mut source, feed) = SourceNode::channel("src", 8);
    source.set_clock(Arc::new(VirtualClock::new(5_000)));
    let (out_tx, mut out_rx) = local_channel(8);
    source.add_output(out_tx).unwrap();
    let ctx = StreamContext::new("rule").with_operator("src");
    let handle = Box::new(source).exec(ctx);

    feed.send(Tuple::new("src", Message::new(), 0)).await.unwrap();
    assert_eq!(expect_tuple(out_rx.recv().await).timestamp, 5_000);

    drop(feed);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_source_reads_event_time_field() {
    let (source, feed) = SourceNode::channel("src", 8);
    let mut source = source.with_timestamp_field("ts");
    let (out_tx, mut out_rx) = local_channel(8);
    source.add_output(out_tx).unwrap();
    let handle = Box::new(source).exec(StreamContext::new("rule").with_operator("src"));

    feed.send(Tuple::new("src", message(json!({"ts": 42, "v": 1})), 0))
        .await
        .unwrap();
    feed.send(Tuple::new("src", message(json!({"v": 2})), 0))
        .await
        .unwrap();

    assert_eq!(expect_tuple(out_rx.recv().await).timestamp, 42);
    let error = expect_error(out_rx.recv().await);
    assert!(error.contains("timestamp field ts"));

    drop(feed);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_source_injects_barrier_and_acks() {
    let (mut source, feed) = SourceNode::channel("src", 8);
    source.set_qos(Qos::AtLeastOnce);
    let (out_tx, mut out_rx) = local_channel(8);
    source.add_output(out_tx).unwrap();
    let (signal, mut signal_rx) = signal_channel();
    let ctx = StreamContext::new("rule").with_operator("src");
    let responder = source.responder(&ctx, signal);
    let handle = Box::new(source).exec(ctx);

    responder.trigger_checkpoint(5).await.unwrap();
    match out_rx.recv().await {
        Some(StreamItem::Tagged(tagged)) => {
            assert_eq!(tagged.channel, "src");
            assert_eq!(tagged.data, StreamEvent::Barrier(Barrier::new(5, "src")));
        }
        other => panic!("expected tagged barrier, got {other:?}"),
    }
    let signal = signal_rx.recv().await.unwrap();
    assert_eq!(signal.message, SignalMessage::Ack);
    assert_eq!(signal.barrier, Barrier::new(5, "src"));

    drop(feed);
    handle.await.unwrap().unwrap();
    let err = responder.trigger_checkpoint(6).await.unwrap_err();
    assert!(err.to_string().contains("source is not running"));
}

// ── Operator ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_operator_maps_filters_and_reports_errors() {
    let options = RuleOptions::default();
    let mut node = OperatorNode::from_fn(
        "double",
        |event, _ctx: &StreamContext| match event {
            StreamEvent::Tuple(mut tuple) => {
                if tuple.value("skip").is_some() {
                    return Ok(None);
                }
                let v = tuple
                    .value("v")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| anyhow!("field v is missing"))?;
                tuple.message.insert("v".to_string(), json!(v * 2));
                Ok(Some(StreamEvent::Tuple(tuple)))
            }
            other => Ok(Some(other)),
        },
        &options,
    );
    let (out_tx, mut out_rx) = local_channel(8);
    node.add_output(out_tx).unwrap();
    let input = node.input().unwrap();
    let stats = node.stats();
    let handle = Box::new(node).exec(StreamContext::new("rule").with_operator("double"));

    for value in [json!({"v": 2}), json!({"skip": true}), json!({"w": 1})] {
        input
            .send(StreamItem::Event(StreamEvent::Tuple(Tuple::new(
                "src",
                message(value),
                1,
            ))))
            .await
            .unwrap();
    }

    assert_eq!(expect_tuple(out_rx.recv().await).value("v"), Some(&json!(4)));
    assert!(expect_error(out_rx.recv().await).contains("field v is missing"));

    drop(input);
    handle.await.unwrap().unwrap();
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.records_in, 3);
    assert_eq!(snapshot.records_out, 1);
    assert_eq!(snapshot.exceptions, 1);
}

#[test]
fn test_node_input_unavailable_after_start() {
    let mut core = NodeCore::new("op", 4);
    assert!(core.input().is_ok());
    let _inputs = core.start().unwrap();
    assert!(core.input().is_err());
    assert!(core.start().is_err());
}

// ── Sink ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sink_drops_errors_unless_send_error() {
    let options = RuleOptions {
        send_error: false,
        ..RuleOptions::default()
    };
    let (sink, mut results) = SinkNode::new("sink", &options);
    let input = sink.input().unwrap();
    let stats = sink.stats();
    let handle = Box::new(sink).exec(StreamContext::new("rule").with_operator("sink"));

    input
        .send(StreamItem::Event(StreamEvent::Error("boom".into())))
        .await
        .unwrap();
    input.send(tuple_item("src", 3)).await.unwrap();
    drop(input);
    handle.await.unwrap().unwrap();

    match results.recv().await {
        Some(StreamEvent::Tuple(tuple)) => assert_eq!(tuple.timestamp, 3),
        other => panic!("expected tuple, got {other:?}"),
    }
    assert!(results.recv().await.is_none());
    assert_eq!(stats.snapshot().exceptions, 1);
}

#[test]
fn test_sink_rejects_outputs() {
    let (mut sink, _results) = SinkNode::new("sink", &RuleOptions::default());
    let (tx, _rx) = local_channel(1);
    let err = sink.add_output(tx).unwrap_err();
    assert!(err.to_string().contains("cannot have outputs"));
}

// ── Window node ───────────────────────────────────────────────────────────

fn window_node(
    config: WindowConfig,
    options: &RuleOptions,
    clock: Arc<VirtualClock>,
) -> (WindowNode, crate::channel::LocalChannelSender, crate::channel::LocalChannelReceiver) {
    let mut node = WindowNode::new("window", config, vec!["demo".to_string()], options).unwrap();
    node.set_clock(clock);
    let (out_tx, out_rx) = local_channel(16);
    node.add_output(out_tx).unwrap();
    let input = node.input().unwrap();
    (node, input, out_rx)
}

#[tokio::test(start_paused = true)]
async fn test_window_node_tumbling_fires_on_tick() {
    let clock = Arc::new(VirtualClock::new(10_000));
    let (node, input, mut out_rx) = window_node(
        WindowConfig::tumbling(1_000),
        &RuleOptions::default(),
        clock,
    );
    let ctx = StreamContext::new("rule").with_operator("window");
    let handle = Box::new(node).exec(ctx.clone());

    input.send(tuple_item("demo", 10_100)).await.unwrap();
    input.send(tuple_item("demo", 10_200)).await.unwrap();

    let window = expect_window(out_rx.recv().await);
    assert_eq!(window.window_end, 11_000);
    assert_eq!(window.timestamps(), vec![10_100, 10_200]);

    ctx.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_window_node_session_closes_after_gap() {
    let clock = Arc::new(VirtualClock::new(10_000));
    let (node, input, mut out_rx) = window_node(
        WindowConfig::session(60_000, 500),
        &RuleOptions::default(),
        clock,
    );
    let ctx = StreamContext::new("rule").with_operator("window");
    let handle = Box::new(node).exec(ctx.clone());

    input.send(tuple_item("demo", 10_000)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    input.send(tuple_item("demo", 10_300)).await.unwrap();

    let window = expect_window(out_rx.recv().await);
    assert_eq!(window.window_end, 10_800);
    assert_eq!(window.timestamps(), vec![10_000, 10_300]);

    ctx.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_window_node_gap_starts_new_session() {
    let clock = Arc::new(VirtualClock::new(10_000));
    let (node, input, mut out_rx) = window_node(
        WindowConfig::session(60_000, 1_000),
        &RuleOptions::default(),
        clock,
    );
    let ctx = StreamContext::new("rule").with_operator("window");
    let handle = Box::new(node).exec(ctx.clone());

    input.send(tuple_item("demo", 10_000)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(900)).await;
    input.send(tuple_item("demo", 10_900)).await.unwrap();

    let first = expect_window(out_rx.recv().await);
    assert_eq!(first.window_end, 11_900);
    assert_eq!(first.timestamps(), vec![10_000, 10_900]);

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    input.send(tuple_item("demo", 12_400)).await.unwrap();

    let second = expect_window(out_rx.recv().await);
    assert_eq!(second.window_end, 13_400);
    assert_eq!(second.timestamps(), vec![12_400]);

    ctx.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_window_node_event_time_fires_on_watermark() {
    let options = RuleOptions {
        is_event_time: true,
        ..RuleOptions::default()
    };
    let (node, input, mut out_rx) = window_node(
        WindowConfig::tumbling(10),
        &options,
        Arc::new(VirtualClock::new(0)),
    );
    let ctx = StreamContext::new("rule").with_operator("window");
    let handle = Box::new(node).exec(ctx.clone());

    input.send(tuple_item("demo", 3)).await.unwrap();
    input.send(tuple_item("demo", 12)).await.unwrap();

    let window = expect_window(out_rx.recv().await);
    assert_eq!(window.window_end, 10);
    assert_eq!(window.timestamps(), vec![3]);

    ctx.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_window_node_reports_unexpected_payload() {
    let (node, input, mut out_rx) = window_node(
        WindowConfig::not_window(),
        &RuleOptions::default(),
        Arc::new(VirtualClock::new(0)),
    );
    let handle = Box::new(node).exec(StreamContext::new("rule").with_operator("window"));

    input
        .send(StreamItem::Event(StreamEvent::Window(WindowTuplesSet::new(5))))
        .await
        .unwrap();
    let error = expect_error(out_rx.recv().await);
    assert!(error.contains("expects a tuple but got a window"));

    input.send(tuple_item("demo", 7)).await.unwrap();
    assert_eq!(expect_window(out_rx.recv().await).timestamps(), vec![7]);

    drop(input);
    handle.await.unwrap().unwrap();
}
