use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event time in milliseconds since epoch.
pub type EventTime = i64;

/// Checkpoint identifier: wall-clock milliseconds at the time it was triggered.
///
/// Not guaranteed to be strictly monotonic, but compared as-is for ordering.
pub type CheckpointId = i64;

/// JSON object payload carried by a tuple.
pub type Message = Map<String, Value>;

/// Operator-local recovery state, keyed by state name.
pub type StateMap = HashMap<String, Value>;

/// Delivery semantics of a rule.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    /// No checkpointing at all.
    #[default]
    AtMostOnce,
    /// Barriers are tracked, data is never blocked.
    AtLeastOnce,
    /// Barriers are aligned across inputs before a checkpoint is taken.
    ExactlyOnce,
}

impl Qos {
    /// Return true if this level runs the checkpoint coordinator.
    pub fn is_checkpointed(self) -> bool {
        self >= Qos::AtLeastOnce
    }
}

/// A single data record in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    /// Name of the stream (source) that produced the tuple.
    pub emitter: String,
    pub message: Message,
    /// Ingestion time in processing-time mode, event time otherwise.
    pub timestamp: EventTime,
    #[serde(default)]
    pub metadata: Message,
}

impl Tuple {
    pub fn new(emitter: impl Into<String>, message: Message, timestamp: EventTime) -> Self {
        Self {
            emitter: emitter.into(),
            message,
            timestamp,
            metadata: Message::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Message) -> Self {
        self.metadata = metadata;
        self
    }

    /// Look up a message field.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.message.get(key)
    }
}

/// Synthetic event-time progress marker sharing the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatermarkTuple {
    pub timestamp: EventTime,
}

impl WatermarkTuple {
    pub fn new(timestamp: EventTime) -> Self {
        Self { timestamp }
    }

    pub fn timestamp(&self) -> EventTime {
        self.timestamp
    }

    pub fn is_watermark(&self) -> bool {
        true
    }
}

impl std::fmt::Display for WatermarkTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Watermark({}ms)", self.timestamp)
    }
}

/// Tuples of one emitter inside a fired window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowTuples {
    pub emitter: String,
    pub tuples: Vec<Tuple>,
}

/// Materialized contents of one fired window, grouped by emitter in
/// first-seen order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowTuplesSet {
    pub content: Vec<WindowTuples>,
    /// Trigger time that closed this window.
    pub window_end: EventTime,
}

impl WindowTuplesSet {
    pub fn new(window_end: EventTime) -> Self {
        Self {
            content: Vec::new(),
            window_end,
        }
    }

    /// Append a tuple to the group of its emitter.
    pub fn add_tuple(&mut self, tuple: Tuple) {
        match self
            .content
            .iter_mut()
            .find(|group| group.emitter == tuple.emitter)
        {
            Some(group) => group.tuples.push(tuple),
            None => self.content.push(WindowTuples {
                emitter: tuple.emitter.clone(),
                tuples: vec![tuple],
            }),
        }
    }

    /// Stable sort of every group by timestamp.
    pub fn sort(&mut self) {
        for group in &mut self.content {
            group.tuples.sort_by_key(|t| t.timestamp);
        }
    }

    /// Total number of tuples across all emitters.
    pub fn len(&self) -> usize {
        self.content.iter().map(|group| group.tuples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.content.iter().all(|group| group.tuples.is_empty())
    }

    pub fn tuples(&self) -> impl Iterator<Item = &Tuple> {
        self.content.iter().flat_map(|group| group.tuples.iter())
    }

    /// Timestamps of all tuples, group by group.
    pub fn timestamps(&self) -> Vec<EventTime> {
        self.tuples().map(|t| t.timestamp).collect()
    }
}

/// In-band checkpoint boundary marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Barrier {
    pub checkpoint_id: CheckpointId,
    /// Name of the task that emitted the barrier.
    pub op_id: String,
}

impl Barrier {
    pub fn new(checkpoint_id: CheckpointId, op_id: impl Into<String>) -> Self {
        Self {
            checkpoint_id,
            op_id: op_id.into(),
        }
    }
}

/// Everything that can travel on a data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    Tuple(Tuple),
    Window(WindowTuplesSet),
    Watermark(WatermarkTuple),
    Barrier(Barrier),
    /// In-band data error, forwarded instead of failing the operator.
    Error(String),
}

impl StreamEvent {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Tuple(_) => "tuple",
            StreamEvent::Window(_) => "window",
            StreamEvent::Watermark(_) => "watermark",
            StreamEvent::Barrier(_) => "barrier",
            StreamEvent::Error(_) => "error",
        }
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self, StreamEvent::Barrier(_))
    }
}

/// An in-flight event tagged with the upstream channel it came from.
///
/// Only produced when the rule runs with QoS >= at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferOrEvent {
    pub data: StreamEvent,
    pub channel: String,
}

impl BufferOrEvent {
    pub fn new(data: StreamEvent, channel: impl Into<String>) -> Self {
        Self {
            data,
            channel: channel.into(),
        }
    }
}

/// Unit sent over node channels: a bare event, or one tagged with its origin.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(StreamEvent),
    Tagged(BufferOrEvent),
}

impl StreamItem {
    /// Wrap `event` as the given QoS requires.
    pub fn wrap(event: StreamEvent, qos: Qos, channel: &str) -> Self {
        if qos.is_checkpointed() {
            StreamItem::Tagged(BufferOrEvent::new(event, channel))
        } else {
            StreamItem::Event(event)
        }
    }

    /// Drop the channel tag, if any.
    pub fn into_event(self) -> StreamEvent {
        match self {
            StreamItem::Event(event) => event,
            StreamItem::Tagged(tagged) => tagged.data,
        }
    }

    pub fn event(&self) -> &StreamEvent {
        match self {
            StreamItem::Event(event) => event,
            StreamItem::Tagged(tagged) => &tagged.data,
        }
    }
}
