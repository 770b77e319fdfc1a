//! Task traits and the plumbing shared by non-source nodes.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::task::JoinHandle;

use crate::channel::{
    local_channel, replay_channel, LocalChannelReceiver, LocalChannelSender, ReplayReceiver,
    ReplaySender, WeakChannelSender,
};
use crate::checkpoint::{BarrierAction, BarrierHandler, Responder, SignalSender, TaskResponder};
use crate::context::StreamContext;
use crate::runtime::{Emitter, StatManager};
use crate::time::Clock;
use crate::types::{Qos, StreamEvent, StreamItem};

/// A node of a rule topology, run as one tokio task.
pub trait Task: Send {
    fn name(&self) -> &str;

    fn set_qos(&mut self, qos: Qos);

    fn add_output(&mut self, output: LocalChannelSender) -> Result<()>;

    fn stats(&self) -> Arc<StatManager>;

    /// Clock used for ingestion and processing-time timestamps.
    fn set_clock(&mut self, _clock: Arc<dyn Clock>) {}

    /// Spawn the node loop. It runs until `ctx` is cancelled or its input
    /// closes.
    fn exec(self: Box<Self>, ctx: StreamContext) -> JoinHandle<Result<()>>;
}

/// A node that produces data and injects barriers when asked to.
pub trait SourceTask: Task {
    fn responder(&self, ctx: &StreamContext, signal: SignalSender) -> Arc<dyn Responder>;
}

/// A node with at least one upstream.
pub trait NonSourceTask: Task {
    /// Sender for upstreams. Fails once the node is running.
    fn input(&self) -> Result<LocalChannelSender>;

    fn input_count(&self) -> usize;

    fn add_input_count(&mut self);

    fn set_barrier_handler(&mut self, handler: Box<dyn BarrierHandler>);

    fn responder(&self, ctx: &StreamContext, signal: SignalSender) -> Arc<dyn Responder>;
}

/// Input, output and barrier plumbing embedded in every non-source node.
pub struct NodeCore {
    name: String,
    pub(crate) emitter: Emitter,
    pub(crate) stats: Arc<StatManager>,
    input_tx: Option<LocalChannelSender>,
    input_rx: Option<LocalChannelReceiver>,
    input_count: usize,
    handler: Option<Box<dyn BarrierHandler>>,
    replay_tx: ReplaySender,
    replay_rx: Option<ReplayReceiver>,
}

impl NodeCore {
    pub fn new(name: &str, buffer_length: usize) -> Self {
        let (input_tx, input_rx) = local_channel(buffer_length);
        let (replay_tx, replay_rx) = replay_channel();
        Self {
            name: name.to_string(),
            emitter: Emitter::new(name),
            stats: Arc::new(StatManager::new()),
            input_tx: Some(input_tx),
            input_rx: Some(input_rx),
            input_count: 0,
            handler: None,
            replay_tx,
            replay_rx: Some(replay_rx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_qos(&mut self, qos: Qos) {
        self.emitter.set_qos(qos);
    }

    pub fn add_output(&mut self, output: LocalChannelSender) {
        self.emitter.add_output(output);
    }

    pub fn input(&self) -> Result<LocalChannelSender> {
        self.input_tx
            .clone()
            .ok_or_else(|| anyhow!("node {} is already running", self.name))
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn add_input_count(&mut self) {
        self.input_count += 1;
    }

    pub fn set_barrier_handler(&mut self, mut handler: Box<dyn BarrierHandler>) {
        handler.set_output(self.replay_tx.clone());
        self.handler = Some(handler);
    }

    pub fn task_responder(&self, ctx: &StreamContext, signal: SignalSender) -> Arc<dyn Responder> {
        Arc::new(TaskResponder::new(
            self.name.clone(),
            ctx.clone(),
            self.emitter.clone(),
            signal,
        ))
    }

    /// Hand the receivers to the node loop.
    ///
    /// The node's own strong input sender is dropped here so the loop sees
    /// the input close once every upstream is gone.
    pub(crate) fn start(&mut self) -> Result<NodeInputs> {
        let input = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow!("node {} is already running", self.name))?;
        let replay = self
            .replay_rx
            .take()
            .ok_or_else(|| anyhow!("node {} is already running", self.name))?;
        let own_input = self
            .input_tx
            .take()
            .map(|sender| sender.downgrade())
            .ok_or_else(|| anyhow!("node {} is already running", self.name))?;
        Ok(NodeInputs {
            input,
            replay,
            own_input,
        })
    }

    /// Run an input item through the barrier handler.
    ///
    /// Returns the event to process, or `None` when the handler consumed it.
    pub(crate) async fn preprocess(&mut self, item: StreamItem) -> Result<Option<StreamEvent>> {
        match item {
            StreamItem::Event(event) => Ok(Some(event)),
            StreamItem::Tagged(tagged) => match self.handler.as_mut() {
                Some(handler) => match handler.process(tagged).await? {
                    BarrierAction::Consumed => Ok(None),
                    BarrierAction::Forward(event) => Ok(Some(event)),
                },
                None => Ok(Some(tagged.data)),
            },
        }
    }

    /// Broadcast an in-band error downstream and count it.
    pub(crate) async fn emit_error(&self, message: String) -> Result<()> {
        self.stats.inc_exceptions(&message);
        self.emitter.broadcast(StreamEvent::Error(message)).await
    }
}

/// What a node loop receives next.
pub(crate) enum Incoming {
    /// Released by the barrier aligner; bypasses barrier handling.
    Replayed(StreamEvent),
    Item(StreamItem),
    Closed,
    Cancelled,
}

/// Receivers owned by a running node loop.
pub(crate) struct NodeInputs {
    input: LocalChannelReceiver,
    replay: ReplayReceiver,
    own_input: WeakChannelSender,
}

impl NodeInputs {
    /// Next input, replayed items first.
    pub(crate) async fn next(&mut self, ctx: &StreamContext) -> Incoming {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Incoming::Cancelled,
            Some(replayed) = self.replay.recv() => Incoming::Replayed(replayed.data),
            item = self.input.recv() => match item {
                Some(item) => Incoming::Item(item),
                None => Incoming::Closed,
            },
        }
    }

    pub(crate) fn buffered(&self) -> usize {
        self.input.len()
    }

    /// Weak handle used by a node to feed its own input.
    pub(crate) fn own_input(&self) -> WeakChannelSender {
        self.own_input.clone()
    }
}
