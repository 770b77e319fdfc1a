//! Source node: turns an external feed into stream tuples.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use crate::channel::LocalChannelSender;
use crate::checkpoint::{Responder, SignalSender, TaskResponder};
use crate::context::StreamContext;
use crate::errors::EngineError;
use crate::runtime::{Emitter, SourceTask, StatManager, Task};
use crate::time::{system_clock, Clock};
use crate::types::{CheckpointId, Qos, StreamEvent, Tuple};

/// State key of the number of tuples emitted so far.
pub const OFFSET_KEY: &str = "$$offset";

/// How a source stamps tuple timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampMode {
    /// Ingestion time from the node clock.
    Ingestion,
    /// Event time read from an integer message field.
    Field(String),
    /// Keep the timestamp the feed set.
    Preserve,
}

pub(crate) enum SourceCommand {
    InjectBarrier {
        checkpoint_id: CheckpointId,
        signal: SignalSender,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Emits tuples from a feed channel without blocking: tuples are dropped
/// when a downstream buffer is full.
pub struct SourceNode {
    name: String,
    emitter: Emitter,
    feed: mpsc::Receiver<Tuple>,
    timestamp: TimestampMode,
    clock: Arc<dyn Clock>,
    commands_tx: mpsc::Sender<SourceCommand>,
    commands_rx: mpsc::Receiver<SourceCommand>,
    stats: Arc<StatManager>,
}

impl SourceNode {
    pub fn new(name: &str, feed: mpsc::Receiver<Tuple>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        Self {
            name: name.to_string(),
            emitter: Emitter::new(name),
            feed,
            timestamp: TimestampMode::Ingestion,
            clock: system_clock(),
            commands_tx,
            commands_rx,
            stats: Arc::new(StatManager::new()),
        }
    }

    /// Source plus the sender that feeds it.
    pub fn channel(name: &str, capacity: usize) -> (Self, mpsc::Sender<Tuple>) {
        let (feed_tx, feed_rx) = mpsc::channel(capacity.max(1));
        (Self::new(name, feed_rx), feed_tx)
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp = TimestampMode::Field(field.into());
        self
    }

    pub fn preserve_timestamps(mut self) -> Self {
        self.timestamp = TimestampMode::Preserve;
        self
    }

    async fn run(mut self, ctx: StreamContext) -> Result<()> {
        let mut offset: u64 = ctx.get_state(OFFSET_KEY)?.unwrap_or(0);
        info!(offset, "Source started");
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    info!("Source cancelled");
                    return Ok(());
                }
                Some(command) = self.commands_rx.recv() => self.handle_command(command, &ctx).await,
                tuple = self.feed.recv() => match tuple {
                    Some(tuple) => self.emit(tuple, &ctx, &mut offset)?,
                    None => {
                        info!(offset, "Source feed closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    fn emit(&mut self, mut tuple: Tuple, ctx: &StreamContext, offset: &mut u64) -> Result<()> {
        self.stats.inc_records_in();
        tuple.emitter = self.name.clone();
        match &self.timestamp {
            TimestampMode::Ingestion => tuple.timestamp = self.clock.now_ms(),
            TimestampMode::Preserve => {}
            TimestampMode::Field(field) => match tuple.value(field).and_then(Value::as_i64) {
                Some(timestamp) => tuple.timestamp = timestamp,
                None => {
                    let message = format!("cannot find integer timestamp field {field} in tuple");
                    self.stats.inc_exceptions(&message);
                    self.emitter.try_broadcast(StreamEvent::Error(message))?;
                    return Ok(());
                }
            },
        }
        *offset += 1;
        ctx.put_state(OFFSET_KEY, offset)?;
        let dropped = self.emitter.try_broadcast(StreamEvent::Tuple(tuple))?;
        if dropped < self.emitter.output_count() {
            self.stats.inc_records_out();
        }
        Ok(())
    }

    async fn handle_command(&self, command: SourceCommand, ctx: &StreamContext) {
        match command {
            SourceCommand::InjectBarrier {
                checkpoint_id,
                signal,
                reply,
            } => {
                let responder =
                    TaskResponder::new(self.name.clone(), ctx.clone(), self.emitter.clone(), signal);
                let result = responder.trigger_checkpoint(checkpoint_id).await;
                if reply.send(result).is_err() {
                    debug!(checkpoint_id, "Coordinator stopped waiting for barrier injection");
                }
            }
        }
    }
}

impl Task for SourceNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_qos(&mut self, qos: Qos) {
        self.emitter.set_qos(qos);
    }

    fn add_output(&mut self, output: LocalChannelSender) -> Result<()> {
        self.emitter.add_output(output);
        Ok(())
    }

    fn stats(&self) -> Arc<StatManager> {
        self.stats.clone()
    }

    fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    fn exec(self: Box<Self>, ctx: StreamContext) -> JoinHandle<Result<()>> {
        let span = ctx.span().clone();
        let node = *self;
        tokio::spawn(node.run(ctx).instrument(span))
    }
}

impl SourceTask for SourceNode {
    fn responder(&self, _ctx: &StreamContext, signal: SignalSender) -> Arc<dyn Responder> {
        Arc::new(SourceResponder {
            name: self.name.clone(),
            commands: self.commands_tx.clone(),
            signal,
        })
    }
}

/// Asks a running source loop to inject a barrier.
pub struct SourceResponder {
    name: String,
    commands: mpsc::Sender<SourceCommand>,
    signal: SignalSender,
}

#[async_trait]
impl Responder for SourceResponder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn trigger_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let stopped = || EngineError::Trigger {
            checkpoint_id,
            task: self.name.clone(),
            reason: "source is not running".to_string(),
        };
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SourceCommand::InjectBarrier {
                checkpoint_id,
                signal: self.signal.clone(),
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())?
    }
}
