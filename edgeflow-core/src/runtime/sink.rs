//! Terminal node handing results to a consumer channel.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::channel::LocalChannelSender;
use crate::checkpoint::{BarrierHandler, Responder, SignalSender};
use crate::config::RuleOptions;
use crate::context::StreamContext;
use crate::runtime::{Incoming, NodeCore, NonSourceTask, StatManager, Task};
use crate::types::{Qos, StreamEvent};

/// Delivers tuples and windows to the receiver returned by [`SinkNode::new`].
///
/// In-band errors are delivered only when `sendError` is enabled.
pub struct SinkNode {
    core: NodeCore,
    send_error: bool,
    results: mpsc::Sender<StreamEvent>,
}

impl SinkNode {
    pub fn new(name: &str, options: &RuleOptions) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (results, receiver) = mpsc::channel(options.buffer_length.max(1));
        (
            Self {
                core: NodeCore::new(name, options.buffer_length),
                send_error: options.send_error,
                results,
            },
            receiver,
        )
    }

    async fn run(mut self, ctx: StreamContext) -> Result<()> {
        let mut inputs = self.core.start()?;
        info!("Sink started");
        loop {
            let event = match inputs.next(&ctx).await {
                Incoming::Cancelled => {
                    info!("Sink cancelled");
                    return Ok(());
                }
                Incoming::Closed => {
                    info!("Input closed, sink exits");
                    return Ok(());
                }
                Incoming::Replayed(event) => event,
                Incoming::Item(item) => match self.core.preprocess(item).await? {
                    Some(event) => event,
                    None => continue,
                },
            };
            self.core.stats.set_buffer_length(inputs.buffered());
            match event {
                StreamEvent::Tuple(_) | StreamEvent::Window(_) => {
                    self.core.stats.inc_records_in();
                    self.deliver(event).await;
                }
                StreamEvent::Error(message) => {
                    self.core.stats.inc_exceptions(&message);
                    if self.send_error {
                        self.deliver(StreamEvent::Error(message)).await;
                    } else {
                        debug!(error = %message, "Drop error result");
                    }
                }
                StreamEvent::Watermark(_) | StreamEvent::Barrier(_) => {}
            }
        }
    }

    async fn deliver(&self, event: StreamEvent) {
        if self.results.send(event).await.is_err() {
            warn!("Result consumer dropped, discard result");
            return;
        }
        self.core.stats.inc_records_out();
    }
}

impl Task for SinkNode {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn set_qos(&mut self, qos: Qos) {
        self.core.set_qos(qos);
    }

    fn add_output(&mut self, _output: LocalChannelSender) -> Result<()> {
        Err(anyhow!("sink {} cannot have outputs", self.core.name()))
    }

    fn stats(&self) -> Arc<StatManager> {
        self.core.stats.clone()
    }

    fn exec(self: Box<Self>, ctx: StreamContext) -> JoinHandle<Result<()>> {
        let span = ctx.span().clone();
        let node = *self;
        tokio::spawn(node.run(ctx).instrument(span))
    }
}

impl NonSourceTask for SinkNode {
    fn input(&self) -> Result<LocalChannelSender> {
        self.core.input()
    }

    fn input_count(&self) -> usize {
        self.core.input_count()
    }

    fn add_input_count(&mut self) {
        self.core.add_input_count();
    }

    fn set_barrier_handler(&mut self, handler: Box<dyn BarrierHandler>) {
        self.core.set_barrier_handler(handler);
    }

    fn responder(&self, ctx: &StreamContext, signal: SignalSender) -> Arc<dyn Responder> {
        self.core.task_responder(ctx, signal)
    }
}
