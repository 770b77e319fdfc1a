//! Stateless or stateful per-event transformation node.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use crate::channel::LocalChannelSender;
use crate::checkpoint::{BarrierHandler, Responder, SignalSender};
use crate::config::RuleOptions;
use crate::context::StreamContext;
use crate::runtime::{Incoming, NodeCore, NonSourceTask, StatManager, Task};
use crate::types::{Qos, StreamEvent};

/// User logic applied to every tuple or window reaching an [`OperatorNode`].
///
/// Returning `Ok(None)` filters the event out; an error is forwarded
/// downstream as [`StreamEvent::Error`] and does not stop the node.
pub trait Operation: Send {
    fn apply(&mut self, event: StreamEvent, ctx: &StreamContext) -> Result<Option<StreamEvent>>;
}

impl<F> Operation for F
where
    F: FnMut(StreamEvent, &StreamContext) -> Result<Option<StreamEvent>> + Send,
{
    fn apply(&mut self, event: StreamEvent, ctx: &StreamContext) -> Result<Option<StreamEvent>> {
        self(event, ctx)
    }
}

pub struct OperatorNode {
    core: NodeCore,
    operation: Box<dyn Operation>,
}

impl OperatorNode {
    pub fn new(name: &str, operation: impl Operation + 'static, options: &RuleOptions) -> Self {
        Self {
            core: NodeCore::new(name, options.buffer_length),
            operation: Box::new(operation),
        }
    }

    /// Build from a closure.
    pub fn from_fn<F>(name: &str, f: F, options: &RuleOptions) -> Self
    where
        F: FnMut(StreamEvent, &StreamContext) -> Result<Option<StreamEvent>> + Send + 'static,
    {
        Self::new(name, f, options)
    }

    async fn run(mut self, ctx: StreamContext) -> Result<()> {
        let mut inputs = self.core.start()?;
        info!("Operator started");
        loop {
            let event = match inputs.next(&ctx).await {
                Incoming::Cancelled => {
                    info!("Operator cancelled");
                    return Ok(());
                }
                Incoming::Closed => {
                    info!("Input closed, operator exits");
                    return Ok(());
                }
                Incoming::Replayed(event) => event,
                Incoming::Item(item) => match self.core.preprocess(item).await? {
                    Some(event) => event,
                    None => continue,
                },
            };
            self.core.stats.set_buffer_length(inputs.buffered());
            self.on_event(event, &ctx).await?;
        }
    }

    async fn on_event(&mut self, event: StreamEvent, ctx: &StreamContext) -> Result<()> {
        match event {
            StreamEvent::Barrier(barrier) => {
                debug!(checkpoint_id = barrier.checkpoint_id, "Ignore untracked barrier");
                Ok(())
            }
            StreamEvent::Error(_) | StreamEvent::Watermark(_) => {
                self.core.emitter.broadcast(event).await
            }
            event => {
                let stats = &self.core.stats;
                stats.inc_records_in();
                let start = stats.process_time_start();
                let result = self.operation.apply(event, ctx);
                stats.process_time_end(start);
                match result {
                    Ok(Some(output)) => {
                        self.core.emitter.broadcast(output).await?;
                        self.core.stats.inc_records_out();
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(err) => self.core.emit_error(format!("{err:#}")).await,
                }
            }
        }
    }
}

impl Task for OperatorNode {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn set_qos(&mut self, qos: Qos) {
        self.core.set_qos(qos);
    }

    fn add_output(&mut self, output: LocalChannelSender) -> Result<()> {
        self.core.add_output(output);
        Ok(())
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

impl NonSourceTask for OperatorNode {
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
