//! Node hosting a [`WindowOperator`] in processing-time or event-time mode.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn, Instrument};

use crate::channel::LocalChannelSender;
use crate::checkpoint::{BarrierHandler, Responder, SignalSender};
use crate::config::RuleOptions;
use crate::context::StreamContext;
use crate::errors::EngineError;
use crate::runtime::{Incoming, NodeCore, NodeInputs, NonSourceTask, StatManager, Task};
use crate::time::{system_clock, Clock, WatermarkGenerator, WATERMARK_KEY};
use crate::types::{EventTime, Qos, StreamEvent, WindowTuplesSet};
use crate::window::{WindowConfig, WindowOperator, WindowType};

pub struct WindowNode {
    core: NodeCore,
    op: WindowOperator,
    generator: Option<WatermarkGenerator>,
    clock: Arc<dyn Clock>,
}

impl WindowNode {
    /// `streams` are the input stream names the event-time watermark waits
    /// for; ignored in processing time.
    pub fn new(
        name: &str,
        config: WindowConfig,
        streams: Vec<String>,
        options: &RuleOptions,
    ) -> Result<Self> {
        let generator = if options.is_event_time {
            Some(WatermarkGenerator::new(
                &config,
                options.late_tolerance,
                streams,
            )?)
        } else {
            None
        };
        Ok(Self {
            core: NodeCore::new(name, options.buffer_length),
            op: WindowOperator::new(name, config, options.is_event_time)?,
            generator,
            clock: system_clock(),
        })
    }

    async fn run(mut self, ctx: StreamContext) -> Result<()> {
        let mut inputs = self.core.start()?;
        self.op.restore_from(&ctx)?;
        match self.generator.take() {
            Some(mut generator) => {
                generator.restore(ctx.get_state::<Option<EventTime>>(WATERMARK_KEY)?.flatten());
                generator.set_output(inputs.own_input());
                self.run_event_time(&ctx, &mut inputs, generator).await
            }
            None => self.run_processing_time(&ctx, &mut inputs).await,
        }
    }

    async fn run_processing_time(
        &mut self,
        ctx: &StreamContext,
        inputs: &mut NodeInputs,
    ) -> Result<()> {
        let config = self.op.config().clone();
        let mut ticker = config.ticker_interval().map(new_ticker);
        let is_session = config.window_type == WindowType::Session;
        let gap = Duration::from_millis(config.interval.max(0) as u64);
        let mut session_timer: Option<Pin<Box<Sleep>>> = None;

        for window in self.op.catch_up(self.clock.now_ms()) {
            self.emit_window(window).await?;
        }
        info!(window_type = ?config.window_type, "Window started in processing time");

        loop {
            tokio::select! {
                incoming = inputs.next(ctx) => {
                    let event = match self.receive(incoming, ctx, None).await? {
                        Received::Event(event) => event,
                        Received::Skip => continue,
                        Received::Stop => return Ok(()),
                    };
                    self.core.stats.set_buffer_length(inputs.buffered());
                    match event {
                        StreamEvent::Tuple(tuple) => {
                            let start = self.core.stats.process_time_start();
                            self.core.stats.inc_records_in();
                            if is_session {
                                match session_timer.as_mut() {
                                    Some(timer) => timer.as_mut().reset(Instant::now() + gap),
                                    None => {
                                        self.op.start_session(tuple.timestamp);
                                        session_timer = Some(Box::pin(tokio::time::sleep(gap)));
                                    }
                                }
                            }
                            for window in self.op.push(tuple)? {
                                self.emit_window(window).await?;
                            }
                            self.core.stats.process_time_end(start);
                        }
                        other => self.on_other(other).await?,
                    }
                }
                _ = next_tick(&mut ticker) => {
                    let now = self.clock.now_ms();
                    if let Some(window) = self.op.on_tick(now) {
                        self.emit_window(window).await?;
                    }
                }
                _ = expire(&mut session_timer) => {
                    session_timer = None;
                    let now = self.clock.now_ms();
                    debug!(now, "Session window timeout");
                    if let Some(window) = self.op.on_session_timeout(now) {
                        self.emit_window(window).await?;
                    }
                }
            }
        }
    }

    async fn run_event_time(
        &mut self,
        ctx: &StreamContext,
        inputs: &mut NodeInputs,
        mut generator: WatermarkGenerator,
    ) -> Result<()> {
        let mut ticker = generator.tick_interval().map(new_ticker);
        info!(
            window_type = ?self.op.config().window_type,
            "Window started in event time"
        );

        loop {
            tokio::select! {
                incoming = inputs.next(ctx) => {
                    let event = match self.receive(incoming, ctx, Some(&generator)).await? {
                        Received::Event(event) => event,
                        Received::Skip => continue,
                        Received::Stop => return Ok(()),
                    };
                    self.core.stats.set_buffer_length(inputs.buffered());
                    match event {
                        StreamEvent::Watermark(watermark) => {
                            debug!(watermark = watermark.timestamp, "Window received watermark");
                            for window in self.op.on_watermark(watermark.timestamp, &generator) {
                                self.emit_window(window).await?;
                            }
                        }
                        StreamEvent::Tuple(tuple) => {
                            self.core.stats.inc_records_in();
                            if generator.track(&tuple.emitter, tuple.timestamp) {
                                self.op.push_event(tuple);
                            } else {
                                warn!(
                                    stream = %tuple.emitter,
                                    timestamp = tuple.timestamp,
                                    watermark = generator.last_watermark(),
                                    "Drop late tuple"
                                );
                            }
                        }
                        other => self.on_other(other).await?,
                    }
                }
                _ = next_tick(&mut ticker) => {
                    generator.trigger();
                }
            }
        }
    }

    /// Unwrap the next input.
    ///
    /// Operator state is copied into the context before a barrier reaches
    /// the barrier handler, so snapshots see the current buffer.
    async fn receive(
        &mut self,
        incoming: Incoming,
        ctx: &StreamContext,
        generator: Option<&WatermarkGenerator>,
    ) -> Result<Received> {
        match incoming {
            Incoming::Cancelled => {
                info!("Window cancelled");
                Ok(Received::Stop)
            }
            Incoming::Closed => {
                info!("Input closed, window exits");
                Ok(Received::Stop)
            }
            Incoming::Replayed(event) => Ok(Received::Event(event)),
            Incoming::Item(item) => {
                if item.event().is_barrier() {
                    self.op.save_to(ctx)?;
                    if let Some(generator) = generator {
                        ctx.put_state(WATERMARK_KEY, &generator.last_watermark())?;
                    }
                }
                Ok(match self.core.preprocess(item).await? {
                    Some(event) => Received::Event(event),
                    None => Received::Skip,
                })
            }
        }
    }

    async fn on_other(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Error(_) => self.core.emitter.broadcast(event).await,
            StreamEvent::Barrier(barrier) => {
                debug!(checkpoint_id = barrier.checkpoint_id, "Ignore untracked barrier");
                Ok(())
            }
            other => {
                let err = EngineError::RuntimeType {
                    operator: self.core.name().to_string(),
                    found: other.kind(),
                };
                self.core.emit_error(err.to_string()).await
            }
        }
    }

    async fn emit_window(&self, window: WindowTuplesSet) -> Result<()> {
        debug!(window_end = window.window_end, tuples = window.len(), "Emit window");
        self.core.emitter.broadcast(StreamEvent::Window(window)).await?;
        self.core.stats.inc_records_out();
        Ok(())
    }
}

enum Received {
    Event(StreamEvent),
    Skip,
    Stop,
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending::<()>().await,
    }
}

impl Task for WindowNode {
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

    fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    fn exec(self: Box<Self>, ctx: StreamContext) -> JoinHandle<Result<()>> {
        let span = ctx.span().clone();
        let node = *self;
        tokio::spawn(node.run(ctx).instrument(span))
    }
}

impl NonSourceTask for WindowNode {
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
