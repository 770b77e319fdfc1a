//! A rule's node graph: wiring, checkpoint setup, start and stop.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checkpoint::{
    create_barrier_handler, signal_channel, BarrierTracker, Coordinator, InMemoryStore, Responder,
    Store,
};
use crate::config::RuleOptions;
use crate::context::StreamContext;
use crate::errors::EngineError;
use crate::runtime::{NonSourceTask, SourceTask, StatManager, StatSnapshot, Task};
use crate::time::{system_clock, Clock};
use crate::types::Qos;

/// Hosts the nodes of one rule.
///
/// Nodes are added and connected first; [`open`](Topology::open) restores
/// their state, installs barrier handlers for the rule's QoS, spawns every
/// node and activates the checkpoint coordinator.
pub struct Topology {
    rule_id: String,
    options: RuleOptions,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ctx: StreamContext,
    sources: Vec<Box<dyn SourceTask>>,
    operators: Vec<Box<dyn NonSourceTask>>,
    sinks: Vec<Box<dyn NonSourceTask>>,
    names: HashSet<String>,
    stats: Vec<(String, Arc<StatManager>)>,
    coordinator: Option<Coordinator>,
    handles: Vec<(String, JoinHandle<Result<()>>)>,
    opened: bool,
}

impl Topology {
    pub fn new(rule_id: &str, options: RuleOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            rule_id: rule_id.to_string(),
            options,
            store: Arc::new(InMemoryStore::new()),
            clock: system_clock(),
            ctx: StreamContext::new(rule_id),
            sources: Vec::new(),
            operators: Vec::new(),
            sinks: Vec::new(),
            names: HashSet::new(),
            stats: Vec::new(),
            coordinator: None,
            handles: Vec::new(),
            opened: false,
        })
    }

    /// Store checkpoints are saved to and restored from.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn options(&self) -> &RuleOptions {
        &self.options
    }

    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    pub fn add_source(&mut self, source: impl SourceTask + 'static) -> Result<()> {
        self.register(source.name())?;
        self.sources.push(Box::new(source));
        Ok(())
    }

    pub fn add_operator(&mut self, operator: impl NonSourceTask + 'static) -> Result<()> {
        self.register(operator.name())?;
        self.operators.push(Box::new(operator));
        Ok(())
    }

    pub fn add_sink(&mut self, sink: impl NonSourceTask + 'static) -> Result<()> {
        self.register(sink.name())?;
        self.sinks.push(Box::new(sink));
        Ok(())
    }

    fn register(&mut self, name: &str) -> Result<()> {
        if self.opened {
            return Err(anyhow!("topology {} is already open", self.rule_id));
        }
        if !self.names.insert(name.to_string()) {
            return Err(EngineError::configuration(format!("duplicate node name {name}")).into());
        }
        Ok(())
    }

    /// Route the output of `from` into the input of `to`.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Err(EngineError::configuration(format!("node {from} cannot feed itself")).into());
        }
        let has_upstream = self.sources.iter().any(|node| node.name() == from)
            || self.operators.iter().any(|node| node.name() == from);
        if !has_upstream {
            return Err(anyhow!("unknown upstream node {from}"));
        }
        let input = {
            let target = self
                .operators
                .iter_mut()
                .chain(self.sinks.iter_mut())
                .find(|node| node.name() == to)
                .ok_or_else(|| anyhow!("unknown downstream node {to}"))?;
            let input = target.input()?;
            target.add_input_count();
            input
        };
        if let Some(source) = self.sources.iter_mut().find(|node| node.name() == from) {
            return source.add_output(input);
        }
        match self.operators.iter_mut().find(|node| node.name() == from) {
            Some(operator) => operator.add_output(input),
            None => Err(anyhow!("unknown upstream node {from}")),
        }
    }

    pub async fn open(&mut self) -> Result<()> {
        if self.opened {
            return Err(anyhow!("topology {} is already open", self.rule_id));
        }
        if self.sources.is_empty() {
            return Err(EngineError::configuration(format!("rule {} has no source", self.rule_id)).into());
        }
        self.opened = true;
        let qos = self.options.qos;
        self.ctx = self.ctx.clone().with_store(self.store.clone());

        let mut source_ctxs = Vec::with_capacity(self.sources.len());
        for source in &mut self.sources {
            source_ctxs.push(prepare_node(source.as_mut(), &self.ctx, qos, &self.clock)?);
        }
        let mut operator_ctxs = Vec::with_capacity(self.operators.len());
        for operator in &mut self.operators {
            operator_ctxs.push(prepare_node(operator.as_mut(), &self.ctx, qos, &self.clock)?);
        }
        let mut sink_ctxs = Vec::with_capacity(self.sinks.len());
        for sink in &mut self.sinks {
            sink_ctxs.push(prepare_node(sink.as_mut(), &self.ctx, qos, &self.clock)?);
        }

        if qos.is_checkpointed() {
            let (signal, signal_rx) = signal_channel();
            let tasks_to_trigger: Vec<Arc<dyn Responder>> = self
                .sources
                .iter()
                .zip(&source_ctxs)
                .map(|(source, ctx)| source.responder(ctx, signal.clone()))
                .collect();
            let mut tasks_to_wait_for = Vec::new();
            tasks_to_wait_for.extend(self.sources.iter().map(|node| node.name().to_string()));
            tasks_to_wait_for.extend(self.operators.iter().map(|node| node.name().to_string()));
            tasks_to_wait_for.extend(self.sinks.iter().map(|node| node.name().to_string()));

            for (operator, ctx) in self.operators.iter_mut().zip(&operator_ctxs) {
                let responder = operator.responder(ctx, signal.clone());
                if let Some(handler) = create_barrier_handler(responder, operator.input_count(), qos)
                {
                    operator.set_barrier_handler(handler);
                }
            }
            // Sinks only track barriers, whatever the QoS.
            for (sink, ctx) in self.sinks.iter_mut().zip(&sink_ctxs) {
                let responder = sink.responder(ctx, signal.clone());
                sink.set_barrier_handler(Box::new(BarrierTracker::new(
                    responder,
                    sink.input_count(),
                )));
            }

            self.coordinator = Some(
                Coordinator::new(
                    &self.ctx,
                    tasks_to_trigger,
                    tasks_to_wait_for,
                    self.store.clone(),
                    self.options.checkpoint_config(),
                    (signal, signal_rx),
                )
                .with_clock(self.clock.clone()),
            );
        }

        // Downstream first, so no source emits into a node that is not running.
        for (sink, ctx) in std::mem::take(&mut self.sinks).into_iter().zip(sink_ctxs) {
            self.spawn(sink.name().to_string(), sink.stats(), sink.exec(ctx));
        }
        for (operator, ctx) in std::mem::take(&mut self.operators)
            .into_iter()
            .zip(operator_ctxs)
        {
            self.spawn(operator.name().to_string(), operator.stats(), operator.exec(ctx));
        }
        for (source, ctx) in std::mem::take(&mut self.sources).into_iter().zip(source_ctxs) {
            self.spawn(source.name().to_string(), source.stats(), source.exec(ctx));
        }

        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.activate()?;
        }
        info!(rule = %self.rule_id, qos = ?qos, nodes = self.handles.len(), "Rule opened");
        Ok(())
    }

    fn spawn(&mut self, name: String, stats: Arc<StatManager>, handle: JoinHandle<Result<()>>) {
        self.stats.push((name.clone(), stats));
        self.handles.push((name, handle));
    }

    /// Stop the coordinator, cancel every node and wait for them to exit.
    ///
    /// Node failures are logged; only a coordinator failure is returned.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.deactivate().await?;
        }
        self.ctx.cancel();
        for (name, handle) in self.handles.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(node = %name, "Node exited with error: {err:#}"),
                Err(err) => warn!(node = %name, "Node task failed: {err}"),
            }
        }
        info!(rule = %self.rule_id, "Rule closed");
        Ok(())
    }

    /// Wait for every node to finish on its own, e.g. after all source feeds
    /// closed. Returns the first node error.
    pub async fn wait(&mut self) -> Result<()> {
        let mut first_error = None;
        for (name, handle) in self.handles.drain(..) {
            let result = handle
                .await
                .with_context(|| format!("node {name} panicked"))
                .and_then(|result| result.with_context(|| format!("node {name} failed")));
            if let Err(err) = result {
                warn!(node = %name, "{err:#}");
                first_error.get_or_insert(err);
            }
        }
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.deactivate().await?;
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.coordinator.as_ref()
    }

    pub fn stats(&self, node: &str) -> Option<StatSnapshot> {
        self.stats
            .iter()
            .find(|(name, _)| name == node)
            .map(|(_, stats)| stats.snapshot())
    }
}

fn prepare_node<T: Task + ?Sized>(
    task: &mut T,
    root: &StreamContext,
    qos: Qos,
    clock: &Arc<dyn Clock>,
) -> Result<StreamContext> {
    task.set_qos(qos);
    task.set_clock(clock.clone());
    let ctx = root.with_operator(task.name());
    if qos.is_checkpointed() {
        ctx.restore_state()
            .with_context(|| format!("failed to restore state of {}", task.name()))?;
    }
    Ok(ctx)
}
