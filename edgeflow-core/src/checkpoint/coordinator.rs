use super::*;

/// Checkpoint scheduling knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Completed checkpoints kept in memory.
    pub max_completed: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
            timeout: Duration::from_millis(200_000),
            max_completed: 3,
        }
    }
}

/// Bookkeeping shared by the control loop and its trigger tasks.
pub(crate) struct CoordinatorState {
    pending: Mutex<HashMap<CheckpointId, PendingCheckpoint>>,
    completed: Mutex<CompletedCheckpoints>,
    store: Arc<dyn Store>,
}

impl CoordinatorState {
    pub(crate) fn new(store: Arc<dyn Store>, max_completed: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new(CompletedCheckpoints::new(max_completed)),
            store,
        }
    }

    /// Register a new pending checkpoint. Returns false if the id is taken.
    pub(crate) fn begin(&self, checkpoint_id: CheckpointId, tasks: &[String]) -> Result<bool> {
        let mut pending = self.lock_pending()?;
        if pending.contains_key(&checkpoint_id) {
            return Ok(false);
        }
        pending.insert(checkpoint_id, PendingCheckpoint::new(checkpoint_id, tasks));
        Ok(true)
    }

    /// Record an ack. Returns true once the checkpoint is fully acked.
    pub(crate) fn ack(&self, op_id: &str, checkpoint_id: CheckpointId) -> Result<bool> {
        let mut pending = self.lock_pending()?;
        let Some(checkpoint) = pending.get_mut(&checkpoint_id) else {
            debug!(op_id, checkpoint_id, "Ignore ack for unknown checkpoint");
            return Ok(false);
        };
        if !checkpoint.ack(op_id) {
            debug!(op_id, checkpoint_id, "Ignore duplicate or unexpected ack");
            return Ok(false);
        }
        Ok(checkpoint.is_fully_acked())
    }

    /// Commit a fully acked checkpoint to the store.
    ///
    /// On store failure the checkpoint stays pending until it times out or is
    /// superseded.
    pub(crate) fn complete(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let mut pending = self.lock_pending()?;
        if !pending.contains_key(&checkpoint_id) {
            return Ok(());
        }
        self.store
            .save_checkpoint(checkpoint_id)
            .with_context(|| format!("cannot save checkpoint {checkpoint_id}"))?;

        if let Some(checkpoint) = pending.remove(&checkpoint_id) {
            self.lock_completed()?.add(checkpoint.finalize());
        }
        pending.retain(|id, checkpoint| {
            if *id < checkpoint_id {
                checkpoint.dispose();
                false
            } else {
                true
            }
        });
        info!(checkpoint_id, "Checkpoint completed");
        Ok(())
    }

    /// Drop a pending checkpoint. Returns false if it was already gone.
    pub(crate) fn cancel(&self, checkpoint_id: CheckpointId) -> Result<bool> {
        let mut pending = self.lock_pending()?;
        match pending.remove(&checkpoint_id) {
            Some(mut checkpoint) => {
                checkpoint.dispose();
                debug!(checkpoint_id, "Cancelled checkpoint");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn pending_ids(&self) -> Result<Vec<CheckpointId>> {
        let mut ids: Vec<_> = self.lock_pending()?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub(crate) fn is_pending(&self, checkpoint_id: CheckpointId) -> Result<bool> {
        Ok(self.lock_pending()?.contains_key(&checkpoint_id))
    }

    pub(crate) fn completed_ids(&self) -> Result<Vec<CheckpointId>> {
        Ok(self.lock_completed()?.ids())
    }

    pub(crate) fn completed_total(&self) -> Result<u64> {
        Ok(self.lock_completed()?.total())
    }

    pub(crate) fn latest_completed(&self) -> Result<Option<CheckpointId>> {
        Ok(self.lock_completed()?.latest())
    }

    fn lock_pending(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<CheckpointId, PendingCheckpoint>>> {
        self.pending
            .lock()
            .map_err(|_| anyhow!("pending_checkpoints lock poisoned"))
    }

    fn lock_completed(&self) -> Result<std::sync::MutexGuard<'_, CompletedCheckpoints>> {
        self.completed
            .lock()
            .map_err(|_| anyhow!("completed_checkpoints lock poisoned"))
    }
}

/// Drives periodic checkpoints of one rule.
///
/// On every tick the coordinator asks each source responder to inject a
/// barrier and waits for every task to ack. A checkpoint completes when all
/// tasks acked and the store committed it; any decline, trigger failure or
/// timeout cancels it.
pub struct Coordinator {
    rule_id: String,
    tasks_to_trigger: Vec<Arc<dyn Responder>>,
    tasks_to_wait_for: Vec<String>,
    state: Arc<CoordinatorState>,
    config: CheckpointConfig,
    clock: Arc<dyn Clock>,
    ctx: StreamContext,
    signal: SignalSender,
    signal_rx: Option<SignalReceiver>,
    handle: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(
        ctx: &StreamContext,
        tasks_to_trigger: Vec<Arc<dyn Responder>>,
        tasks_to_wait_for: Vec<String>,
        store: Arc<dyn Store>,
        config: CheckpointConfig,
        signals: (SignalSender, SignalReceiver),
    ) -> Self {
        let (signal, signal_rx) = signals;
        Self {
            rule_id: ctx.rule_id().to_string(),
            tasks_to_trigger,
            tasks_to_wait_for,
            state: Arc::new(CoordinatorState::new(store, config.max_completed)),
            config,
            clock: crate::time::system_clock(),
            ctx: ctx.with_cancel(),
            signal,
            signal_rx: Some(signal_rx),
            handle: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the control loop. Fails if it was already started.
    pub fn activate(&mut self) -> Result<()> {
        if self.config.interval.is_zero() {
            return Err(EngineError::configuration(format!(
                "checkpoint interval of rule {} must be positive",
                self.rule_id
            ))
            .into());
        }
        let signals = self
            .signal_rx
            .take()
            .ok_or_else(|| anyhow!("coordinator of rule {} already activated", self.rule_id))?;
        info!(
            rule = %self.rule_id,
            interval_ms = self.config.interval.as_millis() as u64,
            "Start checkpoint coordinator"
        );
        let control = ControlLoop {
            tasks_to_trigger: self.tasks_to_trigger.clone(),
            tasks_to_wait_for: self.tasks_to_wait_for.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            ctx: self.ctx.clone(),
            signals,
        };
        self.handle = Some(tokio::spawn(
            control.run().instrument(self.ctx.span().clone()),
        ));
        Ok(())
    }

    /// Stop the control loop and any ongoing trigger waits.
    pub async fn deactivate(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if let Err(err) = self.signal.stop().await {
            debug!("Control loop already gone: {err:#}");
        }
        self.ctx.cancel();
        handle.await.context("checkpoint control loop panicked")?;
        info!(rule = %self.rule_id, "Checkpoint coordinator stopped");
        Ok(())
    }

    pub fn is_activated(&self) -> bool {
        self.handle.is_some()
    }

    /// Sender that tasks use to ack or decline.
    pub fn signal_sender(&self) -> SignalSender {
        self.signal.clone()
    }

    /// Number of checkpoints completed since activation.
    pub fn complete_count(&self) -> Result<u64> {
        self.state.completed_total()
    }

    /// Id of the most recent completed checkpoint.
    pub fn latest(&self) -> Result<Option<CheckpointId>> {
        self.state.latest_completed()
    }

    /// Retained completed checkpoint ids, oldest first.
    pub fn completed_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        self.state.completed_ids()
    }

    pub fn pending_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        self.state.pending_ids()
    }
}

struct ControlLoop {
    tasks_to_trigger: Vec<Arc<dyn Responder>>,
    tasks_to_wait_for: Vec<String>,
    state: Arc<CoordinatorState>,
    config: CheckpointConfig,
    clock: Arc<dyn Clock>,
    ctx: StreamContext,
    signals: SignalReceiver,
}

impl ControlLoop {
    async fn run(mut self) {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.start_checkpoint(),
                signal = self.signals.recv() => {
                    let Some(signal) = signal else {
                        info!("Signal channel closed, stop checkpoint scheduler");
                        return;
                    };
                    if !self.handle_signal(signal) {
                        return;
                    }
                }
                _ = self.ctx.cancelled() => {
                    info!("Cancelled, stop checkpoint scheduler");
                    return;
                }
            }
        }
    }

    fn start_checkpoint(&self) {
        let checkpoint_id = self.clock.now_ms();
        match self.state.begin(checkpoint_id, &self.tasks_to_wait_for) {
            Ok(true) => {}
            Ok(false) => {
                warn!(checkpoint_id, "Checkpoint id already pending, skip this round");
                return;
            }
            Err(err) => {
                warn!(checkpoint_id, "Failed to start checkpoint: {err:#}");
                return;
            }
        }
        debug!(checkpoint_id, "Start checkpoint");
        for responder in &self.tasks_to_trigger {
            tokio::spawn(
                trigger_source(
                    responder.clone(),
                    self.state.clone(),
                    checkpoint_id,
                    self.config.timeout,
                    self.ctx.clone(),
                )
                .in_current_span(),
            );
        }
    }

    /// Returns false when the loop must stop.
    fn handle_signal(&self, signal: Signal) -> bool {
        let checkpoint_id = signal.barrier.checkpoint_id;
        match signal.message {
            SignalMessage::Stop => {
                info!("Stop checkpoint scheduler");
                return false;
            }
            SignalMessage::Ack => {
                debug!(op = %signal.barrier.op_id, checkpoint_id, "Receive ack");
                match self.state.ack(&signal.barrier.op_id, checkpoint_id) {
                    Ok(true) => {
                        if let Err(err) = self.state.complete(checkpoint_id) {
                            warn!(checkpoint_id, "Failed to complete checkpoint: {err:#}");
                        }
                    }
                    Ok(false) => {}
                    Err(err) => warn!(checkpoint_id, "Failed to record ack: {err:#}"),
                }
            }
            SignalMessage::Dec => {
                info!(op = %signal.barrier.op_id, checkpoint_id, "Receive checkpoint decline");
                if let Err(err) = self.state.cancel(checkpoint_id) {
                    warn!(checkpoint_id, "Failed to cancel checkpoint: {err:#}");
                }
            }
        }
        true
    }
}

/// Ask one source to inject a barrier, then wait out the timeout.
async fn trigger_source(
    responder: Arc<dyn Responder>,
    state: Arc<CoordinatorState>,
    checkpoint_id: CheckpointId,
    timeout: Duration,
    ctx: StreamContext,
) {
    if let Err(err) = responder.trigger_checkpoint(checkpoint_id).await {
        error!(
            source = responder.name(),
            checkpoint_id, "Failed to trigger checkpoint, cancel it: {err:#}"
        );
        if let Err(err) = state.cancel(checkpoint_id) {
            warn!(checkpoint_id, "Failed to cancel checkpoint: {err:#}");
        }
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            if state.is_pending(checkpoint_id).unwrap_or(false) {
                info!("{}", EngineError::Timeout(checkpoint_id, timeout));
            }
        }
        _ = ctx.cancelled() => {
            info!(checkpoint_id, "Stop ongoing checkpoint");
        }
    }
    if let Err(err) = state.cancel(checkpoint_id) {
        warn!(checkpoint_id, "Failed to cancel checkpoint: {err:#}");
    }
}
