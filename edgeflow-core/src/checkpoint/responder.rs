use super::*;

/// Per-task checkpoint hook.
#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &str;

    /// Broadcast a barrier downstream and snapshot the task's state.
    ///
    /// The ack (or decline) is sent to the coordinator asynchronously once
    /// the snapshot is persisted.
    async fn trigger_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()>;
}

/// Responder of a non-source task, invoked by its barrier handler.
pub struct TaskResponder {
    name: String,
    ctx: StreamContext,
    emitter: Emitter,
    signal: SignalSender,
}

impl TaskResponder {
    pub fn new(
        name: impl Into<String>,
        ctx: StreamContext,
        emitter: Emitter,
        signal: SignalSender,
    ) -> Self {
        Self {
            name: name.into(),
            ctx,
            emitter,
            signal,
        }
    }
}

#[async_trait]
impl Responder for TaskResponder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn trigger_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        debug!(task = %self.name, checkpoint_id, "Starting checkpoint");
        let barrier = Barrier::new(checkpoint_id, self.name.clone());
        self.emitter
            .broadcast(StreamEvent::Barrier(barrier.clone()))
            .await
            .with_context(|| {
                format!(
                    "failed to broadcast barrier {checkpoint_id} from {}",
                    self.name
                )
            })?;

        // Snapshot in the task loop, persist off it.
        let state = self.ctx.snapshot_state()?;
        let ctx = self.ctx.clone();
        let signal = self.signal.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let saved =
                match tokio::task::spawn_blocking(move || ctx.save_state(checkpoint_id, &state))
                    .await
                {
                    Ok(result) => result,
                    Err(err) => Err(anyhow!("state save task failed: {err}")),
                };
            let sent = match saved {
                Ok(()) => {
                    debug!(task = %name, checkpoint_id, "Saved state");
                    signal.ack(barrier).await
                }
                Err(err) => {
                    warn!(task = %name, checkpoint_id, "Failed to save state: {err:#}");
                    signal.decline(barrier).await
                }
            };
            if let Err(err) = sent {
                warn!(task = %name, checkpoint_id, "Failed to signal coordinator: {err:#}");
            }
        });
        Ok(())
    }
}
