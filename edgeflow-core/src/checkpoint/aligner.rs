use super::*;

/// Upper bound on buffered items before an alignment is aborted.
pub const DEFAULT_MAX_ALIGNMENT_BUFFER: usize = 10_000;

/// Exactly-once handler: blocks each input after its barrier until every
/// input delivered the same barrier, then snapshots and releases the buffer.
pub struct BarrierAligner {
    responder: Arc<dyn Responder>,
    input_count: usize,
    max_buffer_size: usize,
    current_checkpoint_id: Option<CheckpointId>,
    blocked_channels: AHashSet<String>,
    buffer: VecDeque<BufferOrEvent>,
    output: Option<ReplaySender>,
}

impl BarrierAligner {
    pub fn new(responder: Arc<dyn Responder>, input_count: usize) -> Self {
        Self {
            responder,
            input_count: input_count.max(1),
            max_buffer_size: DEFAULT_MAX_ALIGNMENT_BUFFER,
            current_checkpoint_id: None,
            blocked_channels: AHashSet::new(),
            buffer: VecDeque::new(),
            output: None,
        }
    }

    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size.max(1);
        self
    }

    pub fn current_checkpoint_id(&self) -> Option<CheckpointId> {
        self.current_checkpoint_id
    }

    pub fn is_blocked(&self, channel: &str) -> bool {
        self.blocked_channels.contains(channel)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn is_newer(&self, checkpoint_id: CheckpointId) -> bool {
        self.current_checkpoint_id
            .map_or(true, |current| checkpoint_id > current)
    }

    async fn process_barrier(&mut self, barrier: Barrier) -> Result<()> {
        let checkpoint_id = barrier.checkpoint_id;
        debug!(
            task = self.responder.name(),
            checkpoint_id,
            from = %barrier.op_id,
            "Aligner process barrier"
        );

        if self.input_count == 1 {
            if self.is_newer(checkpoint_id) {
                self.current_checkpoint_id = Some(checkpoint_id);
                self.trigger(checkpoint_id).await;
            }
            return Ok(());
        }

        if !self.blocked_channels.is_empty() {
            if Some(checkpoint_id) == self.current_checkpoint_id {
                self.blocked_channels.insert(barrier.op_id);
            } else if self.is_newer(checkpoint_id) {
                info!(
                    task = self.responder.name(),
                    checkpoint_id,
                    "Received checkpoint barrier before the previous one completed, skip the previous"
                );
                self.release_blocks_and_flush()?;
                self.begin_new_alignment(barrier);
            } else {
                return Ok(());
            }
        } else if self.is_newer(checkpoint_id) {
            self.begin_new_alignment(barrier);
        } else {
            return Ok(());
        }

        if self.blocked_channels.len() >= self.input_count {
            debug!(
                task = self.responder.name(),
                checkpoint_id, "Received all barriers, triggering checkpoint"
            );
            // A failed trigger cancels only this checkpoint; data still flows.
            self.trigger(checkpoint_id).await;
            self.release_blocks_and_flush()?;
        }
        Ok(())
    }

    fn begin_new_alignment(&mut self, barrier: Barrier) {
        self.current_checkpoint_id = Some(barrier.checkpoint_id);
        self.blocked_channels.clear();
        self.blocked_channels.insert(barrier.op_id);
    }

    /// Unblock every channel and replay the buffer in arrival order.
    fn release_blocks_and_flush(&mut self) -> Result<()> {
        self.blocked_channels.clear();
        if self.buffer.is_empty() {
            return Ok(());
        }
        let output = self.output.as_ref().ok_or_else(|| {
            anyhow!(
                "aligner of {} has buffered data but no replay output",
                self.responder.name()
            )
        })?;
        for item in self.buffer.drain(..) {
            output
                .send(item)
                .map_err(|_| anyhow!("replay channel closed"))?;
        }
        Ok(())
    }

    async fn trigger(&self, checkpoint_id: CheckpointId) {
        if let Err(err) = self.responder.trigger_checkpoint(checkpoint_id).await {
            warn!(
                task = self.responder.name(),
                checkpoint_id, "Trigger checkpoint failed: {err:#}"
            );
        }
    }
}

#[async_trait]
impl BarrierHandler for BarrierAligner {
    async fn process(&mut self, data: BufferOrEvent) -> Result<BarrierAction> {
        let BufferOrEvent { data, channel } = data;
        match data {
            StreamEvent::Barrier(barrier) => {
                self.process_barrier(barrier).await?;
                Ok(BarrierAction::Consumed)
            }
            other => {
                if self.input_count > 1 && self.blocked_channels.contains(&channel) {
                    self.buffer.push_back(BufferOrEvent::new(other, channel));
                    if self.buffer.len() > self.max_buffer_size {
                        warn!(
                            task = self.responder.name(),
                            checkpoint_id = self.current_checkpoint_id,
                            "Alignment buffer full, abort alignment"
                        );
                        self.release_blocks_and_flush()?;
                    }
                    return Ok(BarrierAction::Consumed);
                }
                Ok(BarrierAction::Forward(other))
            }
        }
    }

    fn set_output(&mut self, output: ReplaySender) {
        self.output = Some(output);
    }
}
