use super::*;

/// What a node should do with an item after barrier processing.
#[derive(Debug, Clone, PartialEq)]
pub enum BarrierAction {
    /// Barrier or buffered data; nothing to process now.
    Consumed,
    /// Regular data for the operator.
    Forward(StreamEvent),
}

impl BarrierAction {
    pub fn is_consumed(&self) -> bool {
        matches!(self, BarrierAction::Consumed)
    }
}

/// Pre-processes every tagged input item of a non-source node.
#[async_trait]
pub trait BarrierHandler: Send + Sync {
    async fn process(&mut self, data: BufferOrEvent) -> Result<BarrierAction>;

    /// Channel that receives released buffered items ahead of new input.
    fn set_output(&mut self, _output: ReplaySender) {}
}

/// Pick the handler for a node's QoS. At-most-once needs none.
pub fn create_barrier_handler(
    responder: Arc<dyn Responder>,
    input_count: usize,
    qos: Qos,
) -> Option<Box<dyn BarrierHandler>> {
    match qos {
        Qos::AtMostOnce => None,
        Qos::AtLeastOnce => Some(Box::new(BarrierTracker::new(responder, input_count))),
        Qos::ExactlyOnce => Some(Box::new(BarrierAligner::new(responder, input_count))),
    }
}

/// At-least-once handler: counts barriers per checkpoint, never blocks data.
pub struct BarrierTracker {
    responder: Arc<dyn Responder>,
    input_count: usize,
    pending: AHashMap<CheckpointId, usize>,
}

impl BarrierTracker {
    pub fn new(responder: Arc<dyn Responder>, input_count: usize) -> Self {
        Self {
            responder,
            input_count: input_count.max(1),
            pending: AHashMap::new(),
        }
    }

    /// Checkpoints with at least one barrier seen but not all.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn process_barrier(&mut self, barrier: &Barrier) {
        let checkpoint_id = barrier.checkpoint_id;
        if self.input_count == 1 {
            self.trigger(checkpoint_id).await;
            return;
        }

        let count = self.pending.entry(checkpoint_id).or_insert(0);
        *count += 1;
        if *count < self.input_count {
            debug!(
                task = self.responder.name(),
                checkpoint_id,
                seen = *count,
                "Barrier tracked"
            );
            return;
        }
        self.pending.remove(&checkpoint_id);
        // Older checkpoints can no longer complete on this task.
        self.pending.retain(|id, _| *id > checkpoint_id);
        self.trigger(checkpoint_id).await;
    }

    async fn trigger(&self, checkpoint_id: CheckpointId) {
        debug!(task = self.responder.name(), checkpoint_id, "All barriers received");
        if let Err(err) = self.responder.trigger_checkpoint(checkpoint_id).await {
            warn!(
                task = self.responder.name(),
                checkpoint_id, "Trigger checkpoint failed: {err:#}"
            );
        }
    }
}

#[async_trait]
impl BarrierHandler for BarrierTracker {
    async fn process(&mut self, data: BufferOrEvent) -> Result<BarrierAction> {
        match data.data {
            StreamEvent::Barrier(barrier) => {
                self.process_barrier(&barrier).await;
                Ok(BarrierAction::Consumed)
            }
            other => Ok(BarrierAction::Forward(other)),
        }
    }
}
