use super::*;

/// Checkpoint waiting for acknowledgements.
#[derive(Debug, Clone)]
pub struct PendingCheckpoint {
    checkpoint_id: CheckpointId,
    not_yet_acked: HashSet<String>,
    is_discarded: bool,
}

impl PendingCheckpoint {
    pub fn new(checkpoint_id: CheckpointId, tasks_to_wait_for: &[String]) -> Self {
        Self {
            checkpoint_id,
            not_yet_acked: tasks_to_wait_for.iter().cloned().collect(),
            is_discarded: false,
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    /// Record an ack. Returns false for discarded checkpoints and unknown or
    /// duplicate tasks.
    pub fn ack(&mut self, op_id: &str) -> bool {
        if self.is_discarded {
            return false;
        }
        self.not_yet_acked.remove(op_id)
    }

    pub fn is_fully_acked(&self) -> bool {
        self.not_yet_acked.is_empty()
    }

    pub fn dispose(&mut self) {
        self.is_discarded = true;
        self.not_yet_acked.clear();
    }

    pub fn is_discarded(&self) -> bool {
        self.is_discarded
    }

    /// Tasks that have not acked yet, sorted by name.
    pub fn remaining(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self.not_yet_acked.iter().cloned().collect();
        tasks.sort_unstable();
        tasks
    }

    pub fn finalize(self) -> CompletedCheckpoint {
        CompletedCheckpoint {
            checkpoint_id: self.checkpoint_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedCheckpoint {
    pub checkpoint_id: CheckpointId,
}

/// Bounded history of completed checkpoints, oldest first.
#[derive(Debug)]
pub struct CompletedCheckpoints {
    max_size: usize,
    checkpoints: VecDeque<CompletedCheckpoint>,
    total: u64,
}

impl CompletedCheckpoints {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            checkpoints: VecDeque::new(),
            total: 0,
        }
    }

    pub fn add(&mut self, checkpoint: CompletedCheckpoint) {
        self.checkpoints.push_back(checkpoint);
        self.total += 1;
        while self.checkpoints.len() > self.max_size {
            self.checkpoints.pop_front();
        }
    }

    pub fn latest(&self) -> Option<CheckpointId> {
        self.checkpoints.back().map(|c| c.checkpoint_id)
    }

    pub fn ids(&self) -> Vec<CheckpointId> {
        self.checkpoints.iter().map(|c| c.checkpoint_id).collect()
    }

    /// Retained entries, never more than the configured maximum.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Number of checkpoints completed since start, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total
    }
}
