use super::*;

/// Persistence contract for checkpoint state.
///
/// Tasks call [`save_state`](Store::save_state) per checkpoint; the
/// coordinator calls [`save_checkpoint`](Store::save_checkpoint) once every
/// task acked, which makes that checkpoint the one restored on restart.
pub trait Store: Send + Sync {
    fn save_state(&self, checkpoint_id: CheckpointId, op_id: &str, state: &StateMap)
        -> Result<()>;

    /// State of `op_id` in the latest committed checkpoint, empty if none.
    fn restore_state(&self, op_id: &str) -> Result<StateMap>;

    fn save_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()>;
}

/// Persisted checkpoint metadata, the commit marker of [`FsStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMetadata {
    pub checkpoint_id: CheckpointId,
    pub op_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct CommittedCheckpoint {
    checkpoint_id: CheckpointId,
    states: HashMap<String, StateMap>,
}

/// In-memory store for tests and rules that only need in-process recovery.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    staged: Mutex<BTreeMap<CheckpointId, HashMap<String, StateMap>>>,
    committed: Mutex<Option<CommittedCheckpoint>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_checkpoint(&self) -> Result<Option<CheckpointId>> {
        Ok(self
            .committed
            .lock()
            .map_err(|_| anyhow!("committed checkpoint lock poisoned"))?
            .as_ref()
            .map(|c| c.checkpoint_id))
    }

    /// Checkpoints with saved state that are not committed yet.
    pub fn staged_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        Ok(self
            .staged
            .lock()
            .map_err(|_| anyhow!("staged state lock poisoned"))?
            .keys()
            .copied()
            .collect())
    }
}

impl Store for InMemoryStore {
    fn save_state(
        &self,
        checkpoint_id: CheckpointId,
        op_id: &str,
        state: &StateMap,
    ) -> Result<()> {
        self.staged
            .lock()
            .map_err(|_| anyhow!("staged state lock poisoned"))?
            .entry(checkpoint_id)
            .or_default()
            .insert(op_id.to_string(), state.clone());
        Ok(())
    }

    fn restore_state(&self, op_id: &str) -> Result<StateMap> {
        Ok(self
            .committed
            .lock()
            .map_err(|_| anyhow!("committed checkpoint lock poisoned"))?
            .as_ref()
            .and_then(|c| c.states.get(op_id).cloned())
            .unwrap_or_default())
    }

    fn save_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let states = {
            let mut staged = self
                .staged
                .lock()
                .map_err(|_| anyhow!("staged state lock poisoned"))?;
            let states = staged.remove(&checkpoint_id).ok_or_else(|| {
                EngineError::storage(format!("checkpoint {checkpoint_id} has no saved state"))
            })?;
            staged.retain(|id, _| *id > checkpoint_id);
            states
        };
        *self
            .committed
            .lock()
            .map_err(|_| anyhow!("committed checkpoint lock poisoned"))? =
            Some(CommittedCheckpoint {
                checkpoint_id,
                states,
            });
        Ok(())
    }
}

/// File-system store.
///
/// Layout: `<base>/chk-<id>/state-<op>.json` per task and a bincode
/// `metadata.bin` written on commit. Only directories with metadata count as
/// committed.
#[derive(Debug)]
pub struct FsStore {
    base_path: PathBuf,
    retained: usize,
}

impl FsStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).with_context(|| {
            format!(
                "failed to create checkpoint store directory {}",
                base_path.display()
            )
        })?;
        Ok(Self {
            base_path,
            retained: 3,
        })
    }

    /// Number of committed checkpoints kept on disk.
    pub fn with_retained(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    fn checkpoint_dir(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.base_path.join(format!("chk-{checkpoint_id}"))
    }

    fn metadata_path(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.checkpoint_dir(checkpoint_id).join("metadata.bin")
    }

    fn state_path(&self, checkpoint_id: CheckpointId, op_id: &str) -> PathBuf {
        self.checkpoint_dir(checkpoint_id)
            .join(format!("state-{op_id}.json"))
    }

    fn all_checkpoint_dirs(&self) -> Result<Vec<CheckpointId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_path)
            .with_context(|| format!("read_dir failed for {}", self.base_path.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id_part) = name.strip_prefix("chk-") {
                if let Ok(id) = id_part.parse::<CheckpointId>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Committed checkpoint ids, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        Ok(self
            .all_checkpoint_dirs()?
            .into_iter()
            .filter(|id| self.metadata_path(*id).is_file())
            .collect())
    }

    pub fn load_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<CheckpointMetadata> {
        let bytes = fs::read(self.metadata_path(checkpoint_id))
            .with_context(|| format!("read metadata of checkpoint {checkpoint_id} failed"))?;
        bincode::deserialize(&bytes).context("deserialize checkpoint metadata failed")
    }

    /// Keep the newest `keep_last_n` committed checkpoints and drop
    /// uncommitted ones older than the newest commit.
    pub fn purge(&self, keep_last_n: usize) -> Result<()> {
        let committed = self.list_checkpoints()?;
        let Some(&latest) = committed.last() else {
            return Ok(());
        };
        let keep: HashSet<CheckpointId> = committed
            .iter()
            .rev()
            .take(keep_last_n)
            .copied()
            .collect();
        for checkpoint_id in self.all_checkpoint_dirs()? {
            let is_committed = committed.binary_search(&checkpoint_id).is_ok();
            let stale = if is_committed {
                !keep.contains(&checkpoint_id)
            } else {
                checkpoint_id < latest
            };
            if stale {
                let dir = self.checkpoint_dir(checkpoint_id);
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to remove {}", dir.display()))?;
            }
        }
        Ok(())
    }
}

impl Store for FsStore {
    fn save_state(
        &self,
        checkpoint_id: CheckpointId,
        op_id: &str,
        state: &StateMap,
    ) -> Result<()> {
        let checkpoint_dir = self.checkpoint_dir(checkpoint_id);
        fs::create_dir_all(&checkpoint_dir).with_context(|| {
            format!(
                "failed to create checkpoint dir {}",
                checkpoint_dir.display()
            )
        })?;
        let bytes = serde_json::to_vec(state)
            .with_context(|| format!("serialize state of {op_id} failed"))?;
        fs::write(self.state_path(checkpoint_id, op_id), bytes)
            .with_context(|| format!("write state of {op_id} failed"))
    }

    fn restore_state(&self, op_id: &str) -> Result<StateMap> {
        let Some(&latest) = self.list_checkpoints()?.last() else {
            return Ok(StateMap::new());
        };
        let path = self.state_path(latest, op_id);
        if !path.is_file() {
            return Ok(StateMap::new());
        }
        let bytes = fs::read(&path).with_context(|| format!("read {} failed", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("deserialize state of {op_id} failed"))
    }

    fn save_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let checkpoint_dir = self.checkpoint_dir(checkpoint_id);
        if !checkpoint_dir.is_dir() {
            return Err(EngineError::storage(format!(
                "checkpoint {checkpoint_id} has no saved state"
            ))
            .into());
        }

        let mut op_ids = Vec::new();
        for entry in fs::read_dir(&checkpoint_dir)
            .with_context(|| format!("read_dir failed for {}", checkpoint_dir.display()))?
        {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(op_id) = name
                .strip_prefix("state-")
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                op_ids.push(op_id.to_string());
            }
        }
        op_ids.sort_unstable();

        let metadata = CheckpointMetadata {
            checkpoint_id,
            op_ids,
        };
        let bytes =
            bincode::serialize(&metadata).context("serialize checkpoint metadata failed")?;
        fs::write(self.metadata_path(checkpoint_id), bytes)
            .context("write checkpoint metadata failed")?;
        // Committed once metadata is on disk; retention is best effort.
        if let Err(err) = self.purge(self.retained) {
            warn!(checkpoint_id, "Failed to purge old checkpoints: {err:#}");
        }
        Ok(())
    }
}
