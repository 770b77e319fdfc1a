//! Per-node execution context: identity, cancellation, state and logging span.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::checkpoint::Store;
use crate::types::{CheckpointId, StateMap};

/// Context handed to every node of a rule.
///
/// Cloning is cheap and shares the same state map. Contexts derived with
/// [`StreamContext::with_operator`] get their own state and a child
/// cancellation token, so cancelling the rule context stops every node.
#[derive(Clone)]
pub struct StreamContext {
    rule_id: Arc<str>,
    op_id: Arc<str>,
    instance_id: usize,
    state: Arc<Mutex<StateMap>>,
    store: Option<Arc<dyn Store>>,
    cancel: CancellationToken,
    span: tracing::Span,
}

impl StreamContext {
    pub fn new(rule_id: impl Into<String>) -> Self {
        let rule_id: String = rule_id.into();
        let span = tracing::info_span!("rule", rule = %rule_id);
        Self {
            rule_id: Arc::from(rule_id),
            op_id: Arc::from(""),
            instance_id: 0,
            state: Arc::new(Mutex::new(StateMap::new())),
            store: None,
            cancel: CancellationToken::new(),
            span,
        }
    }

    /// Attach the checkpoint store used by [`save_state`](Self::save_state)
    /// and [`restore_state`](Self::restore_state).
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_instance(mut self, instance_id: usize) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Derive the context of one node.
    pub fn with_operator(&self, op_id: &str) -> Self {
        Self {
            rule_id: self.rule_id.clone(),
            op_id: Arc::from(op_id),
            instance_id: self.instance_id,
            state: Arc::new(Mutex::new(StateMap::new())),
            store: self.store.clone(),
            cancel: self.cancel.child_token(),
            span: tracing::info_span!(parent: &self.span, "node", op = %op_id),
        }
    }

    /// Same identity and state, cancellable on its own.
    pub fn with_cancel(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn op_id(&self) -> &str {
        &self.op_id
    }

    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Store a state entry, serialized to JSON.
    pub fn put_state<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize state {key}"))?;
        self.lock_state()?.insert(key.to_string(), value);
        Ok(())
    }

    /// Read a state entry back.
    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let state = self.lock_state()?;
        match state.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("Failed to deserialize state {key}")),
            None => Ok(None),
        }
    }

    pub fn delete_state(&self, key: &str) -> Result<()> {
        self.lock_state()?.remove(key);
        Ok(())
    }

    /// Copy of the whole state map, taken at barrier time.
    pub fn snapshot_state(&self) -> Result<StateMap> {
        Ok(self.lock_state()?.clone())
    }

    /// Persist a snapshot for the given checkpoint. A no-op without a store.
    pub fn save_state(&self, checkpoint_id: CheckpointId, state: &StateMap) -> Result<()> {
        match &self.store {
            Some(store) => store.save_state(checkpoint_id, &self.op_id, state),
            None => Ok(()),
        }
    }

    /// Load this node's state from the latest completed checkpoint.
    pub fn restore_state(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let restored = store.restore_state(&self.op_id)?;
        if !restored.is_empty() {
            tracing::info!(op = %self.op_id, keys = restored.len(), "Restored state");
        }
        *self.lock_state()? = restored;
        Ok(())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, StateMap>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("state lock poisoned for {}", self.op_id))
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("rule_id", &self.rule_id)
            .field("op_id", &self.op_id)
            .field("instance_id", &self.instance_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryStore;
    use serde_json::json;

    #[test]
    fn test_state_put_get() {
        let ctx = StreamContext::new("rule1").with_operator("op1");
        ctx.put_state("count", &3u64).unwrap();
        assert_eq!(ctx.get_state::<u64>("count").unwrap(), Some(3));
        assert_eq!(ctx.get_state::<u64>("missing").unwrap(), None);

        ctx.delete_state("count").unwrap();
        assert!(ctx.snapshot_state().unwrap().is_empty());
    }

    #[test]
    fn test_operator_contexts_do_not_share_state() {
        let root = StreamContext::new("rule1");
        let a = root.with_operator("a");
        let b = root.with_operator("b");
        a.put_state("k", &1).unwrap();
        assert_eq!(b.get_state::<i32>("k").unwrap(), None);
        assert_eq!(a.with_cancel().get_state::<i32>("k").unwrap(), Some(1));
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let root = StreamContext::new("rule1");
        let child = root.with_operator("a");
        let grandchild = child.with_cancel();
        grandchild.cancel();
        assert!(!child.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_save_and_restore_through_store() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = StreamContext::new("rule1")
            .with_store(store.clone())
            .with_operator("op1");
        ctx.put_state("offset", &json!(10)).unwrap();
        let snapshot = ctx.snapshot_state().unwrap();
        ctx.save_state(100, &snapshot).unwrap();
        store.save_checkpoint(100).unwrap();

        let restored = StreamContext::new("rule1")
            .with_store(store)
            .with_operator("op1");
        restored.restore_state().unwrap();
        assert_eq!(restored.get_state::<i64>("offset").unwrap(), Some(10));
    }
}
