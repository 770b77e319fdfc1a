//! Output fan-out of a node.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tracing::warn;

use crate::channel::LocalChannelSender;
use crate::types::{Qos, StreamEvent, StreamItem};

/// Broadcasts events to every downstream input of a node.
///
/// With QoS >= at-least-once every item is tagged with the node name so that
/// downstream barrier handlers know which channel it came from.
#[derive(Debug, Clone)]
pub struct Emitter {
    name: Arc<str>,
    qos: Qos,
    outputs: Vec<LocalChannelSender>,
}

impl Emitter {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            qos: Qos::AtMostOnce,
            outputs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qos(&self) -> Qos {
        self.qos
    }

    pub fn set_qos(&mut self, qos: Qos) {
        self.qos = qos;
    }

    pub fn add_output(&mut self, output: LocalChannelSender) {
        self.outputs.push(output);
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn wrap(&self, event: StreamEvent) -> StreamItem {
        StreamItem::wrap(event, self.qos, &self.name)
    }

    /// Send to all outputs concurrently, waiting on full channels.
    pub async fn broadcast(&self, event: StreamEvent) -> Result<()> {
        match self.outputs.as_slice() {
            [] => Ok(()),
            [output] => output.send(self.wrap(event)).await,
            outputs => {
                let item = self.wrap(event);
                let sends = outputs.iter().map(|output| output.send(item.clone()));
                join_all(sends).await.into_iter().collect()
            }
        }
    }

    /// Send to all outputs without waiting; full outputs drop the event.
    ///
    /// Returns the number of outputs that dropped it.
    pub fn try_broadcast(&self, event: StreamEvent) -> Result<usize> {
        let item = self.wrap(event);
        let mut dropped = 0;
        for output in &self.outputs {
            if !output.try_send(item.clone())? {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(node = %self.name, dropped, "Output buffer full, event dropped");
        }
        Ok(dropped)
    }
}
