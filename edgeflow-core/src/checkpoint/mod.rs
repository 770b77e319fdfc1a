//! Checkpoint coordination: coordinator, barrier handlers, responders and stores.

use crate::channel::ReplaySender;
use crate::context::StreamContext;
use crate::errors::EngineError;
use crate::runtime::Emitter;
use crate::time::Clock;
use crate::types::{Barrier, BufferOrEvent, CheckpointId, Qos, StateMap, StreamEvent};
use ahash::{AHashMap, AHashSet};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

mod aligner;
mod barrier;
mod coordinator;
mod pending;
mod responder;
mod signal;
mod store;

pub use aligner::*;
pub use barrier::*;
pub use coordinator::*;
pub use pending::*;
pub use responder::*;
pub use signal::*;
pub use store::*;

#[cfg(test)]
#[path = "tests/checkpoint_tests.rs"]
mod tests;
