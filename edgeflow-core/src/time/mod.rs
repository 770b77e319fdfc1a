use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use anyhow::Result;
use tracing::debug;

use crate::channel::WeakChannelSender;
use crate::errors::EngineError;
use crate::types::{EventTime, StreamEvent, StreamItem, Tuple, WatermarkTuple};
use crate::window::{session_window_end, WindowConfig, WindowType};

mod clock;
mod watermark;

pub use clock::*;
pub use watermark::*;

#[cfg(test)]
#[path = "tests/time_tests.rs"]
mod tests;
