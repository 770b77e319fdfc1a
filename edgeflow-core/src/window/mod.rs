use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::StreamContext;
use crate::errors::EngineError;
use crate::time::WatermarkGenerator;
use crate::types::{EventTime, Tuple, WindowTuplesSet};

mod config;
mod count;
mod operator;
mod session;

pub use config::*;
pub use count::*;
pub use operator::*;
pub use session::*;

#[cfg(test)]
#[path = "tests/window_tests.rs"]
mod tests;
