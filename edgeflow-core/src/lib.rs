//! # EdgeFlow Core
//!
//! Checkpoint-consistency and windowing runtime of the EdgeFlow edge
//! streaming engine.
//!
//! - [`types`]: Stream payloads: [`Tuple`](types::Tuple),
//!   [`WindowTuplesSet`](types::WindowTuplesSet),
//!   [`WatermarkTuple`](types::WatermarkTuple), [`Barrier`](types::Barrier)
//!   and the closed [`StreamEvent`](types::StreamEvent) union.
//! - [`checkpoint`]: [`Coordinator`](checkpoint::Coordinator), barrier
//!   handlers, responders, signals and the [`Store`](checkpoint::Store)
//!   contract.
//! - [`window`]: Window configuration and the
//!   [`WindowOperator`](window::WindowOperator) state machine.
//! - [`time`]: Clocks and the [`WatermarkGenerator`](time::WatermarkGenerator).
//! - [`runtime`]: Pipeline nodes and the [`Topology`](runtime::Topology)
//!   that hosts them.

pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod errors;
pub mod runtime;
pub mod time;
pub mod types;
pub mod window;

pub use config::RuleOptions;
pub use context::StreamContext;
pub use errors::EngineError;
