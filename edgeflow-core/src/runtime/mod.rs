//! Runtime-domain modules: nodes, their shared plumbing and the topology.

pub mod emitter;
pub mod node;
pub mod operator;
pub mod sink;
pub mod source;
pub mod stats;
pub mod topology;
pub mod window_node;

pub use emitter::*;
pub use node::*;
pub use operator::*;
pub use sink::*;
pub use source::*;
pub use stats::*;
pub use topology::*;
pub use window_node::*;

#[cfg(test)]
#[path = "tests/runtime_tests.rs"]
mod tests;
