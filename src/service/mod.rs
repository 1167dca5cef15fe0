//! Service layer
//!
//! Business logic over the data and API layers: the batch pipeline, the
//! throughput monitor, and the read-only statistics reporter.

pub mod manager;
pub mod perf;
pub mod stats;

pub use manager::{Manager, RunOptions};
