//! Test infrastructure for the config sync engine
//!
//! Provides:
//! - Config object and change event builders
//! - Reaction map fixtures for common graph shapes
//! - A recording handler that logs every evaluation and deletion
//! - A harness wiring engine, in-memory store and bus into a consumer
//! - Verification helpers over the store and the cache

pub mod fixtures;
mod harness;
mod recording;
mod verification;

pub use fixtures::*;
pub use harness::{Harness, HarnessOptions};
pub use recording::{EvalRecord, RecordingHandler};
pub use verification::*;
