//! Shared infrastructure used by every Rig crate: error types, tracing
//! setup, duration parsing, and the Levenshtein distance helper used by
//! the spec validator's "did you mean" diagnostics.

pub mod duration;
pub mod error;
pub mod levenshtein;
pub mod logging;

pub use duration::parse_duration;
pub use error::{Error, Result};
pub use logging::{init_tracing, init_tracing_json};
