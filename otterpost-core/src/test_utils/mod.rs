//! Test utilities: fixtures over the in-memory network plus async helpers
//! for waiting on session events. Also used by the CLI demo.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
