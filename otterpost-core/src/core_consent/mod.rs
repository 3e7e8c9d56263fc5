//! Per-contact consent cache

pub mod tracker;

pub use tracker::{push_consent, ConsentTracker};
