//! Externally sourced trust profiles
//!
//! - [`cache`]: TTL cache with in-flight deduplication and periodic sweep
//! - [`source`]: the collaborator trait plus a fixed-table implementation
//! - [`http`]: the collaborator over the reputation HTTP API

pub mod cache;
pub mod http;
pub mod source;

pub use cache::{fetch_profiles, ReputationCache, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
pub use http::HttpReputationClient;
pub use source::{ReputationError, ReputationSource, StaticReputationSource};
