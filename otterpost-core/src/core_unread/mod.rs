//! Read positions, unread counts and the local key/value store behind them

pub mod storage;
pub mod tracker;

pub use storage::{FileKvStore, KeyValueStore, MemoryKvStore, Preferences, StorageError};
pub use tracker::UnreadTracker;
