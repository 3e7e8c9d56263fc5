//! Metric names and descriptions
//!
//! Counters go through the `metrics` facade; the host decides whether to
//! install a recorder. Without one every increment is a no-op.

use ::metrics::{counter, describe_counter, describe_gauge, gauge};

pub const STREAM_EVENTS: &str = "session.stream.events";
pub const STREAM_DUPLICATES: &str = "session.stream.duplicates";
pub const STREAM_CLOSED: &str = "session.stream.closed";
pub const PENDING_RECONCILED: &str = "messages.pending.reconciled";
pub const SEND_FAILURES: &str = "messages.send.failed";
pub const UNREAD_INCREMENTS: &str = "unread.increments";
pub const READ_RECEIPTS_FAILED: &str = "unread.receipts.failed";
pub const REPUTATION_HITS: &str = "reputation.cache.hits";
pub const REPUTATION_MISSES: &str = "reputation.cache.misses";
pub const REPUTATION_SWEEPS: &str = "reputation.cache.sweeps";
pub const REPUTATION_EVICTED: &str = "reputation.cache.evicted";
pub const CLIENT_INIT_FAILURES: &str = "client.init.failed";
pub const CONVERSATIONS_LOADED: &str = "conversations.loaded";

/// Register descriptions with the installed recorder
pub fn init_metrics() {
    describe_counter!(STREAM_EVENTS, "Events received from live streams");
    describe_counter!(STREAM_DUPLICATES, "Streamed messages dropped as duplicates");
    describe_counter!(STREAM_CLOSED, "Live streams that ended unexpectedly");
    describe_counter!(PENDING_RECONCILED, "Optimistic sends matched by a network message");
    describe_counter!(SEND_FAILURES, "Sends that left a failed pending message");
    describe_counter!(UNREAD_INCREMENTS, "Inbound messages counted as unread");
    describe_counter!(READ_RECEIPTS_FAILED, "Read receipts that failed to send");
    describe_counter!(REPUTATION_HITS, "Reputation lookups served from cache");
    describe_counter!(REPUTATION_MISSES, "Reputation lookups requiring a fetch");
    describe_counter!(REPUTATION_SWEEPS, "Reputation cache expiry sweeps");
    describe_counter!(REPUTATION_EVICTED, "Expired reputation entries removed");
    describe_counter!(CLIENT_INIT_FAILURES, "Failed client initializations");
    describe_gauge!(CONVERSATIONS_LOADED, "Conversations held by the session store");
}

pub fn increment(name: &'static str) {
    counter!(name).increment(1);
}

pub fn increment_by(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

pub fn set_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        init_metrics();
        increment(STREAM_EVENTS);
        increment_by(REPUTATION_EVICTED, 3);
        set_gauge(CONVERSATIONS_LOADED, 2.0);
    }
}
