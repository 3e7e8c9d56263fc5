//! Consent State Tracker
//!
//! Local cache of the three-state consent machine. The remote store is the
//! source of truth:
//!
//! - user actions write remotely first ([`push_consent`]) and are committed
//!   locally only on success, for the whole batch at once
//! - stream and batch-fetch records are timestamp-gated; an older record
//!   never overwrites a newer one
//!
//! The tracker is a plain owned struct; the session loop is its only writer.

use crate::core_protocol::MessagingBackend;
use crate::errors::SyncResult;
use crate::model::{ConsentAction, ConsentRecord, ConsentState, InboxId};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct ConsentTracker {
    records: HashMap<InboxId, ConsentRecord>,
}

impl ConsentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached state; `Unknown` when nothing is cached
    pub fn state(&self, inbox_id: &InboxId) -> ConsentState {
        self.records.get(inbox_id).map(|r| r.state).unwrap_or_default()
    }

    pub fn record(&self, inbox_id: &InboxId) -> Option<&ConsentRecord> {
        self.records.get(inbox_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Apply a record from the network; returns whether the state changed
    pub fn apply_remote(&mut self, record: ConsentRecord) -> bool {
        if let Some(existing) = self.records.get(&record.inbox_id) {
            if existing.last_updated_ns > record.last_updated_ns {
                debug!(inbox_id = %record.inbox_id, "Ignoring stale consent record");
                return false;
            }
        }
        let previous = self.state(&record.inbox_id);
        let changed = previous != record.state;
        self.records.insert(record.inbox_id.clone(), record);
        changed
    }

    /// Apply a batch of remote records; returns the ids whose state changed
    pub fn apply_remote_batch(&mut self, records: Vec<ConsentRecord>) -> Vec<InboxId> {
        records
            .into_iter()
            .filter_map(|record| {
                let id = record.inbox_id.clone();
                self.apply_remote(record).then_some(id)
            })
            .collect()
    }

    /// Commit a user action after the remote write succeeded
    ///
    /// Applies to every id or (when called only on success) to none.
    /// Returns the ids whose state changed.
    pub fn commit(&mut self, inbox_ids: &[InboxId], state: ConsentState, now_ns: u64) -> Vec<InboxId> {
        let mut changed = Vec::new();
        for id in inbox_ids {
            let stamp = self
                .records
                .get(id)
                .map_or(now_ns, |r| now_ns.max(r.last_updated_ns));
            if self.state(id) != state {
                changed.push(id.clone());
            }
            self.records.insert(id.clone(), ConsentRecord::new(id.clone(), state, stamp));
        }
        info!(count = inbox_ids.len(), state = %state, "Consent committed");
        changed
    }

    /// Drop every cached record (client became unavailable)
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Remote-first update for hosts that drive the tracker directly
    pub async fn update(
        &mut self,
        backend: &dyn MessagingBackend,
        inbox_ids: &[InboxId],
        action: ConsentAction,
    ) -> SyncResult<Vec<InboxId>> {
        let state = push_consent(backend, inbox_ids, action).await?;
        Ok(self.commit(inbox_ids, state, crate::model::now_ns()))
    }

    pub async fn allow(
        &mut self,
        backend: &dyn MessagingBackend,
        inbox_ids: &[InboxId],
    ) -> SyncResult<Vec<InboxId>> {
        self.update(backend, inbox_ids, ConsentAction::Allow).await
    }

    pub async fn deny(
        &mut self,
        backend: &dyn MessagingBackend,
        inbox_ids: &[InboxId],
    ) -> SyncResult<Vec<InboxId>> {
        self.update(backend, inbox_ids, ConsentAction::Deny).await
    }

    pub async fn reset(
        &mut self,
        backend: &dyn MessagingBackend,
        inbox_ids: &[InboxId],
    ) -> SyncResult<Vec<InboxId>> {
        self.update(backend, inbox_ids, ConsentAction::Reset).await
    }
}

/// Write a consent action to the remote store; returns the target state
pub async fn push_consent(
    backend: &dyn MessagingBackend,
    inbox_ids: &[InboxId],
    action: ConsentAction,
) -> SyncResult<ConsentState> {
    let state = action.target_state();
    if inbox_ids.is_empty() {
        return Ok(state);
    }
    backend.set_consent_states(inbox_ids, state).await?;
    Ok(state)
}
