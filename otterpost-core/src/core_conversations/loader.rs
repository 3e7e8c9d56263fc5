//! Conversation preview building
//!
//! The initial load runs three batched phases after the list call, one round
//! trip each regardless of conversation count:
//!
//! ```text
//! sync + list ──► resolve DM peers ──► consent for peers ──► latest messages
//! ```
//!
//! Conversations arriving later from the stream go through [`preview_one`].

use crate::core_identity::IdentityResolver;
use crate::core_messages::preview_of;
use crate::core_protocol::MessagingBackend;
use crate::errors::SyncResult;
use crate::model::{
    Address, ConsentRecord, ConsentState, Conversation, ConversationId, ConversationInfo,
    ConversationKind, InboxId,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Output of the initial load
#[derive(Debug, Default)]
pub struct LoadedConversations {
    pub conversations: Vec<Conversation>,
    /// Consent records fetched for DM peers, for seeding the tracker
    pub consent: Vec<ConsentRecord>,
}

fn with_address(mut info: ConversationInfo, resolved: &HashMap<InboxId, Option<Address>>) -> ConversationInfo {
    if let ConversationKind::Dm { peer_inbox_id, peer_address } = &mut info.kind {
        if peer_address.is_none() {
            *peer_address = resolved.get(peer_inbox_id).cloned().flatten();
        }
    }
    info
}

fn distinct_peers(infos: &[ConversationInfo]) -> Vec<InboxId> {
    let mut peers: Vec<InboxId> = Vec::new();
    for peer in infos.iter().filter_map(ConversationInfo::peer_inbox_id) {
        if !peers.contains(peer) {
            peers.push(peer.clone());
        }
    }
    peers
}

/// Sync, list, and build every preview in three batched phases
///
/// A failed list or consent fetch fails the load (the views would be
/// wrong); a failed latest-message fetch only leaves previews empty.
pub async fn load_all(
    backend: &dyn MessagingBackend,
    resolver: &IdentityResolver,
) -> SyncResult<LoadedConversations> {
    backend.sync_conversations().await?;
    let infos = backend.list_conversations().await?;
    let peers = distinct_peers(&infos);
    let ids: Vec<ConversationId> = infos.iter().map(|i| i.id.clone()).collect();

    // Phase 1: identities
    let resolved = resolver.resolve_batch(&peers).await;

    // Phase 2: consent
    let consent = if peers.is_empty() {
        Vec::new()
    } else {
        backend.consent_states(&peers).await?
    };
    let consent_by_peer: HashMap<&InboxId, ConsentState> =
        consent.iter().map(|r| (&r.inbox_id, r.state)).collect();

    // Phase 3: latest message per conversation
    let latest = if ids.is_empty() {
        HashMap::new()
    } else {
        backend.latest_messages(&ids).await.unwrap_or_else(|e| {
            warn!(error = %e, "Latest-message batch failed; previews left empty");
            HashMap::new()
        })
    };

    let conversations: Vec<Conversation> = infos
        .into_iter()
        .map(|info| {
            let state = info
                .peer_inbox_id()
                .and_then(|p| consent_by_peer.get(p).copied())
                .unwrap_or_default();
            let preview = latest.get(&info.id).map(preview_of);
            Conversation::new(with_address(info, &resolved), state, preview)
        })
        .collect();

    info!(
        conversations = conversations.len(),
        peers = peers.len(),
        "Initial conversation load complete"
    );
    Ok(LoadedConversations { conversations, consent })
}

/// Build the preview for one streamed (or backfilled) conversation
///
/// Returns the fetched consent record alongside so the caller can apply it
/// to the tracker timestamp-gated.
pub async fn preview_one(
    backend: &dyn MessagingBackend,
    resolver: &IdentityResolver,
    info: ConversationInfo,
) -> SyncResult<(Conversation, Option<ConsentRecord>)> {
    let mut resolved = HashMap::new();
    let mut record = None;
    if let Some(peer) = info.peer_inbox_id().cloned() {
        resolved.insert(peer.clone(), resolver.resolve(&peer).await);
        record = backend.consent_states(std::slice::from_ref(&peer)).await?.into_iter().next();
    }

    let preview = match backend.latest_messages(std::slice::from_ref(&info.id)).await {
        Ok(mut latest) => latest.remove(&info.id).as_ref().map(preview_of),
        Err(e) => {
            warn!(conversation_id = %info.id, error = %e, "Latest message fetch failed");
            None
        }
    };

    let state = record.as_ref().map(|r| r.state).unwrap_or_default();
    debug!(conversation_id = %info.id, consent = %state, "Previewed conversation");
    Ok((Conversation::new(with_address(info, &resolved), state, preview), record))
}
