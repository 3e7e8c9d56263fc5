//! In-memory protocol collaborator
//!
//! A complete [`MessagingBackend`] / [`ClientFactory`] implementation backed by
//! a shared [`InMemoryNetwork`]. Every client created from the same network
//! sees the same conversations, messages and consent, and live streams are
//! fanned out to every member.
//!
//! Beyond plain behavior the network records a call log per [`BackendOp`] and
//! supports failure and latency injection, so tests can assert batching
//! (one round trip per phase), ordering (sync before list) and error paths.

use super::{
    ClientFactory, Installation, MessagingBackend, ProtocolError, ProtocolResult, Signer,
    SignerError,
};
use crate::model::{
    now_ns, Address, ConsentRecord, ConsentState, ConversationId, ConversationInfo,
    ConversationKind, InboxId, Message, MessageContent, MessageId, SystemEvent,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

const STREAM_CAPACITY: usize = 256;
const DEFAULT_MAX_INSTALLATIONS: usize = 10;

/// Collaborator operations, for call counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    SyncConversations,
    ListConversations,
    GetConversation,
    FindOrCreateDm,
    StreamConversations,
    SyncConversation,
    ListMessages,
    LatestMessages,
    SendText,
    StreamMessages,
    ConsentStates,
    SetConsent,
    StreamConsent,
    AddressesForInboxes,
    InboxForAddress,
    ReadReceipt,
    Restore,
    Create,
    RevokeInstallations,
}

#[derive(Debug, Clone)]
enum FailureMode {
    Once(ProtocolError),
    Always(ProtocolError),
}

#[derive(Debug, Clone)]
struct StoredConversation {
    id: ConversationId,
    members: Vec<InboxId>,
    group_name: Option<String>,
    is_group: bool,
    created_at_ns: u64,
}

impl StoredConversation {
    fn info_for(&self, viewer: &InboxId) -> ConversationInfo {
        let kind = if self.is_group {
            ConversationKind::Group { name: self.group_name.clone() }
        } else {
            let peer = self
                .members
                .iter()
                .find(|m| *m != viewer)
                .cloned()
                .unwrap_or_else(|| viewer.clone());
            ConversationKind::Dm { peer_inbox_id: peer, peer_address: None }
        };
        ConversationInfo { id: self.id.clone(), kind, created_at_ns: self.created_at_ns }
    }
}

#[derive(Default)]
struct NetworkState {
    registry: HashMap<Address, InboxId>,
    conversations: Vec<StoredConversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    consent: HashMap<InboxId, HashMap<InboxId, ConsentRecord>>,
    conversation_streams: HashMap<InboxId, Vec<mpsc::Sender<ConversationInfo>>>,
    message_streams: HashMap<InboxId, Vec<mpsc::Sender<Message>>>,
    consent_streams: HashMap<InboxId, Vec<mpsc::Sender<ConsentRecord>>>,
    read_receipts: Vec<(InboxId, ConversationId)>,
    failures: HashMap<BackendOp, FailureMode>,
    delays: HashMap<BackendOp, Duration>,
    call_log: Vec<BackendOp>,
    installations: HashMap<Address, Vec<Installation>>,
    max_installations: usize,
    restorable: HashSet<Address>,
    open_handles: HashSet<Address>,
    clock_ns: u64,
    next_id: u64,
}

impl NetworkState {
    /// Monotonic network clock, anchored to wall time
    fn tick(&mut self) -> u64 {
        self.clock_ns = now_ns().max(self.clock_ns + 1);
        self.clock_ns
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn check(&mut self, op: BackendOp) -> ProtocolResult<()> {
        self.call_log.push(op);
        match self.failures.get(&op).cloned() {
            Some(FailureMode::Once(err)) => {
                self.failures.remove(&op);
                Err(err)
            }
            Some(FailureMode::Always(err)) => Err(err),
            None => Ok(()),
        }
    }

    fn conversation(&self, id: &ConversationId) -> Option<&StoredConversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    fn member_conversation(
        &self,
        id: &ConversationId,
        member: &InboxId,
    ) -> ProtocolResult<StoredConversation> {
        self.conversation(id)
            .filter(|c| c.members.contains(member))
            .cloned()
            .ok_or_else(|| ProtocolError::NotFound(format!("conversation {}", id)))
    }

    fn publish_conversation(&mut self, conversation: &StoredConversation) {
        for member in &conversation.members {
            let info = conversation.info_for(member);
            if let Some(senders) = self.conversation_streams.get_mut(member) {
                senders.retain(|tx| !tx.is_closed());
                for tx in senders.iter() {
                    let _ = tx.try_send(info.clone());
                }
            }
        }
    }

    fn publish_message(&mut self, message: &Message) {
        let members = match self.conversation(&message.conversation_id) {
            Some(c) => c.members.clone(),
            None => return,
        };
        for member in members {
            if let Some(senders) = self.message_streams.get_mut(&member) {
                senders.retain(|tx| !tx.is_closed());
                for tx in senders.iter() {
                    let _ = tx.try_send(message.clone());
                }
            }
        }
    }

    fn publish_consent(&mut self, owner: &InboxId, record: &ConsentRecord) {
        if let Some(senders) = self.consent_streams.get_mut(owner) {
            senders.retain(|tx| !tx.is_closed());
            for tx in senders.iter() {
                let _ = tx.try_send(record.clone());
            }
        }
    }

    fn store_message(
        &mut self,
        sender: &InboxId,
        conversation_id: &ConversationId,
        content: MessageContent,
    ) -> Message {
        let message = Message {
            id: MessageId::new(self.next_id("msg")),
            conversation_id: conversation_id.clone(),
            sender_inbox_id: sender.clone(),
            sent_at_ns: self.tick(),
            content,
        };
        self.messages
            .entry(conversation_id.clone())
            .or_default()
            .push(message.clone());
        self.publish_message(&message);
        message
    }
}

/// Shared state behind every in-memory client
#[derive(Clone)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        let state = NetworkState { max_installations: DEFAULT_MAX_INSTALLATIONS, ..Default::default() };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an address on the network and return its inbox id
    pub fn register(&self, address: &Address) -> InboxId {
        let mut state = self.lock();
        state
            .registry
            .entry(address.clone())
            .or_insert_with(|| {
                InboxId::new(format!("inbox-{}", address.as_str().trim_start_matches("0x")))
            })
            .clone()
    }

    pub fn inbox_of(&self, address: &Address) -> Option<InboxId> {
        self.lock().registry.get(address).cloned()
    }

    /// Client for an already registered address, bypassing the factory
    pub fn client(&self, address: &Address) -> Arc<InMemoryBackend> {
        let inbox_id = self.register(address);
        Arc::new(InMemoryBackend {
            network: self.clone(),
            inbox_id,
            address: address.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a DM between two registered inboxes (as if `a` initiated it)
    pub fn create_dm(&self, a: &InboxId, b: &InboxId) -> ConversationId {
        let mut state = self.lock();
        let id = ConversationId::new(state.next_id("conv"));
        let conversation = StoredConversation {
            id: id.clone(),
            members: vec![a.clone(), b.clone()],
            group_name: None,
            is_group: false,
            created_at_ns: state.tick(),
        };
        state.conversations.push(conversation.clone());
        state.publish_conversation(&conversation);
        id
    }

    /// Create a group containing every given member
    pub fn create_group(&self, name: Option<&str>, members: &[InboxId]) -> ConversationId {
        let mut state = self.lock();
        let id = ConversationId::new(state.next_id("group"));
        let conversation = StoredConversation {
            id: id.clone(),
            members: members.to_vec(),
            group_name: name.map(str::to_string),
            is_group: true,
            created_at_ns: state.tick(),
        };
        state.conversations.push(conversation.clone());
        state.publish_conversation(&conversation);
        id
    }

    /// Push a stored conversation to its members' conversation streams again
    pub fn republish_conversation(&self, id: &ConversationId) {
        let mut state = self.lock();
        if let Some(conversation) = state.conversation(id).cloned() {
            state.publish_conversation(&conversation);
        }
    }

    /// Store a text message from `sender` and stream it to all members
    pub fn deliver_text(&self, sender: &InboxId, conversation_id: &ConversationId, text: &str) -> Message {
        self.lock()
            .store_message(sender, conversation_id, MessageContent::Text(text.to_string()))
    }

    /// Store a membership/administration event and stream it to all members
    pub fn deliver_system(
        &self,
        sender: &InboxId,
        conversation_id: &ConversationId,
        event: SystemEvent,
    ) -> Message {
        self.lock()
            .store_message(sender, conversation_id, MessageContent::System(event))
    }

    /// Push an arbitrary message to the live streams without storing it
    /// (duplicate and out-of-order delivery)
    pub fn replay(&self, message: &Message) {
        self.lock().publish_message(message);
    }

    /// Consent change made by `owner` on another device
    pub fn set_remote_consent(&self, owner: &InboxId, inbox_id: &InboxId, state: ConsentState) {
        let mut net = self.lock();
        let record = ConsentRecord::new(inbox_id.clone(), state, net.tick());
        net.consent
            .entry(owner.clone())
            .or_default()
            .insert(inbox_id.clone(), record.clone());
        net.publish_consent(owner, &record);
    }

    /// Consent as stored on the network for `owner`
    pub fn remote_consent(&self, owner: &InboxId, inbox_id: &InboxId) -> ConsentState {
        self.lock()
            .consent
            .get(owner)
            .and_then(|m| m.get(inbox_id))
            .map(|r| r.state)
            .unwrap_or_default()
    }

    /// End every live stream held by `inbox_id`
    pub fn drop_streams(&self, inbox_id: &InboxId) {
        let mut state = self.lock();
        state.conversation_streams.remove(inbox_id);
        state.message_streams.remove(inbox_id);
        state.consent_streams.remove(inbox_id);
    }

    pub fn fail_next(&self, op: BackendOp, error: ProtocolError) {
        self.lock().failures.insert(op, FailureMode::Once(error));
    }

    pub fn fail_always(&self, op: BackendOp, error: ProtocolError) {
        self.lock().failures.insert(op, FailureMode::Always(error));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Delay every call of `op` by `delay` before it is served
    pub fn set_delay(&self, op: BackendOp, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    pub fn calls(&self, op: BackendOp) -> usize {
        self.lock().call_log.iter().filter(|o| **o == op).count()
    }

    pub fn call_log(&self) -> Vec<BackendOp> {
        self.lock().call_log.clone()
    }

    pub fn read_receipts(&self) -> Vec<(InboxId, ConversationId)> {
        self.lock().read_receipts.clone()
    }

    pub fn set_max_installations(&self, max: usize) {
        self.lock().max_installations = max;
    }

    /// Register `count` installations made on other devices
    pub fn add_installations(&self, address: &Address, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            let id = state.next_id("installation");
            let created_at_ns = state.tick();
            state
                .installations
                .entry(address.clone())
                .or_default()
                .push(Installation { id, created_at_ns });
        }
    }

    /// Mark local state for `address` as present on this device
    pub fn mark_restorable(&self, address: &Address) {
        self.lock().restorable.insert(address.clone());
    }

    /// Whether a client currently holds the storage handle for `address`
    pub fn has_open_handle(&self, address: &Address) -> bool {
        self.lock().open_handles.contains(address)
    }

    async fn before(&self, op: BackendOp) -> ProtocolResult<()> {
        let delay = self.lock().delays.get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().check(op)
    }

    fn open_handle(&self, address: &Address) -> ProtocolResult<Arc<InMemoryBackend>> {
        {
            let mut state = self.lock();
            if !state.open_handles.insert(address.clone()) {
                return Err(ProtocolError::Other(format!(
                    "storage for {} is locked by another client",
                    address
                )));
            }
        }
        Ok(self.client(address))
    }
}

/// One in-memory client bound to an inbox
pub struct InMemoryBackend {
    network: InMemoryNetwork,
    inbox_id: InboxId,
    address: Address,
    closed: AtomicBool,
}

impl InMemoryBackend {
    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: BackendOp) -> ProtocolResult<()> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        self.network.before(op).await
    }
}

#[async_trait]
impl MessagingBackend for InMemoryBackend {
    fn inbox_id(&self) -> InboxId {
        self.inbox_id.clone()
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    async fn sync_conversations(&self) -> ProtocolResult<()> {
        self.enter(BackendOp::SyncConversations).await
    }

    async fn list_conversations(&self) -> ProtocolResult<Vec<ConversationInfo>> {
        self.enter(BackendOp::ListConversations).await?;
        let state = self.network.lock();
        Ok(state
            .conversations
            .iter()
            .filter(|c| c.members.contains(&self.inbox_id))
            .map(|c| c.info_for(&self.inbox_id))
            .collect())
    }

    async fn conversation(&self, id: &ConversationId) -> ProtocolResult<Option<ConversationInfo>> {
        self.enter(BackendOp::GetConversation).await?;
        let state = self.network.lock();
        Ok(state
            .conversation(id)
            .filter(|c| c.members.contains(&self.inbox_id))
            .map(|c| c.info_for(&self.inbox_id)))
    }

    async fn find_or_create_dm(&self, peer: &InboxId) -> ProtocolResult<ConversationInfo> {
        self.enter(BackendOp::FindOrCreateDm).await?;
        let mut state = self.network.lock();
        let existing = state.conversations.iter().find(|c| {
            !c.is_group && c.members.contains(&self.inbox_id) && c.members.contains(peer)
        });
        if let Some(conversation) = existing {
            return Ok(conversation.info_for(&self.inbox_id));
        }
        let conversation = StoredConversation {
            id: ConversationId::new(state.next_id("conv")),
            members: vec![self.inbox_id.clone(), peer.clone()],
            group_name: None,
            is_group: false,
            created_at_ns: state.tick(),
        };
        state.conversations.push(conversation.clone());
        state.publish_conversation(&conversation);
        Ok(conversation.info_for(&self.inbox_id))
    }

    async fn stream_conversations(&self) -> ProtocolResult<mpsc::Receiver<ConversationInfo>> {
        self.enter(BackendOp::StreamConversations).await?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        self.network
            .lock()
            .conversation_streams
            .entry(self.inbox_id.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn sync_conversation(&self, id: &ConversationId) -> ProtocolResult<()> {
        self.enter(BackendOp::SyncConversation).await?;
        self.network.lock().member_conversation(id, &self.inbox_id).map(|_| ())
    }

    async fn list_messages(&self, id: &ConversationId) -> ProtocolResult<Vec<Message>> {
        self.enter(BackendOp::ListMessages).await?;
        let state = self.network.lock();
        state.member_conversation(id, &self.inbox_id)?;
        Ok(state.messages.get(id).cloned().unwrap_or_default())
    }

    async fn latest_messages(
        &self,
        ids: &[ConversationId],
    ) -> ProtocolResult<HashMap<ConversationId, Message>> {
        self.enter(BackendOp::LatestMessages).await?;
        let state = self.network.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let last = state.messages.get(id)?.last()?.clone();
                Some((id.clone(), last))
            })
            .collect())
    }

    async fn send_text(&self, id: &ConversationId, text: &str) -> ProtocolResult<MessageId> {
        self.enter(BackendOp::SendText).await?;
        let mut state = self.network.lock();
        state.member_conversation(id, &self.inbox_id)?;
        let message = state.store_message(&self.inbox_id, id, MessageContent::Text(text.to_string()));
        Ok(message.id)
    }

    async fn stream_all_messages(&self) -> ProtocolResult<mpsc::Receiver<Message>> {
        self.enter(BackendOp::StreamMessages).await?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        self.network
            .lock()
            .message_streams
            .entry(self.inbox_id.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn consent_states(&self, inbox_ids: &[InboxId]) -> ProtocolResult<Vec<ConsentRecord>> {
        self.enter(BackendOp::ConsentStates).await?;
        let state = self.network.lock();
        let own = state.consent.get(&self.inbox_id);
        Ok(inbox_ids
            .iter()
            .map(|id| {
                own.and_then(|m| m.get(id))
                    .cloned()
                    .unwrap_or_else(|| ConsentRecord::new(id.clone(), ConsentState::Unknown, 0))
            })
            .collect())
    }

    async fn set_consent_states(
        &self,
        inbox_ids: &[InboxId],
        consent: ConsentState,
    ) -> ProtocolResult<()> {
        self.enter(BackendOp::SetConsent).await?;
        let mut state = self.network.lock();
        for inbox_id in inbox_ids {
            let record = ConsentRecord::new(inbox_id.clone(), consent, state.tick());
            state
                .consent
                .entry(self.inbox_id.clone())
                .or_default()
                .insert(inbox_id.clone(), record.clone());
            state.publish_consent(&self.inbox_id, &record);
        }
        Ok(())
    }

    async fn stream_consent(&self) -> ProtocolResult<mpsc::Receiver<ConsentRecord>> {
        self.enter(BackendOp::StreamConsent).await?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        self.network
            .lock()
            .consent_streams
            .entry(self.inbox_id.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn addresses_for_inboxes(
        &self,
        inbox_ids: &[InboxId],
    ) -> ProtocolResult<HashMap<String, Address>> {
        self.enter(BackendOp::AddressesForInboxes).await?;
        let state = self.network.lock();
        let mut found = HashMap::new();
        for requested in inbox_ids {
            let hit = state
                .registry
                .iter()
                .find(|(_, inbox)| inbox.as_str().eq_ignore_ascii_case(requested.as_str()));
            if let Some((address, inbox)) = hit {
                found.insert(inbox.0.clone(), address.clone());
            }
        }
        Ok(found)
    }

    async fn inbox_for_address(&self, address: &Address) -> ProtocolResult<Option<InboxId>> {
        self.enter(BackendOp::InboxForAddress).await?;
        Ok(self.network.lock().registry.get(address).cloned())
    }

    async fn send_read_receipt(&self, id: &ConversationId) -> ProtocolResult<()> {
        self.enter(BackendOp::ReadReceipt).await?;
        let mut state = self.network.lock();
        state.member_conversation(id, &self.inbox_id)?;
        state.read_receipts.push((self.inbox_id.clone(), id.clone()));
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.network.lock();
        state.open_handles.remove(&self.address);
        state.conversation_streams.remove(&self.inbox_id);
        state.message_streams.remove(&self.inbox_id);
        state.consent_streams.remove(&self.inbox_id);
    }
}

/// [`ClientFactory`] over an [`InMemoryNetwork`]
#[derive(Clone)]
pub struct InMemoryFactory {
    network: InMemoryNetwork,
}

impl InMemoryFactory {
    pub fn new(network: InMemoryNetwork) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }
}

fn map_signer_error(err: SignerError) -> ProtocolError {
    match err {
        SignerError::Rejected => ProtocolError::SignatureRejected,
        SignerError::Failed(msg) => ProtocolError::Other(msg),
    }
}

#[async_trait]
impl ClientFactory for InMemoryFactory {
    async fn can_restore(&self, address: &Address) -> ProtocolResult<bool> {
        Ok(self.network.lock().restorable.contains(address))
    }

    async fn restore(&self, address: &Address) -> ProtocolResult<Arc<dyn MessagingBackend>> {
        self.network.before(BackendOp::Restore).await?;
        if !self.network.lock().restorable.contains(address) {
            return Err(ProtocolError::NotFound(format!("no local identity for {}", address)));
        }
        let backend: Arc<dyn MessagingBackend> = self.network.open_handle(address)?;
        Ok(backend)
    }

    async fn create(
        &self,
        address: &Address,
        signer: &dyn Signer,
    ) -> ProtocolResult<Arc<dyn MessagingBackend>> {
        self.network.before(BackendOp::Create).await?;
        let registered_here = {
            let state = self.network.lock();
            if state.open_handles.contains(address) {
                return Err(ProtocolError::Other(format!(
                    "storage for {} is locked by another client",
                    address
                )));
            }
            let count = state.installations.get(address).map_or(0, Vec::len);
            let registered_here = state.restorable.contains(address);
            if !registered_here && count >= state.max_installations {
                return Err(ProtocolError::Other(format!(
                    "Cannot register a new installation: {}/{} installations",
                    count, state.max_installations
                )));
            }
            registered_here
        };

        signer
            .sign(&format!("otterpost sign-in for {}", address))
            .await
            .map_err(map_signer_error)?;

        self.network.register(address);
        if !registered_here {
            self.network.add_installations(address, 1);
            self.network.mark_restorable(address);
        }
        let backend: Arc<dyn MessagingBackend> = self.network.open_handle(address)?;
        Ok(backend)
    }

    async fn installations(&self, address: &Address) -> ProtocolResult<Vec<Installation>> {
        Ok(self
            .network
            .lock()
            .installations
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn revoke_installations(
        &self,
        address: &Address,
        installation_ids: &[String],
        signer: &dyn Signer,
    ) -> ProtocolResult<()> {
        self.network.before(BackendOp::RevokeInstallations).await?;
        signer
            .sign(&format!("otterpost revoke {} installation(s)", installation_ids.len()))
            .await
            .map_err(map_signer_error)?;
        let mut state = self.network.lock();
        if let Some(list) = state.installations.get_mut(address) {
            list.retain(|i| !installation_ids.contains(&i.id));
        }
        Ok(())
    }
}

/// Signer that approves (or rejects) every request
pub struct StaticSigner {
    address: Address,
    approve: bool,
}

impl StaticSigner {
    pub fn approving(address: Address) -> Self {
        Self { address, approve: true }
    }

    pub fn rejecting(address: Address) -> Self {
        Self { address, approve: false }
    }
}

#[async_trait]
impl Signer for StaticSigner {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn sign(&self, text: &str) -> Result<Vec<u8>, SignerError> {
        if self.approve {
            Ok(text.as_bytes().to_vec())
        } else {
            Err(SignerError::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::from_network(format!("0x{:040x}", n))
    }

    #[tokio::test]
    async fn test_send_fans_out_to_members() {
        let network = InMemoryNetwork::new();
        let alice = network.client(&addr(1));
        let bob = network.client(&addr(2));

        let mut bob_stream = bob.stream_all_messages().await.unwrap();
        let dm = alice.find_or_create_dm(&bob.inbox_id()).await.unwrap();
        let id = alice.send_text(&dm.id, "hi").await.unwrap();

        let received = bob_stream.recv().await.unwrap();
        assert_eq!(received.id, id);
        assert_eq!(received.content.as_text(), Some("hi"));
    }

    #[tokio::test]
    async fn test_find_or_create_dm_is_stable() {
        let network = InMemoryNetwork::new();
        let alice = network.client(&addr(1));
        let bob = network.client(&addr(2));

        let first = alice.find_or_create_dm(&bob.inbox_id()).await.unwrap();
        let second = bob.find_or_create_dm(&alice.inbox_id()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.peer_inbox_id(), Some(&bob.inbox_id()));
        assert_eq!(second.peer_inbox_id(), Some(&alice.inbox_id()));
    }

    #[tokio::test]
    async fn test_failure_injection_once() {
        let network = InMemoryNetwork::new();
        let alice = network.client(&addr(1));
        network.fail_next(BackendOp::ListConversations, ProtocolError::Network("down".into()));

        assert!(alice.list_conversations().await.is_err());
        assert!(alice.list_conversations().await.is_ok());
        assert_eq!(network.calls(BackendOp::ListConversations), 2);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls_and_releases_handle() {
        let network = InMemoryNetwork::new();
        let factory = InMemoryFactory::new(network.clone());
        let signer = StaticSigner::approving(addr(1));

        let client = factory.create(&addr(1), &signer).await.unwrap();
        assert!(network.has_open_handle(&addr(1)));
        assert!(factory.create(&addr(1), &signer).await.is_err());

        client.close();
        assert!(!network.has_open_handle(&addr(1)));
        assert_eq!(client.list_conversations().await, Err(ProtocolError::Closed));
    }

    #[tokio::test]
    async fn test_installation_limit() {
        let network = InMemoryNetwork::new();
        network.set_max_installations(2);
        network.add_installations(&addr(1), 2);
        let factory = InMemoryFactory::new(network.clone());

        let err = factory
            .create(&addr(1), &StaticSigner::approving(addr(1)))
            .await
            .err()
            .unwrap();
        assert!(err.is_resource_limit());
    }
}
