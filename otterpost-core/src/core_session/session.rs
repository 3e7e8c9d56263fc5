//! Session event loop
//!
//! One task owns every store for a signed-in client. Commands from
//! [`SessionHandle`], items from the live streams and completions of
//! spawned network calls are all serialized through this loop, so store
//! mutations never interleave and no store needs a lock.
//!
//! ```text
//!  SessionHandle ──commands──┐
//!                            ▼
//!  stream forwarders ──► Session loop ──► EventBroadcaster ──► listeners
//!                            ▲   │
//!  network tasks ──inputs────┘   └──spawn──► network tasks
//! ```
//!
//! Network calls never run on the loop itself: a handler spawns the call and
//! the call posts an [`Input`] back when done. Completions of per-parameter
//! requests carry a token from a [`RequestGate`] and are dropped when a
//! newer request superseded them.

use super::events::{EventBroadcaster, SessionEvent};
use super::handle::{FocusedContact, SessionCommand, SessionHandle};
use super::subscription::{StreamKind, Subscription, SubscriptionSet};
use super::token::RequestGate;
use crate::config::{Config, ReputationConfig, SessionConfig};
use crate::core_client::LoadPhase;
use crate::core_consent::{push_consent, ConsentTracker};
use crate::core_conversations::{load_all, preview_one, ConversationStore, LoadedConversations};
use crate::core_identity::IdentityResolver;
use crate::core_messages::{Ingest, MessageStore};
use crate::core_protocol::{MessagingBackend, ProtocolError, ProtocolResult};
use crate::core_reputation::{fetch_profiles, ReputationCache, ReputationError, ReputationSource};
use crate::core_unread::{KeyValueStore, Preferences, UnreadTracker};
use crate::errors::{SyncError, SyncResult, ValidationError};
use crate::metrics;
use crate::model::{
    now_ns, Address, ConsentAction, ConsentRecord, ConsentState, Conversation, ConversationId,
    ConversationInfo, ConversationKind, InboxId, Message, MessageId, ReputationProfile,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Everything a session needs from its owner
pub struct SessionContext {
    pub backend: Arc<dyn MessagingBackend>,
    pub reputation: Arc<dyn ReputationSource>,
    pub store: Arc<dyn KeyValueStore>,
    pub session: SessionConfig,
    pub reputation_cache: ReputationConfig,
}

impl SessionContext {
    pub fn new(
        backend: Arc<dyn MessagingBackend>,
        reputation: Arc<dyn ReputationSource>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            backend,
            reputation,
            store,
            session: SessionConfig::default(),
            reputation_cache: ReputationConfig::default(),
        }
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.session = config.session.clone();
        self.reputation_cache = config.reputation.clone();
        self
    }
}

/// A DM created remotely, before it is merged into the store
#[derive(Debug)]
struct CreatedDm {
    info: ConversationInfo,
    inbox_id: InboxId,
    address: Address,
    allowed: bool,
}

/// Work posted back to the loop by streams and spawned tasks
enum Input {
    Loaded {
        token: u64,
        result: SyncResult<LoadedConversations>,
    },
    StreamConversation(ConversationInfo),
    StreamMessage(Message),
    StreamConsent(ConsentRecord),
    StreamEnded {
        kind: StreamKind,
        generation: u64,
        error: Option<ProtocolError>,
    },
    Previewed {
        id: ConversationId,
        result: SyncResult<Option<(Conversation, Option<ConsentRecord>)>>,
    },
    HistoryLoaded {
        id: ConversationId,
        token: u64,
        result: SyncResult<Vec<Message>>,
        /// `None` for a refresh nobody waits on
        reply: Option<oneshot::Sender<SyncResult<()>>>,
    },
    SendFinished {
        conversation_id: ConversationId,
        local_id: MessageId,
        result: SyncResult<MessageId>,
    },
    DmCreated {
        result: SyncResult<CreatedDm>,
        reply: oneshot::Sender<SyncResult<ConversationId>>,
    },
    ConsentPushed {
        inbox_ids: Vec<InboxId>,
        result: SyncResult<ConsentState>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    FocusAddress {
        token: u64,
        address: Option<Address>,
    },
    FocusConsent {
        token: u64,
        result: SyncResult<Vec<ConsentRecord>>,
    },
    ReputationFetched {
        requested: Vec<Address>,
        result: Result<HashMap<Address, ReputationProfile>, ReputationError>,
    },
}

async fn forward<T>(
    opened: ProtocolResult<mpsc::Receiver<T>>,
    input_tx: &mpsc::Sender<Input>,
    wrap: fn(T) -> Input,
) -> ProtocolResult<()> {
    let mut rx = opened?;
    while let Some(item) = rx.recv().await {
        if input_tx.send(wrap(item)).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn fetch_history(
    backend: &dyn MessagingBackend,
    id: &ConversationId,
) -> SyncResult<Vec<Message>> {
    backend.sync_conversation(id).await?;
    Ok(backend.list_messages(id).await?)
}

async fn backfill_conversation(
    backend: &dyn MessagingBackend,
    resolver: &IdentityResolver,
    id: &ConversationId,
) -> SyncResult<Option<(Conversation, Option<ConsentRecord>)>> {
    match backend.conversation(id).await? {
        Some(info) => preview_one(backend, resolver, info).await.map(Some),
        None => Ok(None),
    }
}

async fn create_dm_remote(
    backend: &dyn MessagingBackend,
    self_inbox_id: &InboxId,
    address: Address,
) -> SyncResult<CreatedDm> {
    let inbox_id = backend
        .inbox_for_address(&address)
        .await?
        .ok_or_else(|| ValidationError::Unreachable(address.to_string()))?;
    if &inbox_id == self_inbox_id {
        return Err(ValidationError::SelfMessaging.into());
    }

    let mut info = backend.find_or_create_dm(&inbox_id).await?;
    if let ConversationKind::Dm { peer_address, .. } = &mut info.kind {
        *peer_address = Some(address.clone());
    }

    // the DM exists either way; a failed allow leaves it in Unknown
    let allowed = match push_consent(backend, std::slice::from_ref(&inbox_id), ConsentAction::Allow).await {
        Ok(_) => true,
        Err(e) => {
            warn!(inbox_id = %inbox_id, error = %e, "Auto-allow for new DM failed");
            false
        }
    };
    Ok(CreatedDm { info, inbox_id, address, allowed })
}

pub struct Session {
    backend: Arc<dyn MessagingBackend>,
    resolver: IdentityResolver,
    reputation_source: Arc<dyn ReputationSource>,
    preferences: Preferences,
    group_gap: Duration,
    sweep_interval: Duration,
    address: Address,
    self_inbox_id: InboxId,

    conversations: ConversationStore,
    consent: ConsentTracker,
    unread: UnreadTracker,
    reputation: ReputationCache,
    open: Option<MessageStore>,
    phase: LoadPhase,
    focus: Option<FocusedContact>,

    load_gate: RequestGate,
    open_gate: RequestGate,
    focus_gate: RequestGate,
    pending_reloads: Vec<oneshot::Sender<SyncResult<()>>>,
    backfilling: HashSet<ConversationId>,

    subscriptions: SubscriptionSet,
    stream_generation: u64,
    tasks: JoinSet<()>,
    events: EventBroadcaster,
    input_tx: mpsc::Sender<Input>,
}

impl Session {
    /// Spawn the loop for a ready client
    ///
    /// Streams are subscribed and the initial load starts immediately.
    pub fn spawn(context: SessionContext) -> (SessionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(context.session.command_buffer.max(1));
        let (input_tx, input_rx) = mpsc::channel(context.session.event_buffer.max(1));
        let events = EventBroadcaster::new(context.session.event_buffer);

        let session = Session::new(context, events.clone(), input_tx);
        let task = tokio::spawn(session.run(command_rx, input_rx));
        (SessionHandle::new(command_tx, events), task)
    }

    fn new(context: SessionContext, events: EventBroadcaster, input_tx: mpsc::Sender<Input>) -> Self {
        let backend = context.backend;
        let address = backend.address();
        let self_inbox_id = backend.inbox_id();
        Self {
            resolver: IdentityResolver::new(backend.clone()),
            reputation_source: context.reputation,
            preferences: Preferences::new(context.store.clone()),
            group_gap: context.session.group_gap,
            sweep_interval: context.reputation_cache.sweep_interval,
            unread: UnreadTracker::new(address.clone(), self_inbox_id.clone(), context.store),
            reputation: ReputationCache::new(
                context.reputation_cache.ttl,
                context.reputation_cache.sweep_interval,
            ),
            address,
            self_inbox_id,
            backend,
            conversations: ConversationStore::new(),
            consent: ConsentTracker::new(),
            open: None,
            phase: LoadPhase::Idle,
            focus: None,
            load_gate: RequestGate::new(),
            open_gate: RequestGate::new(),
            focus_gate: RequestGate::new(),
            pending_reloads: Vec::new(),
            backfilling: HashSet::new(),
            subscriptions: SubscriptionSet::new(),
            stream_generation: 0,
            tasks: JoinSet::new(),
            events,
            input_tx,
        }
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        mut input_rx: mpsc::Receiver<Input>,
    ) {
        info!(address = %self.address, inbox_id = %self.self_inbox_id.short(), "Session started");
        self.start_streams();
        self.start_load();

        let mut sweep = tokio::time::interval(self.sweep_interval.max(Duration::from_secs(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(SessionCommand::Shutdown { reply }) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All session handles dropped");
                        self.teardown();
                        break;
                    }
                },

                Some(input) = input_rx.recv() => self.handle_input(input),

                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}

                _ = sweep.tick() => {
                    self.reputation.maybe_sweep(Instant::now());
                }
            }
        }
    }

    fn spawn_task<F>(&mut self, task: F)
    where
        F: Future<Output = Input> + Send + 'static,
    {
        let input_tx = self.input_tx.clone();
        self.tasks.spawn(async move {
            let input = task.await;
            // loop gone means the session is shutting down
            let _ = input_tx.send(input).await;
        });
    }

    fn set_phase(&mut self, phase: LoadPhase) {
        if self.phase != phase {
            self.phase = phase.clone();
            self.events.emit(SessionEvent::PhaseChanged(phase));
        }
    }

    // ---- streams ----

    fn start_streams(&mut self) {
        for kind in StreamKind::ALL {
            self.start_stream(kind);
        }
    }

    fn start_stream(&mut self, kind: StreamKind) {
        self.stream_generation += 1;
        let generation = self.stream_generation;
        let backend = self.backend.clone();
        let input_tx = self.input_tx.clone();

        let task = tokio::spawn(async move {
            let result = match kind {
                StreamKind::Conversations => {
                    forward(backend.stream_conversations().await, &input_tx, Input::StreamConversation)
                        .await
                }
                StreamKind::Messages => {
                    forward(backend.stream_all_messages().await, &input_tx, Input::StreamMessage).await
                }
                StreamKind::Consent => {
                    forward(backend.stream_consent().await, &input_tx, Input::StreamConsent).await
                }
            };
            let _ = input_tx
                .send(Input::StreamEnded { kind, generation, error: result.err() })
                .await;
        });

        debug!(stream = %kind, generation, "Subscribed");
        self.subscriptions.replace(Subscription::new(kind, generation, task));
    }

    fn on_stream_ended(&mut self, kind: StreamKind, generation: u64, error: Option<ProtocolError>) {
        if !self.subscriptions.is_current(kind, generation) {
            return;
        }
        self.subscriptions.remove(kind);
        metrics::increment(metrics::STREAM_CLOSED);
        match error {
            Some(e) => warn!(stream = %kind, error = %e, "Live stream failed"),
            None => warn!(stream = %kind, "Live stream ended"),
        }
        self.events.emit(SessionEvent::StreamClosed(kind));
    }

    fn on_stream_conversation(&mut self, info: ConversationInfo) {
        metrics::increment(metrics::STREAM_EVENTS);
        if !self.backfilling.insert(info.id.clone()) {
            return;
        }
        let backend = self.backend.clone();
        let resolver = self.resolver.clone();
        self.spawn_task(async move {
            let id = info.id.clone();
            let result = preview_one(backend.as_ref(), &resolver, info).await.map(Some);
            Input::Previewed { id, result }
        });
    }

    fn backfill(&mut self, id: ConversationId) {
        if !self.backfilling.insert(id.clone()) {
            return;
        }
        debug!(conversation_id = %id, "Backfilling unknown conversation");
        let backend = self.backend.clone();
        let resolver = self.resolver.clone();
        self.spawn_task(async move {
            let result = backfill_conversation(backend.as_ref(), &resolver, &id).await;
            Input::Previewed { id, result }
        });
    }

    fn on_stream_message(&mut self, message: Message) {
        metrics::increment(metrics::STREAM_EVENTS);
        let id = message.conversation_id.clone();
        if !self.conversations.contains(&id) {
            self.backfill(id.clone());
        }
        if self.conversations.apply_message(&message) {
            self.events.emit(SessionEvent::ConversationsChanged);
        }

        if let Some(open) = self.open.as_mut().filter(|o| o.conversation_id() == &id) {
            match open.ingest(message.clone()) {
                Ingest::Duplicate => metrics::increment(metrics::STREAM_DUPLICATES),
                Ingest::Reconciled(local_id) => {
                    metrics::increment(metrics::PENDING_RECONCILED);
                    debug!(local_id = %local_id, message_id = %message.id, "Pending send reconciled");
                    self.events.emit(SessionEvent::TimelineChanged(id.clone()));
                }
                Ingest::Inserted => {
                    self.events.emit(SessionEvent::TimelineChanged(id.clone()));
                }
                Ingest::WrongConversation => {}
            }
        }

        if self.unread.record_inbound(&message) {
            self.publish_unread(&id);
        }
    }

    fn apply_consent_record(&mut self, record: ConsentRecord) -> bool {
        let inbox_id = record.inbox_id.clone();
        let state = record.state;
        if !self.consent.apply_remote(record) {
            return false;
        }
        self.conversations.set_consent_for_peer(&inbox_id, state);
        if let Some(focus) = self.focus.as_mut().filter(|f| f.inbox_id == inbox_id) {
            focus.consent = state;
            self.events.emit(SessionEvent::FocusedContactChanged(inbox_id.clone()));
        }
        self.events.emit(SessionEvent::ConsentChanged(vec![inbox_id]));
        self.events.emit(SessionEvent::ConversationsChanged);
        true
    }

    fn publish_unread(&mut self, id: &ConversationId) {
        let count = self.unread.count(id);
        self.conversations.set_unread(id, count);
        self.events.emit(SessionEvent::UnreadChanged { conversation_id: id.clone(), count });
    }

    // ---- load ----

    fn start_load(&mut self) {
        self.set_phase(LoadPhase::Loading);
        self.spawn_load();
    }

    fn spawn_load(&mut self) {
        let token = self.load_gate.issue();
        let backend = self.backend.clone();
        let resolver = self.resolver.clone();
        self.spawn_task(async move {
            let result = load_all(backend.as_ref(), &resolver).await;
            Input::Loaded { token, result }
        });
    }

    fn on_loaded(&mut self, token: u64, result: SyncResult<LoadedConversations>) {
        if !self.load_gate.is_current(token) {
            debug!(token, "Dropping superseded load");
            return;
        }

        let outcome = match result {
            Ok(loaded) => {
                self.apply_loaded(loaded);
                self.set_phase(LoadPhase::Loaded);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Conversation load failed");
                self.set_phase(LoadPhase::Error(e.to_string()));
                Err(e)
            }
        };
        for reply in self.pending_reloads.drain(..) {
            let _ = reply.send(outcome.clone());
        }
    }

    fn apply_loaded(&mut self, loaded: LoadedConversations) {
        let changed = self.consent.apply_remote_batch(loaded.consent);

        let mut conversations = loaded.conversations;
        for conversation in &mut conversations {
            if let Some(peer) = conversation.peer_inbox_id().cloned() {
                conversation.set_consent_state(self.consent.state(&peer));
            }
            if let Some(latest) = &conversation.last_message {
                self.unread.seed_latest(&conversation.id, latest);
            }
        }
        self.conversations.apply_loaded(conversations);
        for id in self.conversations.ids() {
            let count = self.unread.count(&id);
            self.conversations.set_unread(&id, count);
        }

        metrics::set_gauge(metrics::CONVERSATIONS_LOADED, self.conversations.len() as f64);
        if !changed.is_empty() {
            self.events.emit(SessionEvent::ConsentChanged(changed));
        }
        self.events.emit(SessionEvent::ConversationsChanged);

        let addresses = self.conversations.peer_addresses();
        self.request_reputation(addresses);
    }

    fn on_previewed(
        &mut self,
        id: ConversationId,
        result: SyncResult<Option<(Conversation, Option<ConsentRecord>)>>,
    ) {
        self.backfilling.remove(&id);
        let (mut conversation, record) = match result {
            Ok(Some(previewed)) => previewed,
            Ok(None) => {
                debug!(conversation_id = %id, "Conversation not found during backfill");
                return;
            }
            Err(e) => {
                warn!(conversation_id = %id, error = %e, "Conversation preview failed");
                return;
            }
        };

        if let Some(record) = record {
            self.apply_consent_record(record);
        }
        if let Some(peer) = conversation.peer_inbox_id().cloned() {
            conversation.set_consent_state(self.consent.state(&peer));
        }
        if let Some(latest) = &conversation.last_message {
            self.unread.seed_latest(&id, latest);
        }
        let address = conversation.peer_address().cloned();

        self.conversations.upsert(conversation);
        let count = self.unread.count(&id);
        self.conversations.set_unread(&id, count);
        metrics::set_gauge(metrics::CONVERSATIONS_LOADED, self.conversations.len() as f64);
        self.events.emit(SessionEvent::ConversationsChanged);

        if let Some(address) = address {
            self.request_reputation(vec![address]);
        }
    }

    // ---- open conversation ----

    fn open_conversation(&mut self, id: ConversationId, reply: oneshot::Sender<SyncResult<()>>) {
        if !self.conversations.contains(&id) {
            let _ = reply.send(Err(SyncError::ConversationNotFound(id)));
            return;
        }
        let reuse = self.open.as_ref().is_some_and(|o| o.conversation_id() == &id);
        if !reuse {
            self.open = Some(MessageStore::new(id.clone(), self.self_inbox_id.clone()));
        }

        self.spawn_history(id, Some(reply));
    }

    fn spawn_history(&mut self, id: ConversationId, reply: Option<oneshot::Sender<SyncResult<()>>>) {
        let token = self.open_gate.issue();
        let backend = self.backend.clone();
        self.spawn_task(async move {
            let result = fetch_history(backend.as_ref(), &id).await;
            Input::HistoryLoaded { id, token, result, reply }
        });
    }

    /// Re-read what the streams may have missed while they were down
    ///
    /// The reload keeps the current phase so routing stays put; merges never
    /// move a preview backwards.
    fn catch_up(&mut self) {
        debug!("Catching up after stream restart");
        self.spawn_load();
        if let Some(id) = self.open.as_ref().map(|o| o.conversation_id().clone()) {
            self.spawn_history(id, None);
        }
    }

    fn on_history_loaded(
        &mut self,
        id: ConversationId,
        token: u64,
        result: SyncResult<Vec<Message>>,
        reply: Option<oneshot::Sender<SyncResult<()>>>,
    ) {
        let answer = |result: SyncResult<()>| {
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        };
        let current = self.open_gate.is_current(token);
        let Some(open) = self.open.as_mut().filter(|o| current && o.conversation_id() == &id) else {
            debug!(conversation_id = %id, "Dropping superseded history");
            answer(Ok(()));
            return;
        };

        match result {
            Ok(messages) => {
                let recounted = self.unread.recount(&id, &messages);
                let added = open.load(messages);
                let latest = open.latest().cloned();
                debug!(conversation_id = %id, added, "History merged");
                if let Some(latest) = latest {
                    if self.conversations.apply_message(&latest) {
                        self.events.emit(SessionEvent::ConversationsChanged);
                    }
                }
                if recounted {
                    self.publish_unread(&id);
                }
                self.events.emit(SessionEvent::TimelineChanged(id));
                answer(Ok(()));
            }
            Err(e) => {
                warn!(conversation_id = %id, error = %e, "History load failed");
                answer(Err(e));
            }
        }
    }

    fn close_conversation(&mut self) {
        self.open_gate.invalidate();
        if let Some(open) = self.open.take() {
            debug!(conversation_id = %open.conversation_id(), "Conversation closed");
        }
    }

    // ---- sending ----

    fn spawn_send(&mut self, conversation_id: ConversationId, local_id: MessageId, text: String) {
        let backend = self.backend.clone();
        self.spawn_task(async move {
            let result = backend
                .send_text(&conversation_id, &text)
                .await
                .map_err(SyncError::from);
            Input::SendFinished { conversation_id, local_id, result }
        });
    }

    fn send_message(&mut self, text: String) -> SyncResult<MessageId> {
        let open = self.open.as_mut().ok_or(SyncError::NoOpenConversation)?;
        let pending = open.begin_send(&text, now_ns())?;
        let conversation_id = pending.conversation_id.clone();
        self.events.emit(SessionEvent::TimelineChanged(conversation_id.clone()));
        self.spawn_send(conversation_id, pending.local_id.clone(), pending.text);
        Ok(pending.local_id)
    }

    fn retry_send(&mut self, local_id: MessageId) -> SyncResult<()> {
        let open = self.open.as_mut().ok_or(SyncError::NoOpenConversation)?;
        let pending = open.retry(&local_id)?;
        self.events.emit(SessionEvent::TimelineChanged(pending.conversation_id.clone()));
        self.spawn_send(pending.conversation_id, pending.local_id, pending.text);
        Ok(())
    }

    fn discard_failed(&mut self, local_id: MessageId) -> SyncResult<()> {
        let open = self.open.as_mut().ok_or(SyncError::NoOpenConversation)?;
        open.discard(&local_id)?;
        self.events.emit(SessionEvent::TimelineChanged(open.conversation_id().clone()));
        Ok(())
    }

    fn on_send_finished(
        &mut self,
        conversation_id: ConversationId,
        local_id: MessageId,
        result: SyncResult<MessageId>,
    ) {
        let Some(open) = self.open.as_mut().filter(|o| o.conversation_id() == &conversation_id) else {
            debug!(conversation_id = %conversation_id, local_id = %local_id, "Send finished after conversation closed");
            return;
        };
        match result {
            Ok(remote_id) => open.send_succeeded(&local_id, remote_id),
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Send failed");
                metrics::increment(metrics::SEND_FAILURES);
                open.send_failed(&local_id);
                self.events.emit(SessionEvent::SendFailed {
                    conversation_id: conversation_id.clone(),
                    local_id,
                });
            }
        }
        self.events.emit(SessionEvent::TimelineChanged(conversation_id));
    }

    // ---- new DM ----

    fn create_dm(&mut self, raw: String, reply: oneshot::Sender<SyncResult<ConversationId>>) {
        let address = match Address::parse(&raw) {
            Ok(address) => address,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        if address == self.address {
            let _ = reply.send(Err(ValidationError::SelfMessaging.into()));
            return;
        }
        if let Some(existing) = self.conversations.find_dm_with_address(&address) {
            let _ = reply.send(Err(ValidationError::DuplicateConversation(existing.id.clone()).into()));
            return;
        }

        let backend = self.backend.clone();
        let self_inbox_id = self.self_inbox_id.clone();
        self.spawn_task(async move {
            let result = create_dm_remote(backend.as_ref(), &self_inbox_id, address).await;
            Input::DmCreated { result, reply }
        });
    }

    fn on_dm_created(
        &mut self,
        result: SyncResult<CreatedDm>,
        reply: oneshot::Sender<SyncResult<ConversationId>>,
    ) {
        let created = match result {
            Ok(created) => created,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let id = created.info.id.clone();

        if created.allowed {
            let changed = self.consent.commit(
                std::slice::from_ref(&created.inbox_id),
                ConsentState::Allowed,
                now_ns(),
            );
            self.conversations.set_consent_for_peer(&created.inbox_id, ConsentState::Allowed);
            if !changed.is_empty() {
                self.events.emit(SessionEvent::ConsentChanged(changed));
            }
        }

        let state = self.consent.state(&created.inbox_id);
        self.conversations.upsert(Conversation::new(created.info, state, None));
        let count = self.unread.count(&id);
        self.conversations.set_unread(&id, count);
        info!(conversation_id = %id, peer = %created.address, "DM ready");
        self.events.emit(SessionEvent::ConversationsChanged);

        self.request_reputation(vec![created.address]);
        let _ = reply.send(Ok(id));
    }

    // ---- consent ----

    fn set_consent(
        &mut self,
        inbox_ids: Vec<InboxId>,
        action: ConsentAction,
        reply: oneshot::Sender<SyncResult<()>>,
    ) {
        if inbox_ids.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }
        let backend = self.backend.clone();
        self.spawn_task(async move {
            let result = push_consent(backend.as_ref(), &inbox_ids, action).await;
            Input::ConsentPushed { inbox_ids, result, reply }
        });
    }

    fn on_consent_pushed(
        &mut self,
        inbox_ids: Vec<InboxId>,
        result: SyncResult<ConsentState>,
        reply: oneshot::Sender<SyncResult<()>>,
    ) {
        let state = match result {
            Ok(state) => state,
            Err(e) => {
                warn!(count = inbox_ids.len(), error = %e, "Consent update failed; nothing changed");
                let _ = reply.send(Err(e));
                return;
            }
        };

        let changed = self.consent.commit(&inbox_ids, state, now_ns());
        for inbox_id in &inbox_ids {
            self.conversations.set_consent_for_peer(inbox_id, state);
        }
        if let Some(focus) = self.focus.as_mut().filter(|f| inbox_ids.contains(&f.inbox_id)) {
            focus.consent = state;
            self.events.emit(SessionEvent::FocusedContactChanged(focus.inbox_id.clone()));
        }
        self.events.emit(SessionEvent::ConsentChanged(changed));
        self.events.emit(SessionEvent::ConversationsChanged);
        let _ = reply.send(Ok(()));
    }

    // ---- read state ----

    fn mark_as_read(&mut self, id: ConversationId) -> SyncResult<()> {
        if !self.conversations.contains(&id) {
            return Err(SyncError::ConversationNotFound(id));
        }
        self.unread.mark_as_read(&id, now_ns());
        self.publish_unread(&id);
        self.events.emit(SessionEvent::ConversationsChanged);

        // preference is read now, not when the session started
        match self.preferences.disable_read_receipts() {
            Ok(true) => debug!(conversation_id = %id, "Read receipts disabled"),
            Ok(false) => {
                let backend = self.backend.clone();
                self.tasks.spawn(async move {
                    if let Err(e) = backend.send_read_receipt(&id).await {
                        metrics::increment(metrics::READ_RECEIPTS_FAILED);
                        warn!(conversation_id = %id, error = %e, "Read receipt failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "Receipt preference unreadable; skipping receipt"),
        }
        Ok(())
    }

    // ---- reputation ----

    fn request_reputation(&mut self, addresses: Vec<Address>) {
        let needed = self.reputation.plan_fetch(&addresses, Instant::now());
        if needed.is_empty() {
            return;
        }
        let source = self.reputation_source.clone();
        self.spawn_task(async move {
            let result = fetch_profiles(source.as_ref(), &needed).await;
            Input::ReputationFetched { requested: needed, result }
        });
    }

    fn on_reputation_fetched(
        &mut self,
        requested: Vec<Address>,
        result: Result<HashMap<Address, ReputationProfile>, ReputationError>,
    ) {
        let now = Instant::now();
        match result {
            Ok(found) => self.reputation.complete(&requested, found, now),
            Err(e) => {
                warn!(count = requested.len(), error = %e, "Reputation fetch failed");
                self.reputation.fail(&requested);
            }
        }

        // results are keyed by address, so a panel that moved on ignores them
        if let Some(focus) = self.focus.as_mut() {
            if let Some(address) = focus.address.as_ref().filter(|a| requested.contains(a)) {
                focus.reputation = self.reputation.profile(address, now).cloned();
                focus.loading = false;
                self.events.emit(SessionEvent::FocusedContactChanged(focus.inbox_id.clone()));
            }
        }
        self.events.emit(SessionEvent::ReputationUpdated(requested));
    }

    fn reputation_lookup(&mut self, address: Address) -> Option<ReputationProfile> {
        if let Some(cached) = self.reputation.lookup(&address, Instant::now()) {
            return cached.cloned();
        }
        self.request_reputation(vec![address]);
        None
    }

    // ---- focused contact ----

    fn focus_contact(&mut self, inbox_id: InboxId) {
        let token = self.focus_gate.issue();
        let known_address = self
            .conversations
            .find_dm_with(&inbox_id)
            .and_then(|c| c.peer_address().cloned());
        self.focus = Some(FocusedContact {
            inbox_id: inbox_id.clone(),
            address: known_address.clone(),
            consent: self.consent.state(&inbox_id),
            reputation: None,
            loading: true,
        });

        let backend = self.backend.clone();
        let inbox = inbox_id.clone();
        self.spawn_task(async move {
            let result = backend
                .consent_states(std::slice::from_ref(&inbox))
                .await
                .map_err(SyncError::from);
            Input::FocusConsent { token, result }
        });

        match known_address {
            Some(address) => self.focus_reputation(address),
            None => {
                let resolver = self.resolver.clone();
                let inbox = inbox_id.clone();
                self.spawn_task(async move {
                    let address = resolver.resolve(&inbox).await;
                    Input::FocusAddress { token, address }
                });
            }
        }
        self.events.emit(SessionEvent::FocusedContactChanged(inbox_id));
    }

    fn focus_reputation(&mut self, address: Address) {
        let cached = self
            .reputation
            .lookup(&address, Instant::now())
            .map(|profile| profile.cloned());
        match cached {
            Some(profile) => {
                if let Some(focus) = self.focus.as_mut() {
                    focus.reputation = profile;
                    focus.loading = false;
                }
            }
            // an in-flight fetch for the same address also lands on the panel
            None => self.request_reputation(vec![address]),
        }
    }

    fn on_focus_address(&mut self, token: u64, address: Option<Address>) {
        if !self.focus_gate.is_current(token) {
            debug!(token, "Dropping stale focus resolution");
            return;
        }
        let Some(focus) = self.focus.as_mut() else {
            return;
        };
        focus.address = address.clone();
        let inbox_id = focus.inbox_id.clone();
        match address {
            Some(address) => {
                self.conversations.set_peer_address(&inbox_id, &address);
                self.focus_reputation(address);
            }
            None => focus.loading = false,
        }
        self.events.emit(SessionEvent::FocusedContactChanged(inbox_id));
    }

    fn on_focus_consent(&mut self, token: u64, result: SyncResult<Vec<ConsentRecord>>) {
        let records = match result {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Focused contact consent fetch failed");
                return;
            }
        };
        for record in records {
            self.apply_consent_record(record);
        }
        if !self.focus_gate.is_current(token) {
            return;
        }
        if let Some(focus) = self.focus.as_mut() {
            let state = self.consent.state(&focus.inbox_id);
            if focus.consent != state {
                focus.consent = state;
                self.events.emit(SessionEvent::FocusedContactChanged(focus.inbox_id.clone()));
            }
        }
    }

    fn clear_focus(&mut self) {
        self.focus_gate.invalidate();
        self.focus = None;
    }

    // ---- dispatch ----

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Conversations { filter, reply } => {
                let _ = reply.send(self.conversations.view(filter));
            }
            SessionCommand::TotalUnread { reply } => {
                let allowed: Vec<ConversationId> = self
                    .conversations
                    .view(ConsentState::Allowed)
                    .into_iter()
                    .map(|c| c.id)
                    .collect();
                let _ = reply.send(self.unread.total(allowed.iter()));
            }
            SessionCommand::Phase { reply } => {
                let _ = reply.send(self.phase.clone());
            }
            SessionCommand::Timeline { reply } => {
                let timeline = self
                    .open
                    .as_ref()
                    .map(|o| o.timeline().to_vec())
                    .ok_or(SyncError::NoOpenConversation);
                let _ = reply.send(timeline);
            }
            SessionCommand::Groups { reply } => {
                let groups = self
                    .open
                    .as_ref()
                    .map(|o| o.groups(self.group_gap))
                    .ok_or(SyncError::NoOpenConversation);
                let _ = reply.send(groups);
            }
            SessionCommand::Consent { inbox_id, reply } => {
                let _ = reply.send(self.consent.state(&inbox_id));
            }
            SessionCommand::Reputation { address, reply } => {
                let _ = reply.send(self.reputation_lookup(address));
            }
            SessionCommand::FocusedContact { reply } => {
                let _ = reply.send(self.focus.clone());
            }
            SessionCommand::Reload { reply } => {
                self.pending_reloads.push(reply);
                self.start_load();
            }
            SessionCommand::OpenConversation { id, reply } => self.open_conversation(id, reply),
            SessionCommand::CloseConversation { reply } => {
                self.close_conversation();
                let _ = reply.send(());
            }
            SessionCommand::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(text));
            }
            SessionCommand::RetrySend { local_id, reply } => {
                let _ = reply.send(self.retry_send(local_id));
            }
            SessionCommand::DiscardFailed { local_id, reply } => {
                let _ = reply.send(self.discard_failed(local_id));
            }
            SessionCommand::CreateDm { address, reply } => self.create_dm(address, reply),
            SessionCommand::SetConsent { inbox_ids, action, reply } => {
                self.set_consent(inbox_ids, action, reply)
            }
            SessionCommand::MarkAsRead { id, reply } => {
                let _ = reply.send(self.mark_as_read(id));
            }
            SessionCommand::SetReadReceiptsDisabled { disabled, reply } => {
                let result = self
                    .preferences
                    .set_disable_read_receipts(disabled)
                    .map_err(SyncError::from);
                let _ = reply.send(result);
            }
            SessionCommand::FocusContact { inbox_id, reply } => {
                self.focus_contact(inbox_id);
                let _ = reply.send(());
            }
            SessionCommand::ClearFocus { reply } => {
                self.clear_focus();
                let _ = reply.send(());
            }
            SessionCommand::RestartStreams { reply } => {
                info!("Restarting live streams");
                self.subscriptions.stop_all();
                self.start_streams();
                self.catch_up();
                let _ = reply.send(());
            }
            SessionCommand::Shutdown { reply } => {
                // handled by the loop; kept exhaustive
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Loaded { token, result } => self.on_loaded(token, result),
            Input::StreamConversation(info) => self.on_stream_conversation(info),
            Input::StreamMessage(message) => self.on_stream_message(message),
            Input::StreamConsent(record) => {
                metrics::increment(metrics::STREAM_EVENTS);
                self.apply_consent_record(record);
            }
            Input::StreamEnded { kind, generation, error } => {
                self.on_stream_ended(kind, generation, error)
            }
            Input::Previewed { id, result } => self.on_previewed(id, result),
            Input::HistoryLoaded { id, token, result, reply } => {
                self.on_history_loaded(id, token, result, reply)
            }
            Input::SendFinished { conversation_id, local_id, result } => {
                self.on_send_finished(conversation_id, local_id, result)
            }
            Input::DmCreated { result, reply } => self.on_dm_created(result, reply),
            Input::ConsentPushed { inbox_ids, result, reply } => {
                self.on_consent_pushed(inbox_ids, result, reply)
            }
            Input::FocusAddress { token, address } => self.on_focus_address(token, address),
            Input::FocusConsent { token, result } => self.on_focus_consent(token, result),
            Input::ReputationFetched { requested, result } => {
                self.on_reputation_fetched(requested, result)
            }
        }
    }

    /// Stop streams and background work and forget cached remote state
    fn teardown(&mut self) {
        self.subscriptions.stop_all();
        self.tasks.abort_all();
        self.load_gate.invalidate();
        self.consent.clear();
        self.reputation.clear();
        self.unread.clear();
        self.open = None;
        self.focus = None;
        for reply in self.pending_reloads.drain(..) {
            let _ = reply.send(Err(SyncError::SessionClosed));
        }
        self.events.emit(SessionEvent::Closed);
        info!(address = %self.address, "Session stopped");
    }
}
