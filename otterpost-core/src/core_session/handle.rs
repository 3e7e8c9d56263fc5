//! SessionHandle
//!
//! Cloneable front door to the session loop. Every method packages a
//! [`SessionCommand`] with a oneshot reply channel, pushes it onto the
//! loop's command queue and awaits the answer. Snapshot queries return owned
//! copies; nothing outside the loop ever borrows store state.
//!
//! Network-bound commands (reload, open, create DM, consent changes) reply
//! once their completion has been applied by the loop, so a caller that
//! awaits `create_dm` sees the new conversation in the next
//! `conversations` snapshot.

use super::events::{EventBroadcaster, SessionEvent};
use crate::core_client::LoadPhase;
use crate::core_messages::{MessageGroup, TimelineItem};
use crate::errors::{SyncError, SyncResult};
use crate::model::{
    Address, ConsentAction, ConsentState, Conversation, ConversationId, InboxId, MessageId,
    ReputationProfile,
};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Contact detail panel state for the focused inbox
#[derive(Debug, Clone, PartialEq)]
pub struct FocusedContact {
    pub inbox_id: InboxId,
    /// `None` while resolving or if the inbox has no known address
    pub address: Option<Address>,
    pub consent: ConsentState,
    pub reputation: Option<ReputationProfile>,
    /// A resolution or reputation fetch is still outstanding
    pub loading: bool,
}

type Reply<T> = oneshot::Sender<T>;

/// Commands processed by the session loop
#[derive(Debug)]
pub enum SessionCommand {
    Conversations { filter: ConsentState, reply: Reply<Vec<Conversation>> },
    TotalUnread { reply: Reply<u32> },
    Phase { reply: Reply<LoadPhase> },
    Timeline { reply: Reply<SyncResult<Vec<TimelineItem>>> },
    Groups { reply: Reply<SyncResult<Vec<MessageGroup>>> },
    Consent { inbox_id: InboxId, reply: Reply<ConsentState> },
    Reputation { address: Address, reply: Reply<Option<ReputationProfile>> },
    FocusedContact { reply: Reply<Option<FocusedContact>> },

    Reload { reply: Reply<SyncResult<()>> },
    OpenConversation { id: ConversationId, reply: Reply<SyncResult<()>> },
    CloseConversation { reply: Reply<()> },
    SendMessage { text: String, reply: Reply<SyncResult<MessageId>> },
    RetrySend { local_id: MessageId, reply: Reply<SyncResult<()>> },
    DiscardFailed { local_id: MessageId, reply: Reply<SyncResult<()>> },
    CreateDm { address: String, reply: Reply<SyncResult<ConversationId>> },
    SetConsent { inbox_ids: Vec<InboxId>, action: ConsentAction, reply: Reply<SyncResult<()>> },
    MarkAsRead { id: ConversationId, reply: Reply<SyncResult<()>> },
    SetReadReceiptsDisabled { disabled: bool, reply: Reply<SyncResult<()>> },
    FocusContact { inbox_id: InboxId, reply: Reply<()> },
    ClearFocus { reply: Reply<()> },
    RestartStreams { reply: Reply<()> },
    Shutdown { reply: Reply<()> },
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    events: EventBroadcaster,
}

impl SessionHandle {
    pub(super) fn new(command_tx: mpsc::Sender<SessionCommand>, events: EventBroadcaster) -> Self {
        Self { command_tx, events }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> SessionCommand) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        response.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Change notifications; re-read views through the handle on receipt
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether the loop is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Conversations in one consent view, most recent activity first
    pub async fn conversations(&self, filter: ConsentState) -> SyncResult<Vec<Conversation>> {
        self.request(|reply| SessionCommand::Conversations { filter, reply }).await
    }

    /// Unread messages across Allowed conversations
    pub async fn total_unread(&self) -> SyncResult<u32> {
        self.request(|reply| SessionCommand::TotalUnread { reply }).await
    }

    pub async fn load_phase(&self) -> SyncResult<LoadPhase> {
        self.request(|reply| SessionCommand::Phase { reply }).await
    }

    /// Merged timeline of the open conversation
    pub async fn timeline(&self) -> SyncResult<Vec<TimelineItem>> {
        self.request(|reply| SessionCommand::Timeline { reply }).await?
    }

    pub async fn groups(&self) -> SyncResult<Vec<MessageGroup>> {
        self.request(|reply| SessionCommand::Groups { reply }).await?
    }

    pub async fn consent_state(&self, inbox_id: InboxId) -> SyncResult<ConsentState> {
        self.request(|reply| SessionCommand::Consent { inbox_id, reply }).await
    }

    /// Cached profile; a miss schedules a fetch and reports `None` for now
    pub async fn reputation(&self, address: Address) -> SyncResult<Option<ReputationProfile>> {
        self.request(|reply| SessionCommand::Reputation { address, reply }).await
    }

    pub async fn focused_contact(&self) -> SyncResult<Option<FocusedContact>> {
        self.request(|reply| SessionCommand::FocusedContact { reply }).await
    }

    /// Re-run the full conversation load
    pub async fn reload(&self) -> SyncResult<()> {
        self.request(|reply| SessionCommand::Reload { reply }).await?
    }

    /// Open a conversation and load its history
    ///
    /// Resolves once history is merged, or once a later open supersedes
    /// this one.
    pub async fn open_conversation(&self, id: ConversationId) -> SyncResult<()> {
        self.request(|reply| SessionCommand::OpenConversation { id, reply }).await?
    }

    pub async fn close_conversation(&self) -> SyncResult<()> {
        self.request(|reply| SessionCommand::CloseConversation { reply }).await
    }

    /// Send text to the open conversation; returns the pending entry's local id
    pub async fn send_message(&self, text: impl Into<String>) -> SyncResult<MessageId> {
        let text = text.into();
        self.request(|reply| SessionCommand::SendMessage { text, reply }).await?
    }

    pub async fn retry_send(&self, local_id: MessageId) -> SyncResult<()> {
        self.request(|reply| SessionCommand::RetrySend { local_id, reply }).await?
    }

    pub async fn discard_failed(&self, local_id: MessageId) -> SyncResult<()> {
        self.request(|reply| SessionCommand::DiscardFailed { local_id, reply }).await?
    }

    /// Start a DM with a chain address typed by the user
    pub async fn create_dm(&self, address: impl Into<String>) -> SyncResult<ConversationId> {
        let address = address.into();
        self.request(|reply| SessionCommand::CreateDm { address, reply }).await?
    }

    /// Remote-first consent change for a batch of inboxes
    pub async fn set_consent(&self, inbox_ids: Vec<InboxId>, action: ConsentAction) -> SyncResult<()> {
        self.request(|reply| SessionCommand::SetConsent { inbox_ids, action, reply }).await?
    }

    pub async fn allow(&self, inbox_ids: Vec<InboxId>) -> SyncResult<()> {
        self.set_consent(inbox_ids, ConsentAction::Allow).await
    }

    pub async fn deny(&self, inbox_ids: Vec<InboxId>) -> SyncResult<()> {
        self.set_consent(inbox_ids, ConsentAction::Deny).await
    }

    pub async fn mark_as_read(&self, id: ConversationId) -> SyncResult<()> {
        self.request(|reply| SessionCommand::MarkAsRead { id, reply }).await?
    }

    pub async fn set_read_receipts_disabled(&self, disabled: bool) -> SyncResult<()> {
        self.request(|reply| SessionCommand::SetReadReceiptsDisabled { disabled, reply }).await?
    }

    /// Show the contact panel for an inbox; earlier focus fetches are dropped
    pub async fn focus_contact(&self, inbox_id: InboxId) -> SyncResult<()> {
        self.request(|reply| SessionCommand::FocusContact { inbox_id, reply }).await
    }

    pub async fn clear_focus(&self) -> SyncResult<()> {
        self.request(|reply| SessionCommand::ClearFocus { reply }).await
    }

    /// Replace every live stream subscription and catch up on what the old
    /// ones missed
    pub async fn restart_streams(&self) -> SyncResult<()> {
        self.request(|reply| SessionCommand::RestartStreams { reply }).await
    }

    /// Stop streams and background work; resolves after the loop exits its
    /// command processing
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.request(|reply| SessionCommand::Shutdown { reply }).await
    }
}
