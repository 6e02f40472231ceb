use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use hearth_types::api::{ErrorKind, MessageQuery};
use hearth_types::events::{Change, Notification, Operation, Record, Topic};
use hearth_types::models::{Message, validate_content};

use crate::backend::{Backend, Feed};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingStatus {
    Pending,
    Failed(String),
}

/// A message the user sent that the store has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub local_id: Uuid,
    pub content: String,
    pub status: OutgoingStatus,
}

/// What one folded notification changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    Upserted(Message),
    Removed(Uuid),
    /// The window was re-fetched.
    Refreshed,
    /// Duplicate, stale, or not about this conversation.
    Unchanged,
}

/// Ordered key of a message inside a conversation.
type MessageKey = (DateTime<Utc>, Uuid);

fn key(message: &Message) -> MessageKey {
    (message.created_at, message.id)
}

/// Live view of one conversation for the signed-in user.
///
/// Messages are held in creation order and merged by id, so notifications
/// may arrive twice or late without corrupting the view. Incoming messages
/// are marked read while the view is open.
pub struct ConversationView {
    backend: Arc<dyn Backend>,
    conversation_id: Uuid,
    feed: Feed,
    messages: BTreeMap<MessageKey, Message>,
    outbox: Vec<OutgoingMessage>,
    draft: String,
    has_older: bool,
    /// Set while the held window is known to be stale: a resync was
    /// signalled and its re-fetch has not succeeded yet.
    needs_refresh: bool,
}

impl ConversationView {
    /// Subscribe, then fetch, so that nothing sent in between is missed.
    pub async fn open(backend: Arc<dyn Backend>, conversation_id: Uuid) -> Result<Self> {
        let feed = backend.subscribe(Topic::Conversation(conversation_id)).await?;

        let mut view = Self {
            backend,
            conversation_id,
            feed,
            messages: BTreeMap::new(),
            outbox: Vec::new(),
            draft: String::new(),
            has_older: false,
            needs_refresh: false,
        };
        view.refresh().await?;
        Ok(view)
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Confirmed messages, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.messages.values().find(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn outbox(&self) -> &[OutgoingMessage] {
        &self.outbox
    }

    pub fn has_older(&self) -> bool {
        self.has_older
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    /// Incoming messages in the window still without a read receipt.
    pub fn unread_count(&self) -> usize {
        let me = self.backend.user_id();
        self.messages
            .values()
            .filter(|m| m.is_incoming_for(me) && !m.is_read())
            .count()
    }

    /// Replace the window with the newest page from the store, then mark
    /// what is unread in it.
    pub async fn refresh(&mut self) -> Result<()> {
        let query = MessageQuery::default();
        let page = self
            .backend
            .list_messages(self.conversation_id, query)
            .await?;

        self.has_older = page.len() as u32 >= query.clamped_limit();
        self.messages = page.into_iter().map(|m| (key(&m), m)).collect();
        self.needs_refresh = false;
        debug!(
            "Conversation {} refreshed with {} messages",
            self.conversation_id,
            self.messages.len()
        );

        if self.unread_count() > 0 {
            match self.backend.mark_conversation_read(self.conversation_id).await {
                Ok(marked) => {
                    // Receipts for messages older than the window are left
                    // for load_older to pick up.
                    for message in marked {
                        self.merge_held(message);
                    }
                }
                Err(e) => warn!("Marking conversation {} read failed: {}", self.conversation_id, e),
            }
        }
        Ok(())
    }

    /// Fetch the page before the oldest held message. Returns how many
    /// messages were added.
    pub async fn load_older(&mut self) -> Result<usize> {
        let Some(oldest) = self.messages.keys().next().map(|(created_at, _)| *created_at) else {
            return Ok(0);
        };
        let query = MessageQuery::before(oldest);
        let page = self
            .backend
            .list_messages(self.conversation_id, query)
            .await?;

        self.has_older = page.len() as u32 >= query.clamped_limit();
        let mut added = 0;
        for message in page {
            if self.merge(message) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Validate and send. Invalid content is rejected before anything is
    /// queued. A failed send stays in the outbox as `Failed` and its text
    /// is kept as the draft.
    pub async fn send(&mut self, content: &str) -> Result<Message> {
        let content = validate_content(content)?.to_string();
        let local_id = Uuid::new_v4();
        self.outbox.push(OutgoingMessage {
            local_id,
            content,
            status: OutgoingStatus::Pending,
        });
        self.deliver(local_id).await
    }

    /// Send the current draft. The draft is cleared only once the store
    /// confirms the message.
    pub async fn send_draft(&mut self) -> Result<Message> {
        let draft = self.draft.clone();
        self.send(&draft).await
    }

    /// Resend a failed outgoing message.
    pub async fn retry(&mut self, local_id: Uuid) -> Result<Message> {
        let entry = self
            .outbox
            .iter_mut()
            .find(|o| o.local_id == local_id)
            .ok_or_else(|| SyncError::rejected(ErrorKind::NotFound, "outgoing message not found"))?;
        entry.status = OutgoingStatus::Pending;
        self.deliver(local_id).await
    }

    /// Drop a failed outgoing message without sending it.
    pub fn discard(&mut self, local_id: Uuid) -> bool {
        let before = self.outbox.len();
        self.outbox.retain(|o| o.local_id != local_id);
        self.outbox.len() != before
    }

    async fn deliver(&mut self, local_id: Uuid) -> Result<Message> {
        let Some(content) = self
            .outbox
            .iter()
            .find(|o| o.local_id == local_id)
            .map(|o| o.content.clone())
        else {
            return Err(SyncError::rejected(ErrorKind::NotFound, "outgoing message not found"));
        };

        match self.backend.send_message(self.conversation_id, &content).await {
            Ok(message) => {
                self.outbox.retain(|o| o.local_id != local_id);
                if self.draft.trim() == content {
                    self.draft.clear();
                }
                self.merge(message.clone());
                Ok(message)
            }
            Err(e) => {
                warn!("Sending to conversation {} failed: {}", self.conversation_id, e);
                if let Some(entry) = self.outbox.iter_mut().find(|o| o.local_id == local_id) {
                    entry.status = OutgoingStatus::Failed(e.to_string());
                }
                if self.draft.trim().is_empty() {
                    self.draft = content;
                }
                Err(e)
            }
        }
    }

    /// Wait for the next notification and fold it into the view.
    /// Returns `SyncError::Closed` once the feed has ended.
    ///
    /// If an earlier re-fetch failed, it is retried first and nothing else
    /// is folded until it succeeds.
    pub async fn next_event(&mut self) -> Result<ViewUpdate> {
        if self.needs_refresh {
            self.refresh().await?;
            return Ok(ViewUpdate::Refreshed);
        }

        let Some(notification) = self.feed.next().await else {
            return Err(SyncError::Closed);
        };
        match notification {
            Notification::Change(change) => Ok(self.apply(change).await),
            Notification::Resync => {
                self.needs_refresh = true;
                self.refresh().await?;
                Ok(ViewUpdate::Refreshed)
            }
        }
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh
    }

    async fn apply(&mut self, change: Change) -> ViewUpdate {
        let Record::Message(message) = change.record else {
            return ViewUpdate::Unchanged;
        };
        if message.conversation_id != self.conversation_id {
            return ViewUpdate::Unchanged;
        }

        if change.operation == Operation::Delete {
            return match self.messages.remove(&key(&message)) {
                Some(_) => ViewUpdate::Removed(message.id),
                None => ViewUpdate::Unchanged,
            };
        }

        let id = message.id;
        let needs_receipt = message.is_incoming_for(self.backend.user_id()) && !message.is_read();
        let mut changed = match change.operation {
            Operation::Update => self.merge_held(message),
            _ if self.in_window(&key(&message)) => self.merge(message),
            // Older than the window: load_older will fetch it in order.
            _ => return ViewUpdate::Unchanged,
        };

        if needs_receipt && self.message(id).is_some_and(|m| !m.is_read()) {
            match self.backend.mark_read(id).await {
                Ok(receipt) => {
                    if let Some(read) = receipt.message() {
                        changed |= self.merge_held(read.clone());
                    }
                }
                Err(e) => warn!("Marking message {} read failed: {}", id, e),
            }
        }

        match self.message(id) {
            Some(current) if changed => ViewUpdate::Upserted(current.clone()),
            _ => ViewUpdate::Unchanged,
        }
    }

    /// Whether a message with this key belongs inside the contiguous
    /// window held, which runs from the oldest held message to now.
    fn in_window(&self, key: &MessageKey) -> bool {
        match self.messages.keys().next() {
            Some(oldest) => key >= oldest,
            None => !self.has_older,
        }
    }

    /// Update a message only if it is already held.
    fn merge_held(&mut self, incoming: Message) -> bool {
        if !self.messages.contains_key(&key(&incoming)) {
            return false;
        }
        self.merge(incoming)
    }

    /// Insert or update by id. A read message never goes back to unread.
    /// Returns whether the view changed.
    fn merge(&mut self, incoming: Message) -> bool {
        match self.messages.get_mut(&key(&incoming)) {
            Some(existing) => {
                if *existing == incoming || (existing.is_read() && !incoming.is_read()) {
                    return false;
                }
                *existing = incoming;
                true
            }
            None => {
                self.messages.insert(key(&incoming), incoming);
                true
            }
        }
    }

    /// Close the subscription. Nothing reaches the view afterwards.
    pub fn close(self) {
        debug!("Conversation view {} closed", self.conversation_id);
    }
}
