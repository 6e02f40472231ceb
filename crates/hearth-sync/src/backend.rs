use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use hearth_api::Messenger;
use hearth_types::Session;
use hearth_types::api::MessageQuery;
use hearth_types::events::{Notification, Topic};
use hearth_types::models::{ConversationSummary, Message, ReadReceipt};

use crate::error::Result;

/// A realtime feed. Dropping it closes the subscription.
pub type Feed = BoxStream<'static, Notification>;

/// The messaging core as one signed-in user reaches it.
#[async_trait]
pub trait Backend: Send + Sync {
    fn user_id(&self) -> Uuid;

    /// Id of the one conversation with `other_user_id`, created if missing.
    async fn start_conversation(&self, other_user_id: Uuid) -> Result<Uuid>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;

    async fn list_messages(&self, conversation_id: Uuid, query: MessageQuery) -> Result<Vec<Message>>;

    async fn send_message(&self, conversation_id: Uuid, content: &str) -> Result<Message>;

    async fn mark_read(&self, message_id: Uuid) -> Result<ReadReceipt>;

    async fn mark_conversation_read(&self, conversation_id: Uuid) -> Result<Vec<Message>>;

    /// Changes published after this returns are delivered on the feed.
    async fn subscribe(&self, topic: Topic) -> Result<Feed>;
}

/// In-process backend: calls the messaging service directly.
#[derive(Clone)]
pub struct LocalBackend {
    messenger: Messenger,
    session: Session,
}

impl LocalBackend {
    pub fn new(messenger: Messenger, session: Session) -> Self {
        Self { messenger, session }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn user_id(&self) -> Uuid {
        self.session.user_id
    }

    async fn start_conversation(&self, other_user_id: Uuid) -> Result<Uuid> {
        let resolved = self
            .messenger
            .start_conversation(self.session, other_user_id)
            .await?;
        Ok(resolved.conversation.id)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.messenger.list_conversations(self.session).await?)
    }

    async fn list_messages(&self, conversation_id: Uuid, query: MessageQuery) -> Result<Vec<Message>> {
        Ok(self
            .messenger
            .list_messages(self.session, conversation_id, query)
            .await?)
    }

    async fn send_message(&self, conversation_id: Uuid, content: &str) -> Result<Message> {
        Ok(self
            .messenger
            .send_message(self.session, conversation_id, content.to_string())
            .await?)
    }

    async fn mark_read(&self, message_id: Uuid) -> Result<ReadReceipt> {
        Ok(self.messenger.mark_read(self.session, message_id).await?)
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        Ok(self
            .messenger
            .mark_conversation_read(self.session, conversation_id)
            .await?)
    }

    async fn subscribe(&self, topic: Topic) -> Result<Feed> {
        let subscription = self.messenger.subscribe(self.session, topic).await?;
        Ok(subscription.boxed())
    }
}
