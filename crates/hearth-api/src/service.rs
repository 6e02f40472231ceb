use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use hearth_db::models::UserRow;
use hearth_db::queries::{RemovedConversation, ResolvedConversation};
use hearth_db::{Database, StoreError, policy};
use hearth_gateway::{Dispatcher, Subscription};
use hearth_types::Session;
use hearth_types::api::MessageQuery;
use hearth_types::events::{Change, Operation, Topic};
use hearth_types::models::{ConversationSummary, Message, ReadReceipt, User};

type Result<T> = std::result::Result<T, StoreError>;

/// The messaging core as the HTTP layer and in-process clients see it:
/// store operations run off the async runtime, and every committed write is
/// announced on the dispatcher to the conversation's participants.
#[derive(Clone)]
pub struct Messenger {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl Messenger {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run blocking store work on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Unavailable(e.to_string())
            })?
    }

    pub async fn start_conversation(
        &self,
        session: Session,
        other_user_id: Uuid,
    ) -> Result<ResolvedConversation> {
        let resolved = self
            .run(move |db| db.start_conversation(&session, other_user_id))
            .await?;

        if resolved.created {
            let audience = resolved.audience();
            for participant in &resolved.participants {
                self.dispatcher
                    .publish(Change::participant(Operation::Insert, participant.clone()), &audience);
            }
        }
        Ok(resolved)
    }

    pub async fn list_conversations(&self, session: Session) -> Result<Vec<ConversationSummary>> {
        self.run(move |db| db.list_conversations(&session)).await
    }

    pub async fn list_messages(
        &self,
        session: Session,
        conversation_id: Uuid,
        query: MessageQuery,
    ) -> Result<Vec<Message>> {
        self.run(move |db| db.list_messages(&session, conversation_id, &query))
            .await
    }

    pub async fn send_message(
        &self,
        session: Session,
        conversation_id: Uuid,
        content: String,
    ) -> Result<Message> {
        let (message, audience) = self
            .run(move |db| {
                let message = db.send_message(&session, conversation_id, &content)?;
                let audience = db.participant_ids(conversation_id)?;
                Ok((message, audience))
            })
            .await?;

        self.dispatcher
            .publish(Change::message(Operation::Insert, message.clone()), &audience);
        Ok(message)
    }

    pub async fn mark_read(&self, session: Session, message_id: Uuid) -> Result<ReadReceipt> {
        let (receipt, audience) = self
            .run(move |db| {
                let receipt = db.mark_read(&session, message_id)?;
                let audience = match &receipt {
                    ReadReceipt::Marked { message } => db.participant_ids(message.conversation_id)?,
                    _ => vec![],
                };
                Ok((receipt, audience))
            })
            .await?;

        if let ReadReceipt::Marked { message } = &receipt {
            self.dispatcher
                .publish(Change::message(Operation::Update, message.clone()), &audience);
        }
        Ok(receipt)
    }

    pub async fn mark_conversation_read(
        &self,
        session: Session,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>> {
        let (marked, audience) = self
            .run(move |db| {
                let marked = db.mark_conversation_read(&session, conversation_id)?;
                let audience = db.participant_ids(conversation_id)?;
                Ok((marked, audience))
            })
            .await?;

        for message in &marked {
            self.dispatcher
                .publish(Change::message(Operation::Update, message.clone()), &audience);
        }
        Ok(marked)
    }

    pub async fn create_account(
        &self,
        email: String,
        full_name: String,
        password_hash: String,
    ) -> Result<User> {
        self.run(move |db| db.create_user(Uuid::new_v4(), &email, &full_name, &password_hash))
            .await
    }

    pub async fn credentials(&self, email: String) -> Result<Option<UserRow>> {
        self.run(move |db| db.get_credentials_by_email(&email)).await
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User> {
        self.run(move |db| db.get_user(user_id)?.ok_or(StoreError::NotFound("user")))
            .await
    }

    pub async fn update_profile(
        &self,
        session: Session,
        full_name: Option<String>,
        photos: Option<Vec<String>>,
    ) -> Result<User> {
        self.run(move |db| db.update_profile(&session, full_name.as_deref(), photos.as_deref()))
            .await
    }

    /// Account deletion. Announces every removed message and participant
    /// row to the users who could see them.
    pub async fn delete_account(&self, session: Session) -> Result<Vec<RemovedConversation>> {
        let removed = self.run(move |db| db.delete_user(&session)).await?;

        for conversation in &removed {
            let audience = conversation.audience();
            for message in &conversation.messages {
                self.dispatcher
                    .publish(Change::message(Operation::Delete, message.clone()), &audience);
            }
            for participant in &conversation.participants {
                self.dispatcher
                    .publish(Change::participant(Operation::Delete, participant.clone()), &audience);
            }
        }
        Ok(removed)
    }

    /// Open a realtime feed after the same visibility check a select gets.
    pub async fn subscribe(&self, session: Session, topic: Topic) -> Result<Subscription> {
        self.run(move |db| db.with_conn(|conn| policy::authorize_topic(conn, &session, &topic)))
            .await?;
        Ok(self.dispatcher.subscribe(session.user_id, topic))
    }
}
