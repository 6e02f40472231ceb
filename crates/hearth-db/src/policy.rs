//! Row-level access rules. Every query in `queries` calls one of these
//! before it touches conversation, participant or message rows:
//!
//! - a user sees a conversation, its participants and its messages only
//!   while they are a participant;
//! - a user inserts messages only as themselves, into a conversation they
//!   participate in;
//! - a user updates a message's read state only when it is addressed to
//!   them.

use hearth_types::Session;
use hearth_types::events::Topic;
use hearth_types::models::Message;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Result, StoreError};

pub fn user_exists(conn: &Connection, user_id: Uuid) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM users WHERE id = ?1",
            [user_id.to_string()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// The session must belong to a live account.
pub fn authenticate(conn: &Connection, session: &Session) -> Result<()> {
    if user_exists(conn, session.user_id)? {
        Ok(())
    } else {
        Err(StoreError::Unauthorized)
    }
}

pub fn is_participant(conn: &Connection, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
            [conversation_id.to_string(), user_id.to_string()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Authenticates, then requires the conversation to exist and the caller to
/// be one of its participants.
pub fn ensure_participant(conn: &Connection, session: &Session, conversation_id: Uuid) -> Result<()> {
    authenticate(conn, session)?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1",
            [conversation_id.to_string()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists {
        return Err(StoreError::NotFound("conversation"));
    }

    if !is_participant(conn, conversation_id, session.user_id)? {
        return Err(StoreError::Forbidden("not a participant of this conversation"));
    }
    Ok(())
}

/// Who may move `message.read_at` from null: a participant other than the
/// sender. Participation must already be checked.
pub fn is_recipient(session: &Session, message: &Message) -> bool {
    message.is_incoming_for(session.user_id)
}

/// A realtime subscription sees what a select would see.
pub fn authorize_topic(conn: &Connection, session: &Session, topic: &Topic) -> Result<()> {
    match topic {
        Topic::Conversation(id) => ensure_participant(conn, session, *id),
        Topic::AllConversations => authenticate(conn, session),
    }
}
