use chrono::{DateTime, Duration, Utc};
use hearth_types::Session;
use hearth_types::api::MessageQuery;
use hearth_types::models::{Message, ReadReceipt, validate_content};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::Database;
use crate::error::{Result, StoreError};
use crate::models::{MESSAGE_COLUMNS, encode_ts, get_opt_ts, get_ts, message_from_row, now};
use crate::policy;

impl Database {
    /// Append a message as the caller.
    ///
    /// `created_at` is strictly greater than every earlier message of the
    /// conversation and than the conversation's `updated_at`, even if the
    /// clock steps back. History order is total and the insert trigger always
    /// moves `updated_at` forward.
    pub fn send_message(
        &self,
        session: &Session,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message> {
        let content = validate_content(content)?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            policy::ensure_participant(&tx, session, conversation_id)?;

            let (updated_at, latest): (DateTime<Utc>, Option<DateTime<Utc>>) = tx.query_row(
                "SELECT c.updated_at,
                        (SELECT MAX(m.created_at) FROM messages m WHERE m.conversation_id = c.id)
                 FROM conversations c WHERE c.id = ?1",
                [conversation_id.to_string()],
                |row| Ok((get_ts(row, 0)?, get_opt_ts(row, 1)?)),
            )?;
            let floor = latest.map_or(updated_at, |latest| latest.max(updated_at));
            let mut created_at = now();
            if created_at <= floor {
                created_at = floor + Duration::microseconds(1);
            }

            let message = Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: session.user_id,
                content: content.to_string(),
                created_at,
                read_at: None,
            };

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.sender_id.to_string(),
                    &message.content,
                    encode_ts(message.created_at),
                ),
            )?;
            tx.commit()?;

            debug!(
                "Message {} appended to conversation {} by {}",
                message.id, conversation_id, session.user_id
            );
            Ok(message)
        })
    }

    /// Read receipt for one message. Only the recipient moves `read_at`
    /// from null; anything else is a no-op reported through the result.
    pub fn mark_read(&self, session: &Session, message_id: Uuid) -> Result<ReadReceipt> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let message =
                query_message(&tx, message_id)?.ok_or(StoreError::NotFound("message"))?;
            policy::ensure_participant(&tx, session, message.conversation_id)?;

            if !policy::is_recipient(session, &message) {
                return Ok(ReadReceipt::NotRecipient);
            }
            if message.is_read() {
                return Ok(ReadReceipt::AlreadyRead { message });
            }

            let read_at = now();
            let changed = tx.execute(
                "UPDATE messages SET read_at = ?1 WHERE id = ?2 AND read_at IS NULL",
                (encode_ts(read_at), message_id.to_string()),
            )?;
            let message =
                query_message(&tx, message_id)?.ok_or(StoreError::NotFound("message"))?;
            tx.commit()?;

            if changed == 0 {
                return Ok(ReadReceipt::AlreadyRead { message });
            }
            Ok(ReadReceipt::Marked { message })
        })
    }

    /// Mark every unread message addressed to the caller in a conversation.
    /// Returns the messages that changed.
    pub fn mark_conversation_read(
        &self,
        session: &Session,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            policy::ensure_participant(&tx, session, conversation_id)?;

            let unread: Vec<Uuid> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM messages
                     WHERE conversation_id = ?1 AND sender_id <> ?2 AND read_at IS NULL
                     ORDER BY created_at, rowid",
                )?;
                stmt.query_map(
                    [conversation_id.to_string(), session.user_id.to_string()],
                    |row| crate::models::get_uuid(row, 0),
                )?
                .collect::<std::result::Result<_, _>>()?
            };
            if unread.is_empty() {
                return Ok(vec![]);
            }

            let read_at = encode_ts(now());
            tx.execute(
                "UPDATE messages SET read_at = ?1
                 WHERE conversation_id = ?2 AND sender_id <> ?3 AND read_at IS NULL",
                (
                    &read_at,
                    conversation_id.to_string(),
                    session.user_id.to_string(),
                ),
            )?;

            let mut marked = Vec::with_capacity(unread.len());
            for id in unread {
                if let Some(message) = query_message(&tx, id)? {
                    marked.push(message);
                }
            }
            tx.commit()?;

            debug!(
                "{} marked {} messages read in {}",
                session.user_id,
                marked.len(),
                conversation_id
            );
            Ok(marked)
        })
    }

    /// A window of history, oldest first. See `MessageQuery`.
    pub fn list_messages(
        &self,
        session: &Session,
        conversation_id: Uuid,
        query: &MessageQuery,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            policy::ensure_participant(conn, session, conversation_id)?;

            // Newest window first, then flip to ascending.
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at < ?2)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3",
                MESSAGE_COLUMNS
            ))?;
            let mut rows = stmt
                .query_map(
                    rusqlite::params![
                        conversation_id.to_string(),
                        query.before.map(encode_ts),
                        query.clamped_limit(),
                    ],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();

            Ok(rows)
        })
    }

    pub fn get_message(&self, session: &Session, message_id: Uuid) -> Result<Message> {
        self.with_conn(|conn| {
            let message =
                query_message(conn, message_id)?.ok_or(StoreError::NotFound("message"))?;
            policy::ensure_participant(conn, session, message.conversation_id)?;
            Ok(message)
        })
    }
}

fn query_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
            [id.to_string()],
            message_from_row,
        )
        .optional()?;
    Ok(message)
}
