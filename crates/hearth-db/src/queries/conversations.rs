use hearth_types::Session;
use hearth_types::models::{
    Conversation, ConversationSummary, MessagePreview, Participant, ParticipantProfile,
};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::Database;
use crate::error::{Result, StoreError, is_unique_violation};
use crate::models::{
    conversation_from_row, encode_ts, get_opt_ts, get_photos, get_ts, get_uuid, now,
    participant_from_row,
};
use crate::policy;

/// Attempts before a resolver race is reported instead of retried.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ResolvedConversation {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
    /// True when this call inserted the conversation.
    pub created: bool,
}

impl ResolvedConversation {
    pub fn audience(&self) -> Vec<Uuid> {
        self.participants.iter().map(|p| p.user_id).collect()
    }
}

/// Order-independent key of a user pair.
pub fn pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

impl Database {
    /// Find-or-create the single conversation between the caller and
    /// `other_user_id`.
    ///
    /// The lookup and the insert run in one IMMEDIATE transaction, so
    /// callers sharing a database file are serialized. The UNIQUE
    /// `pair_key` covers anything that slips past that; a violation means
    /// another caller created the pair first and the lookup is simply
    /// repeated.
    pub fn start_conversation(
        &self,
        session: &Session,
        other_user_id: Uuid,
    ) -> Result<ResolvedConversation> {
        if session.user_id == other_user_id {
            return Err(StoreError::Validation(
                "cannot start a conversation with yourself".into(),
            ));
        }

        self.with_conn_mut(|conn| {
            for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
                match resolve_once(conn, session, other_user_id) {
                    Err(StoreError::Conflict(reason)) => {
                        warn!(
                            "Conversation race between {} and {} (attempt {}): {}",
                            session.user_id, other_user_id, attempt, reason
                        );
                    }
                    result => return result,
                }
            }
            Err(StoreError::Unavailable(format!(
                "conversation between {} and {} kept conflicting",
                session.user_id, other_user_id
            )))
        })
    }

    pub fn get_conversation(&self, session: &Session, conversation_id: Uuid) -> Result<Conversation> {
        self.with_conn(|conn| {
            policy::ensure_participant(conn, session, conversation_id)?;
            query_conversation(conn, conversation_id)?.ok_or(StoreError::NotFound("conversation"))
        })
    }

    /// Participant user ids, used as the audience of realtime changes.
    /// Internal: no policy check.
    pub fn participant_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            Ok(query_participants(conn, conversation_id)?
                .into_iter()
                .map(|p| p.user_id)
                .collect())
        })
    }

    /// The caller's conversation list: newest activity first, each with the
    /// other participant, the latest message and the number of messages
    /// addressed to the caller that are still unread.
    pub fn list_conversations(&self, session: &Session) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            policy::authenticate(conn, session)?;

            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_at, c.updated_at,
                        u.id, u.full_name, u.photos,
                        lm.id, lm.sender_id, lm.content, lm.created_at,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id
                            AND m.read_at IS NULL
                            AND m.sender_id <> ?1) AS unread
                 FROM conversation_participants me
                 JOIN conversations c ON c.id = me.conversation_id
                 LEFT JOIN conversation_participants other
                        ON other.conversation_id = c.id AND other.user_id <> ?1
                 LEFT JOIN users u ON u.id = other.user_id
                 LEFT JOIN messages lm ON lm.id = (
                        SELECT id FROM messages
                         WHERE conversation_id = c.id
                         ORDER BY created_at DESC, rowid DESC
                         LIMIT 1)
                 WHERE me.user_id = ?1
                 ORDER BY c.updated_at DESC, c.id",
            )?;

            let rows = stmt
                .query_map([session.user_id.to_string()], |row| {
                    let other = match row.get::<_, Option<String>>(3)? {
                        Some(_) => Some(ParticipantProfile {
                            user_id: get_uuid(row, 3)?,
                            full_name: row.get(4)?,
                            photos: get_photos(row, 5)?,
                        }),
                        None => None,
                    };
                    let last_message = match get_opt_ts(row, 9)? {
                        Some(created_at) => Some(MessagePreview {
                            id: get_uuid(row, 6)?,
                            sender_id: get_uuid(row, 7)?,
                            content: row.get(8)?,
                            created_at,
                        }),
                        None => None,
                    };

                    Ok(ConversationSummary {
                        conversation: Conversation {
                            id: get_uuid(row, 0)?,
                            created_at: get_ts(row, 1)?,
                            updated_at: get_ts(row, 2)?,
                        },
                        other,
                        last_message,
                        unread_count: row.get(10)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn resolve_once(
    conn: &mut Connection,
    session: &Session,
    other_user_id: Uuid,
) -> Result<ResolvedConversation> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    policy::authenticate(&tx, session)?;
    if !policy::user_exists(&tx, other_user_id)? {
        return Err(StoreError::NotFound("user"));
    }

    if let Some(conversation_id) = find_pair(&tx, session.user_id, other_user_id)? {
        let conversation = query_conversation(&tx, conversation_id)?
            .ok_or(StoreError::NotFound("conversation"))?;
        let participants = query_participants(&tx, conversation_id)?;
        tx.commit()?;

        debug!("Resolved existing conversation {}", conversation_id);
        return Ok(ResolvedConversation {
            conversation,
            participants,
            created: false,
        });
    }

    let resolved = insert_pair(&tx, session.user_id, other_user_id)?;
    tx.commit()?;

    info!(
        "Created conversation {} between {} and {}",
        resolved.conversation.id, session.user_id, other_user_id
    );
    Ok(resolved)
}

/// Conversation in which both users participate.
fn find_pair(conn: &Connection, a: Uuid, b: Uuid) -> Result<Option<Uuid>> {
    let id = conn
        .query_row(
            "SELECT p1.conversation_id
             FROM conversation_participants p1
             JOIN conversation_participants p2 ON p2.conversation_id = p1.conversation_id
             WHERE p1.user_id = ?1 AND p2.user_id = ?2
             LIMIT 1",
            [a.to_string(), b.to_string()],
            |row| get_uuid(row, 0),
        )
        .optional()?;
    Ok(id)
}

fn insert_pair(tx: &Transaction<'_>, caller: Uuid, other: Uuid) -> Result<ResolvedConversation> {
    let created_at = now();
    let conversation = Conversation {
        id: Uuid::new_v4(),
        created_at,
        updated_at: created_at,
    };

    tx.execute(
        "INSERT INTO conversations (id, pair_key, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        (
            conversation.id.to_string(),
            pair_key(caller, other),
            encode_ts(created_at),
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("pair {} already has a conversation", pair_key(caller, other)))
        } else {
            e.into()
        }
    })?;

    let mut participants = Vec::with_capacity(2);
    for user_id in [caller, other] {
        let participant = Participant {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            user_id,
        };
        tx.execute(
            "INSERT INTO conversation_participants (id, conversation_id, user_id) VALUES (?1, ?2, ?3)",
            (
                participant.id.to_string(),
                participant.conversation_id.to_string(),
                participant.user_id.to_string(),
            ),
        )?;
        participants.push(participant);
    }

    Ok(ResolvedConversation {
        conversation,
        participants,
        created: true,
    })
}

fn query_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    let conversation = conn
        .query_row(
            "SELECT id, created_at, updated_at FROM conversations WHERE id = ?1",
            [id.to_string()],
            conversation_from_row,
        )
        .optional()?;
    Ok(conversation)
}

pub(crate) fn query_participants(conn: &Connection, conversation_id: Uuid) -> Result<Vec<Participant>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, user_id FROM conversation_participants
         WHERE conversation_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([conversation_id.to_string()], participant_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
