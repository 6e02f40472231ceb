use hearth_types::Session;
use hearth_types::models::{Message, Participant, User};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::info;
use uuid::Uuid;

use crate::Database;
use crate::error::{Result, StoreError, is_unique_violation};
use crate::models::{
    MESSAGE_COLUMNS, USER_COLUMNS, UserRow, encode_ts, get_uuid, message_from_row, now,
    participant_from_row, user_from_row,
};
use crate::policy;

pub const MAX_NAME_CHARS: usize = 64;
pub const MAX_PHOTOS: usize = 6;

/// Everything account deletion cascaded away from one conversation.
#[derive(Debug, Clone)]
pub struct RemovedConversation {
    pub conversation_id: Uuid,
    pub participants: Vec<Participant>,
    pub messages: Vec<Message>,
}

impl RemovedConversation {
    /// Users who could see the conversation before it was removed.
    pub fn audience(&self) -> Vec<Uuid> {
        self.participants.iter().map(|p| p.user_id).collect()
    }
}

impl Database {
    pub fn create_user(
        &self,
        id: Uuid,
        email: &str,
        full_name: &str,
        password_hash: &str,
    ) -> Result<User> {
        let full_name = validate_name(full_name)?;
        let created_at = now();

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, full_name, password, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id.to_string(), email, full_name, password_hash, encode_ts(created_at)),
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict("email already registered".into())
                } else {
                    e.into()
                }
            })?;

            Ok(User {
                id,
                email: email.to_string(),
                full_name: full_name.to_string(),
                photos: vec![],
                created_at,
            })
        })
    }

    pub fn get_credentials_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, full_name, password FROM users WHERE email = ?1",
                    [email],
                    |row| {
                        Ok(UserRow {
                            id: get_uuid(row, 0)?,
                            full_name: row.get(1)?,
                            password: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Profiles are the community directory: any account can read them.
    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    pub fn update_profile(
        &self,
        session: &Session,
        full_name: Option<&str>,
        photos: Option<&[String]>,
    ) -> Result<User> {
        let full_name = full_name.map(validate_name).transpose()?;
        let photos = photos
            .map(|p| {
                if p.len() > MAX_PHOTOS {
                    return Err(StoreError::Validation(format!(
                        "at most {} photos",
                        MAX_PHOTOS
                    )));
                }
                serde_json::to_string(p).map_err(|e| StoreError::Validation(e.to_string()))
            })
            .transpose()?;

        self.with_conn_mut(|conn| {
            policy::authenticate(conn, session)?;

            conn.execute(
                "UPDATE users SET
                    full_name = COALESCE(?1, full_name),
                    photos = COALESCE(?2, photos)
                 WHERE id = ?3",
                (full_name, photos, session.user_id.to_string()),
            )?;

            query_user(conn, session.user_id)?.ok_or(StoreError::Unauthorized)
        })
    }

    /// Deletes the caller's account. Every conversation they were part of
    /// goes with it (participants and messages cascade); the removed rows
    /// are returned so they can be announced.
    pub fn delete_user(&self, session: &Session) -> Result<Vec<RemovedConversation>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            policy::authenticate(&tx, session)?;

            let conversation_ids: Vec<Uuid> = {
                let mut stmt = tx.prepare(
                    "SELECT conversation_id FROM conversation_participants WHERE user_id = ?1",
                )?;
                stmt.query_map([session.user_id.to_string()], |row| get_uuid(row, 0))?
                    .collect::<std::result::Result<_, _>>()?
            };

            let mut removed = Vec::with_capacity(conversation_ids.len());
            for conversation_id in conversation_ids {
                let participants = {
                    let mut stmt = tx.prepare(
                        "SELECT id, conversation_id, user_id FROM conversation_participants
                         WHERE conversation_id = ?1",
                    )?;
                    stmt.query_map([conversation_id.to_string()], participant_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                };
                let messages = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {} FROM messages WHERE conversation_id = ?1
                         ORDER BY created_at, rowid",
                        MESSAGE_COLUMNS
                    ))?;
                    stmt.query_map([conversation_id.to_string()], message_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                };

                tx.execute(
                    "DELETE FROM conversations WHERE id = ?1",
                    [conversation_id.to_string()],
                )?;

                removed.push(RemovedConversation {
                    conversation_id,
                    participants,
                    messages,
                });
            }

            tx.execute("DELETE FROM users WHERE id = ?1", [session.user_id.to_string()])?;
            tx.commit()?;

            info!(
                "Deleted account {} ({} conversations removed)",
                session.user_id,
                removed.len()
            );
            Ok(removed)
        })
    }
}

fn validate_name(raw: &str) -> Result<&str> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_CHARS {
        return Err(StoreError::Validation(format!(
            "full name must be 1 to {} characters",
            MAX_NAME_CHARS
        )));
    }
    Ok(name)
}

pub(crate) fn query_user(conn: &Connection, id: Uuid) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            [id.to_string()],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_fetch_user() {
        let db = db();
        let id = Uuid::new_v4();
        let created = db.create_user(id, "ada@example.com", "  Ada  ", "hash").unwrap();
        assert_eq!(created.full_name, "Ada");

        let fetched = db.get_user(id).unwrap().unwrap();
        assert_eq!(fetched, created);

        let creds = db.get_credentials_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(creds.id, id);
        assert_eq!(creds.password, "hash");
    }

    #[test]
    fn test_duplicate_email_is_conflict() {
        let db = db();
        db.create_user(Uuid::new_v4(), "ada@example.com", "Ada", "h").unwrap();
        let err = db
            .create_user(Uuid::new_v4(), "ada@example.com", "Other", "h")
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_update_profile_partial() {
        let db = db();
        let id = Uuid::new_v4();
        db.create_user(id, "ada@example.com", "Ada", "h").unwrap();
        let session = Session::new(id);

        let photos = vec!["a.jpg".to_string(), "b.jpg".to_string()];
        let user = db.update_profile(&session, None, Some(&photos)).unwrap();
        assert_eq!(user.full_name, "Ada");
        assert_eq!(user.photos, photos);

        let user = db.update_profile(&session, Some("Ada L."), None).unwrap();
        assert_eq!(user.full_name, "Ada L.");
        assert_eq!(user.photos, photos);
    }

    #[test]
    fn test_update_profile_validates() {
        let db = db();
        let id = Uuid::new_v4();
        db.create_user(id, "ada@example.com", "Ada", "h").unwrap();
        let session = Session::new(id);

        assert!(matches!(
            db.update_profile(&session, Some("   "), None),
            Err(StoreError::Validation(_))
        ));
        let too_many = vec!["p".to_string(); MAX_PHOTOS + 1];
        assert!(matches!(
            db.update_profile(&session, None, Some(&too_many)),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_session_is_unauthorized() {
        let db = db();
        let err = db
            .update_profile(&Session::new(Uuid::new_v4()), Some("X"), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized));
    }
}
