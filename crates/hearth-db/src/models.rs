//! Row decoding. Ids are stored as hyphenated UUID text, timestamps as
//! RFC 3339 UTC with fixed microsecond precision so that text order equals
//! time order.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use hearth_types::models::{Conversation, Message, Participant, User};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

/// Credentials row, only read by the login path.
pub struct UserRow {
    pub id: Uuid,
    pub full_name: String,
    pub password: String,
}

pub const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, created_at, read_at";
pub const USER_COLUMNS: &str = "id, email, full_name, photos, created_at";

/// Current time at storage precision, so values handed back to callers
/// equal what a later read returns.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw, idx)
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s, idx)).transpose()
}

pub(crate) fn get_photos(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_ts(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Maps a row selected with `MESSAGE_COLUMNS`.
pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: get_uuid(row, 0)?,
        conversation_id: get_uuid(row, 1)?,
        sender_id: get_uuid(row, 2)?,
        content: row.get(3)?,
        created_at: get_ts(row, 4)?,
        read_at: get_opt_ts(row, 5)?,
    })
}

/// Maps a row selected with `USER_COLUMNS`.
pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: get_uuid(row, 0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        photos: get_photos(row, 3)?,
        created_at: get_ts(row, 4)?,
    })
}

pub(crate) fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: get_uuid(row, 0)?,
        created_at: get_ts(row, 1)?,
        updated_at: get_ts(row, 2)?,
    })
}

pub(crate) fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: get_uuid(row, 0)?,
        conversation_id: get_uuid(row, 1)?,
        user_id: get_uuid(row, 2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encoded_timestamps_sort_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        let c = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        assert!(encode_ts(a) < encode_ts(b));
        assert!(encode_ts(b) < encode_ts(c));
        assert_eq!(encode_ts(a), "2024-01-01T09:00:00.000000Z");
    }
}
