use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest message body accepted, in characters.
pub const MAX_MESSAGE_CHARS: usize = 1000;

/// The authenticated caller. Every store operation takes one explicitly
/// instead of reading ambient session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    pub user_id: Uuid,
}

impl Session {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub photos: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A two-party messaging thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Last activity: bumped whenever a message is appended.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// In a two-party conversation every message not sent by `user_id`
    /// is addressed to them.
    pub fn is_incoming_for(&self, user_id: Uuid) -> bool {
        self.sender_id != user_id
    }
}

/// Directory info for the other side of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub user_id: Uuid,
    pub full_name: String,
    pub photos: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub other: Option<ParticipantProfile>,
    pub last_message: Option<MessagePreview>,
    pub unread_count: u32,
}

/// Result of a single read receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadReceipt {
    /// `read_at` moved from null to a timestamp just now.
    Marked { message: Message },
    /// Someone already marked it; nothing changed.
    AlreadyRead { message: Message },
    /// The caller sent this message, so it is not theirs to mark.
    NotRecipient,
}

impl ReadReceipt {
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Marked { message } | Self::AlreadyRead { message } => Some(message),
            Self::NotRecipient => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("message content is empty")]
    Empty,
    #[error("message content exceeds {max} characters")]
    TooLong { max: usize },
    #[error("message content contains control characters")]
    ControlCharacter,
}

/// Trim a message body and check it against the content rules.
/// Shared by the store and by clients so both reject the same input.
pub fn validate_content(raw: &str) -> Result<&str, ContentError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ContentError::Empty);
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ContentError::TooLong {
            max: MAX_MESSAGE_CHARS,
        });
    }
    if trimmed
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(ContentError::ControlCharacter);
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_content_trims() {
        assert_eq!(validate_content("  hello \n"), Ok("hello"));
    }

    #[test]
    fn test_validate_content_rejects_blank() {
        assert_eq!(validate_content(""), Err(ContentError::Empty));
        assert_eq!(validate_content(" \t\n "), Err(ContentError::Empty));
    }

    #[test]
    fn test_validate_content_length_is_in_chars() {
        let max = "é".repeat(MAX_MESSAGE_CHARS);
        assert!(validate_content(&max).is_ok());

        let over = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert_eq!(
            validate_content(&over),
            Err(ContentError::TooLong {
                max: MAX_MESSAGE_CHARS
            })
        );
    }

    #[test]
    fn test_validate_content_rejects_control_characters() {
        assert_eq!(validate_content("\0hello"), Err(ContentError::ControlCharacter));
        assert_eq!(validate_content("a\u{7}b"), Err(ContentError::ControlCharacter));
        assert_eq!(validate_content("one\r\n\ttwo"), Ok("one\r\n\ttwo"));
    }

    #[test]
    fn test_read_receipt_wire_format() {
        let json = serde_json::to_value(ReadReceipt::NotRecipient).unwrap();
        assert_eq!(json["status"], "not_recipient");
    }
}
