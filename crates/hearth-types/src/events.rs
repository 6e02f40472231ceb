use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ErrorKind;
use crate::models::{Message, Participant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    ConversationParticipants,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// The row a change is about. For deletes it is the row as it was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Record {
    Message(Message),
    Participant(Participant),
}

/// A row-level change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub operation: Operation,
    pub record: Record,
}

impl Change {
    pub fn message(operation: Operation, message: Message) -> Self {
        Self {
            operation,
            record: Record::Message(message),
        }
    }

    pub fn participant(operation: Operation, participant: Participant) -> Self {
        Self {
            operation,
            record: Record::Participant(participant),
        }
    }

    pub fn table(&self) -> Table {
        match self.record {
            Record::Message(_) => Table::Messages,
            Record::Participant(_) => Table::ConversationParticipants,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match &self.record {
            Record::Message(m) => m.conversation_id,
            Record::Participant(p) => p.conversation_id,
        }
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Topic {
    /// Message changes in one conversation.
    Conversation(Uuid),
    /// Message and participant changes in every conversation the
    /// subscriber can see. Drives the conversation list.
    AllConversations,
}

impl Topic {
    pub fn matches(&self, change: &Change) -> bool {
        match self {
            Self::Conversation(id) => {
                change.table() == Table::Messages && change.conversation_id() == *id
            }
            Self::AllConversations => true,
        }
    }
}

/// Item of a realtime feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Change(Change),
    /// Events were lost (overflow or reconnect). Local state must be
    /// re-fetched from the store.
    Resync,
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the authenticated connection
    Ready { user_id: Uuid },

    /// A subscription is registered; changes after this point are delivered
    Subscribed { topic: Topic },

    Unsubscribed { topic: Topic },

    Change { topic: Topic, change: Change },

    /// The server dropped events for this topic
    Resync { topic: Topic },

    Error {
        topic: Option<Topic>,
        kind: ErrorKind,
        message: String,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(conversation_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: "hi".into(),
            created_at: Utc::now(),
            read_at: None,
        }
    }

    #[test]
    fn test_conversation_topic_matches_only_its_messages() {
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let topic = Topic::Conversation(c1);

        assert!(topic.matches(&Change::message(Operation::Insert, message(c1))));
        assert!(!topic.matches(&Change::message(Operation::Insert, message(c2))));

        let participant = Participant {
            id: Uuid::new_v4(),
            conversation_id: c1,
            user_id: Uuid::new_v4(),
        };
        assert!(!topic.matches(&Change::participant(Operation::Insert, participant.clone())));
        assert!(Topic::AllConversations.matches(&Change::participant(Operation::Insert, participant)));
    }

    #[test]
    fn test_gateway_event_wire_format() {
        let c = Uuid::new_v4();
        let event = GatewayEvent::Change {
            topic: Topic::Conversation(c),
            change: Change::message(Operation::Insert, message(c)),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Change");
        assert_eq!(json["data"]["topic"]["scope"], "conversation");
        assert_eq!(json["data"]["change"]["operation"], "insert");
        assert_eq!(json["data"]["change"]["record"]["table"], "message");

        let back: GatewayEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, GatewayEvent::Change { .. }));
    }

    #[test]
    fn test_all_conversations_topic_serializes_without_id() {
        let json = serde_json::to_value(Topic::AllConversations).unwrap();
        assert_eq!(json, serde_json::json!({ "scope": "all_conversations" }));
    }
}
