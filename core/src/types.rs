/// Shared types for the chat engine and its backend
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type PropertyId = String;
pub type ConversationId = String;
pub type MessageId = String;

/// A participant, owned by the backend. The engine only compares ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl User {
    /// A user known only by id (no profile data available yet)
    pub fn bare(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            avatar_url: None,
        }
    }
}

/// Last message shown in a conversation list row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub content: String,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
}

/// One thread between two users about one property.
///
/// Records always come from the backend, rendered from the current user's point of view:
/// `other_user` is the participant who is not the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub property_id: PropertyId,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// The counterpart as seen by `current_user_id`: the populated `other_user` if present,
    /// otherwise the participant that is not the current user.
    pub fn counterpart(&self, current_user_id: &str) -> Option<User> {
        if let Some(user) = &self.other_user {
            if user.id != current_user_id {
                return Some(user.clone());
            }
        }
        self.participant_ids
            .iter()
            .find(|id| id.as_str() != current_user_id)
            .map(|id| User::bare(id.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Shown locally, not yet acknowledged
    Sending,
    /// Server-confirmed, carries its canonical id
    #[default]
    Sent,
    /// Submission failed; kept in the feed for retry
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// `None` only for a provisional message sent before the conversation existed
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    /// Provisional messages carry a local id until the server replaces them.
    pub fn is_provisional(&self) -> bool {
        self.status != MessageStatus::Sent
    }
}

/// Body of `POST /messages`. Leaving `conversation_id` out asks the backend to
/// create the conversation if it does not exist yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    pub receiver_id: UserId,
    pub property_id: PropertyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message: Message,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesPage {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationList {
    pub conversations: Vec<Conversation>,
}

/// Engine notifications for the screens rendering the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The feed changed (merge, optimistic insert, delete, clear)
    MessagesChanged { conversation_id: Option<ConversationId> },
    /// A provisional message was replaced by its server copy
    MessageConfirmed {
        provisional_id: MessageId,
        message_id: MessageId,
    },
    /// A send failed; the bubble stays with a retry affordance
    MessageFailed {
        provisional_id: MessageId,
        reason: String,
    },
    /// The active conversation id changed
    ConversationActivated { conversation_id: ConversationId },
    /// The owner view refreshed its conversation list
    ConversationsLoaded { property_id: PropertyId, count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(other: Option<User>, participants: &[&str]) -> Conversation {
        Conversation {
            id: "c1".into(),
            property_id: "p1".into(),
            participant_ids: participants.iter().map(|s| s.to_string()).collect(),
            other_user: other,
            last_message: None,
            unread_count: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_counterpart_prefers_other_user() {
        let mut u2 = User::bare("u2");
        u2.name = "Dana".into();
        let c = conversation(Some(u2.clone()), &["o1", "u2"]);
        assert_eq!(c.counterpart("o1"), Some(u2));
    }

    #[test]
    fn test_counterpart_falls_back_to_participants() {
        let c = conversation(None, &["o1", "u3"]);
        assert_eq!(c.counterpart("o1"), Some(User::bare("u3")));

        // other_user pointing at ourselves is an inconsistent payload
        let c = conversation(Some(User::bare("o1")), &["o1", "u4"]);
        assert_eq!(c.counterpart("o1"), Some(User::bare("u4")));
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let json = r#"{
            "id": "m1",
            "conversationId": "c1",
            "senderId": "u1",
            "receiverId": "u2",
            "content": "Is this available?",
            "createdAt": "2024-03-01T10:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.conversation_id.as_deref(), Some("c1"));
        assert_eq!(msg.status, MessageStatus::Sent);
        assert!(!msg.is_provisional());

        let req = SendMessageRequest {
            content: "hi".into(),
            receiver_id: "u2".into(),
            property_id: "p1".into(),
            conversation_id: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["receiverId"], "u2");
        assert!(value.get("conversationId").is_none());
    }
}
