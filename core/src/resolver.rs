/// Conversation resolution: does a conversation already exist for (property, counterpart)?
use crate::api::ApiClient;
use crate::error::{ChatError, Result};
use crate::types::{Conversation, ConversationId};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ConversationResolver {
    client: ApiClient,
}

impl ConversationResolver {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Fetch the directory and pick the matching conversation.
    /// `ChatError::ConversationNotFound` when nothing matches.
    pub async fn try_resolve(&self, property_id: &str, counterpart_id: &str) -> Result<Conversation> {
        let session = self.client.session().require()?;
        let conversations = self.client.list_conversations().await?;
        find_conversation(&conversations, &session.user_id, property_id, counterpart_id)
            .cloned()
            .ok_or(ChatError::ConversationNotFound)
    }

    /// Like `try_resolve`, but any failure means "no conversation yet": the first send
    /// will have the backend create it.
    pub async fn resolve(&self, property_id: &str, counterpart_id: &str) -> Option<ConversationId> {
        match self.try_resolve(property_id, counterpart_id).await {
            Ok(conversation) => {
                debug!(
                    "Resolved conversation {} for property {} with {}",
                    conversation.id, property_id, counterpart_id
                );
                Some(conversation.id)
            }
            Err(ChatError::ConversationNotFound) => {
                debug!(
                    "No conversation yet for property {} with {}",
                    property_id, counterpart_id
                );
                None
            }
            Err(e) => {
                warn!("Conversation resolution failed, continuing without one: {}", e);
                None
            }
        }
    }
}

/// The conversation about `property_id` whose counterpart (from `current_user_id`'s side) is
/// `counterpart_id`. Duplicates should not exist; if they do, the most recently updated wins.
pub fn find_conversation<'a>(
    conversations: &'a [Conversation],
    current_user_id: &str,
    property_id: &str,
    counterpart_id: &str,
) -> Option<&'a Conversation> {
    let mut best: Option<&Conversation> = None;
    for c in conversations {
        if c.property_id != property_id {
            continue;
        }
        let matches = c
            .counterpart(current_user_id)
            .map(|u| u.id == counterpart_id)
            .unwrap_or(false);
        if !matches {
            continue;
        }
        match best {
            Some(b) if b.updated_at >= c.updated_at => {}
            _ => best = Some(c),
        }
    }
    best
}
