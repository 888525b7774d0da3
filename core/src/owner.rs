/// Owner inbox: every conversation about one property, one of them selected.
///
/// Only changes which conversation id is active. Fetching, merging and polling
/// are the same as for a single chat.
use crate::api::ApiClient;
use crate::error::{ChatError, Result};
use crate::poller::{fetch_into_store, Poller};
use crate::state::{ActiveConversationContext, SharedState};
use crate::types::{ChatEvent, Conversation, ConversationId, PropertyId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct InboxState {
    property_id: Option<PropertyId>,
    conversations: Vec<Conversation>,
    selected: Option<ConversationId>,
}

pub struct OwnerInbox {
    client: ApiClient,
    state: SharedState,
    poller: Arc<Poller>,
    events: broadcast::Sender<ChatEvent>,
    inbox: Mutex<InboxState>,
}

impl OwnerInbox {
    pub(crate) fn new(
        client: ApiClient,
        state: SharedState,
        poller: Arc<Poller>,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        Self {
            client,
            state,
            poller,
            events,
            inbox: Mutex::new(InboxState::default()),
        }
    }

    /// Load every conversation about `property_id`, most recently updated first, each with
    /// its counterpart resolved. Selects the first one if nothing is selected yet.
    pub async fn load_for_property(&self, property_id: &str) -> Result<Vec<Conversation>> {
        let session = self.client.session().require()?;
        let all = self.client.list_conversations().await?;
        let conversations = conversations_for_property(all, &session.user_id, property_id);

        let to_select = {
            let mut inbox = self.inbox.lock();
            if inbox.property_id.as_deref() != Some(property_id) {
                inbox.selected = None;
            }
            inbox.property_id = Some(property_id.to_string());
            inbox.conversations = conversations.clone();

            let still_listed = inbox
                .selected
                .as_ref()
                .map(|id| conversations.iter().any(|c| &c.id == id))
                .unwrap_or(false);
            if still_listed {
                None
            } else {
                conversations.first().map(|c| c.id.clone())
            }
        };

        info!(
            "Loaded {} conversation(s) for property {}",
            conversations.len(),
            property_id
        );
        let _ = self.events.send(ChatEvent::ConversationsLoaded {
            property_id: property_id.to_string(),
            count: conversations.len(),
        });

        if let Some(id) = to_select {
            self.select_conversation(&id).await?;
        }
        Ok(conversations)
    }

    /// Switch the active conversation: stop polling the old one, clear the feed, fetch
    /// the new one in full, then poll it.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<()> {
        let session = self.client.session().require()?;
        let (conversation, property_id) = {
            let inbox = self.inbox.lock();
            let conversation = inbox
                .conversations
                .iter()
                .find(|c| c.id == conversation_id)
                .cloned()
                .ok_or(ChatError::ConversationNotFound)?;
            let property_id = inbox
                .property_id
                .clone()
                .unwrap_or_else(|| conversation.property_id.clone());
            (conversation, property_id)
        };
        let counterpart = conversation
            .counterpart(&session.user_id)
            .ok_or(ChatError::ConversationNotFound)?;

        self.poller.stop();
        self.state.lock().open(ActiveConversationContext {
            active_conversation_id: Some(conversation.id.clone()),
            current_user_id: session.user_id.clone(),
            property_id,
            counterpart,
        });
        self.inbox.lock().selected = Some(conversation.id.clone());

        info!("Switched to conversation {}", conversation.id);
        let _ = self.events.send(ChatEvent::ConversationActivated {
            conversation_id: conversation.id.clone(),
        });
        let _ = self.events.send(ChatEvent::MessagesChanged {
            conversation_id: Some(conversation.id.clone()),
        });

        if let Err(e) =
            fetch_into_store(&self.client, &self.state, &self.events, &conversation.id, true).await
        {
            warn!("Initial fetch for {} failed: {}", conversation.id, e);
        }
        self.poller.start(&conversation.id);
        Ok(())
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inbox.lock().conversations.clone()
    }

    pub fn selected(&self) -> Option<ConversationId> {
        self.inbox.lock().selected.clone()
    }
}

/// Directory entries about `property_id`, with `other_user` filled in from the
/// participants when the server left it out, newest activity first.
pub fn conversations_for_property(
    all: Vec<Conversation>,
    current_user_id: &str,
    property_id: &str,
) -> Vec<Conversation> {
    let mut out: Vec<Conversation> = all
        .into_iter()
        .filter(|c| c.property_id == property_id)
        .filter_map(|mut c| match c.counterpart(current_user_id) {
            Some(user) => {
                c.other_user = Some(user);
                Some(c)
            }
            None => {
                warn!("Conversation {} has no counterpart for {}", c.id, current_user_id);
                None
            }
        })
        .collect();
    out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    out
}
