/// State shared by the poller, the send pipeline and the owner view for one open chat
use crate::message_store::MessageStore;
use crate::types::{ConversationId, PropertyId, User, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Which conversation the open chat view is showing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConversationContext {
    /// `None` until a conversation is resolved or created by the first send
    pub active_conversation_id: Option<ConversationId>,
    pub current_user_id: UserId,
    pub property_id: PropertyId,
    pub counterpart: User,
}

/// Every mutation of the feed and the context happens under one lock, and the lock is
/// never held across an await.
#[derive(Debug, Default)]
pub(crate) struct ChatState {
    pub context: Option<ActiveConversationContext>,
    pub store: MessageStore,
    /// Bumped whenever in-flight fetches must no longer be applied
    /// (conversation switch, poller stop, close).
    pub epoch: u64,
    /// Bumped each time a view is opened or closed; outlives conversation adoption
    pub view: u64,
    /// Newest `created_at` seen in a fetch response. Only fetches advance it; messages
    /// confirmed by a send do not, so replies that landed before them are still polled.
    pub poll_cursor: Option<DateTime<Utc>>,
}

pub(crate) type SharedState = Arc<Mutex<ChatState>>;

impl ChatState {
    pub fn active_conversation_id(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|c| c.active_conversation_id.as_deref())
    }

    /// Replace the context and start from an empty feed
    pub fn open(&mut self, context: ActiveConversationContext) {
        self.context = Some(context);
        self.store.clear();
        self.poll_cursor = None;
        self.epoch += 1;
        self.view += 1;
    }

    /// Point the open view at a (possibly new) conversation id, keeping the feed
    pub fn activate(&mut self, conversation_id: ConversationId) {
        if let Some(ctx) = self.context.as_mut() {
            ctx.active_conversation_id = Some(conversation_id);
        }
        self.poll_cursor = None;
        self.epoch += 1;
    }

    pub fn close(&mut self) {
        self.context = None;
        self.store.clear();
        self.poll_cursor = None;
        self.epoch += 1;
        self.view += 1;
    }

    pub fn invalidate(&mut self) {
        self.epoch += 1;
    }
}

pub(crate) fn shared() -> SharedState {
    Arc::new(Mutex::new(ChatState::default()))
}
