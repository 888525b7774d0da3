/// Chat engine: one open chat view (single conversation or owner inbox) and the
/// surface screens talk to.
use crate::api::{ApiClient, ChatBackend, HttpBackend};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::owner::OwnerInbox;
use crate::poller::{fetch_into_store, Poller};
use crate::resolver::ConversationResolver;
use crate::send::SendPipeline;
use crate::session::SessionHandle;
use crate::state::{self, ActiveConversationContext, SharedState};
use crate::types::{ChatEvent, ConversationId, Message, MessageStatus, User};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct ChatEngine {
    config: Config,
    client: ApiClient,
    state: SharedState,
    poller: Arc<Poller>,
    sender: SendPipeline,
    resolver: ConversationResolver,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatEngine {
    pub fn new(config: Config, backend: Arc<dyn ChatBackend>, session: SessionHandle) -> Result<Self> {
        config.validate()?;

        let client = ApiClient::new(backend, session, config.request_timeout);
        let state = state::shared();
        let (events, _) = broadcast::channel(config.event_buffer);
        let poller = Arc::new(Poller::new(
            client.clone(),
            state.clone(),
            events.clone(),
            config.poll_interval,
        ));
        let sender = SendPipeline::new(
            client.clone(),
            state.clone(),
            poller.clone(),
            events.clone(),
            config.single_outstanding_send,
        );
        let resolver = ConversationResolver::new(client.clone());

        Ok(Self {
            config,
            client,
            state,
            poller,
            sender,
            resolver,
            events,
        })
    }

    /// Engine talking to the REST backend at `config.api_base_url`
    pub fn with_http(config: Config, session: SessionHandle) -> Result<Self> {
        let backend = HttpBackend::new(&config.api_base_url, config.request_timeout)?;
        Self::new(config, Arc::new(backend), session)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Open the chat view on a known conversation, or on none yet (`None`: the first
    /// send creates it).
    pub async fn open_conversation(
        &self,
        conversation_id: Option<ConversationId>,
        property_id: &str,
        counterpart: User,
    ) -> Result<()> {
        let session = self.client.session().require()?;

        self.poller.stop();
        self.state.lock().open(ActiveConversationContext {
            active_conversation_id: conversation_id.clone(),
            current_user_id: session.user_id,
            property_id: property_id.to_string(),
            counterpart,
        });
        let _ = self.events.send(ChatEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });

        if let Some(id) = conversation_id {
            info!("Opened conversation {}", id);
            let _ = self.events.send(ChatEvent::ConversationActivated {
                conversation_id: id.clone(),
            });
            if let Err(e) = fetch_into_store(&self.client, &self.state, &self.events, &id, true).await {
                warn!("Initial fetch for {} failed: {}", id, e);
            }
            self.poller.start(&id);
        } else {
            info!(
                "Opened new chat about {} with {}",
                property_id,
                self.counterpart_id().unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Resolve the conversation for (property, counterpart) and open it. Returns the
    /// resolved id; `None` means the first send will create one.
    pub async fn open_with_counterpart(
        &self,
        property_id: &str,
        counterpart: User,
    ) -> Result<Option<ConversationId>> {
        self.client.session().require()?;
        let resolved = self.resolver.resolve(property_id, &counterpart.id).await;
        self.open_conversation(resolved.clone(), property_id, counterpart)
            .await?;
        Ok(resolved)
    }

    /// Owner view over every conversation about one property. `None` when the current
    /// user is not `property_owner_id`.
    pub fn owner_inbox(&self, property_owner_id: &str) -> Result<Option<OwnerInbox>> {
        let session = self.client.session().require()?;
        if session.user_id != property_owner_id {
            return Ok(None);
        }
        Ok(Some(OwnerInbox::new(
            self.client.clone(),
            self.state.clone(),
            self.poller.clone(),
            self.events.clone(),
        )))
    }

    pub fn send(&self, content: &str) -> Result<Message> {
        self.sender.send(content)
    }

    pub async fn send_and_wait(&self, content: &str) -> Result<Message> {
        self.sender.send_and_wait(content).await
    }

    pub fn retry(&self, failed_id: &str) -> Result<Message> {
        self.sender.retry(failed_id)
    }

    pub async fn retry_and_wait(&self, failed_id: &str) -> Result<Message> {
        self.sender.retry_and_wait(failed_id).await
    }

    /// Remove a message from the local feed
    pub fn delete_message(&self, message_id: &str) -> Result<Message> {
        let (removed, conversation_id) = {
            let mut guard = self.state.lock();
            let removed = guard
                .store
                .remove(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
            (removed, guard.active_conversation_id().map(String::from))
        };
        let _ = self
            .events
            .send(ChatEvent::MessagesChanged { conversation_id });
        Ok(removed)
    }

    /// Full fetch of the active conversation, outside the poll schedule
    pub async fn refresh(&self) -> Result<usize> {
        let id = self
            .active_conversation_id()
            .ok_or(ChatError::ConversationNotFound)?;
        fetch_into_store(&self.client, &self.state, &self.events, &id, true).await
    }

    /// Newest first
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().store.snapshot()
    }

    pub fn status_of(&self, message_id: &str) -> Option<MessageStatus> {
        self.state.lock().store.get(message_id).map(|m| m.status)
    }

    pub fn failed_messages(&self) -> Vec<Message> {
        self.state.lock().store.failed()
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.state.lock().active_conversation_id().map(String::from)
    }

    pub fn context(&self) -> Option<ActiveConversationContext> {
        self.state.lock().context.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    /// Tear down the view: stop polling and forget the feed
    pub fn close(&self) {
        self.poller.stop();
        self.state.lock().close();
        info!("Chat closed");
    }

    fn counterpart_id(&self) -> Option<String> {
        self.state
            .lock()
            .context
            .as_ref()
            .map(|c| c.counterpart.id.clone())
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        self.poller.stop();
    }
}
