/// Optimistic send pipeline: show the message immediately, submit it, then swap the
/// provisional entry for the server copy (or mark it failed).
use crate::api::ApiClient;
use crate::error::{ChatError, Result};
use crate::message_store::OutgoingDraft;
use crate::poller::Poller;
use crate::session::Session;
use crate::state::SharedState;
use crate::types::{ChatEvent, ConversationId, Message, MessageId, SendMessageRequest};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A message that is in the feed as `Sending` and ready to submit
#[derive(Debug, Clone)]
pub struct PreparedSend {
    pub provisional: Message,
    request: SendMessageRequest,
    issued_for: Option<ConversationId>,
    view: u64,
}

#[derive(Clone, Copy)]
enum Outgoing<'a> {
    Fresh(&'a str),
    Retry(&'a str),
}

#[derive(Clone)]
pub struct SendPipeline {
    client: ApiClient,
    state: SharedState,
    poller: Arc<Poller>,
    events: broadcast::Sender<ChatEvent>,
    single_outstanding: bool,
    in_flight: Arc<AtomicUsize>,
}

impl SendPipeline {
    pub(crate) fn new(
        client: ApiClient,
        state: SharedState,
        poller: Arc<Poller>,
        events: broadcast::Sender<ChatEvent>,
        single_outstanding: bool,
    ) -> Self {
        Self {
            client,
            state,
            poller,
            events,
            single_outstanding,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fire-and-forget send. Returns the provisional message; progress shows up in the
    /// store and as `ChatEvent`s.
    pub fn send(&self, content: &str) -> Result<Message> {
        let prepared = self.prepare(Outgoing::Fresh(content))?;
        let provisional = prepared.provisional.clone();
        self.spawn_submit(prepared);
        Ok(provisional)
    }

    /// Send and wait for the outcome. On failure the entry is already marked `Failed`.
    pub async fn send_and_wait(&self, content: &str) -> Result<Message> {
        let prepared = self.prepare(Outgoing::Fresh(content))?;
        self.submit(prepared).await
    }

    /// Discard a failed message and send its content again under a new provisional id
    pub fn retry(&self, failed_id: &str) -> Result<Message> {
        let prepared = self.prepare(Outgoing::Retry(failed_id))?;
        let provisional = prepared.provisional.clone();
        self.spawn_submit(prepared);
        Ok(provisional)
    }

    pub async fn retry_and_wait(&self, failed_id: &str) -> Result<Message> {
        let prepared = self.prepare(Outgoing::Retry(failed_id))?;
        self.submit(prepared).await
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn spawn_submit(&self, prepared: PreparedSend) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let _ = pipeline.submit(prepared).await;
        });
    }

    fn prepare(&self, outgoing: Outgoing<'_>) -> Result<PreparedSend> {
        if let Outgoing::Fresh(content) = outgoing {
            if content.trim().is_empty() {
                return Err(ChatError::EmptyMessage);
            }
        }
        let session = self.client.session().require()?;
        self.reserve_slot()?;

        let prepared = match self.stage(outgoing, &session) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let _ = self.events.send(ChatEvent::MessagesChanged {
            conversation_id: prepared.issued_for.clone(),
        });
        Ok(prepared)
    }

    /// Count this send as in flight. With `single_outstanding`, claiming the only slot is
    /// a single atomic step so concurrent callers cannot both get it.
    fn reserve_slot(&self) -> Result<()> {
        if self.single_outstanding {
            self.in_flight
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .map(|_| ())
                .map_err(|_| ChatError::SendInFlight)
        } else {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Insert the provisional entry and build the request, under the state lock
    fn stage(&self, outgoing: Outgoing<'_>, session: &Session) -> Result<PreparedSend> {
        let prepared = {
            let mut guard = self.state.lock();
            let ctx = guard.context.clone().ok_or(ChatError::NoActiveChat)?;

            let content = match outgoing {
                Outgoing::Fresh(content) => content.trim().to_string(),
                Outgoing::Retry(id) => {
                    let failed = guard
                        .store
                        .take_failed(id)
                        .ok_or_else(|| ChatError::MessageNotFound(id.to_string()))?;
                    failed.content
                }
            };

            let provisional = guard.store.insert_optimistic(OutgoingDraft {
                conversation_id: ctx.active_conversation_id.clone(),
                sender_id: session.user_id.clone(),
                receiver_id: ctx.counterpart.id.clone(),
                content: content.clone(),
            });

            PreparedSend {
                request: SendMessageRequest {
                    content,
                    receiver_id: ctx.counterpart.id.clone(),
                    property_id: ctx.property_id.clone(),
                    conversation_id: ctx.active_conversation_id.clone(),
                },
                issued_for: ctx.active_conversation_id,
                view: guard.view,
                provisional,
            }
        };

        Ok(prepared)
    }

    async fn submit(&self, prepared: PreparedSend) -> Result<Message> {
        let result = self.client.send_message(&prepared.request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(response) => {
                let mut confirmed = response.message;
                confirmed.conversation_id = Some(response.conversation_id.clone());
                self.apply_confirmation(&prepared, &response.conversation_id, confirmed.clone());
                Ok(confirmed)
            }
            Err(e) => {
                warn!("Send of {} failed: {}", prepared.provisional.id, e);
                let marked = self
                    .state
                    .lock()
                    .store
                    .mark_failed(&prepared.provisional.id)
                    .is_some();
                if marked {
                    let _ = self.events.send(ChatEvent::MessageFailed {
                        provisional_id: prepared.provisional.id.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    fn apply_confirmation(
        &self,
        prepared: &PreparedSend,
        conversation_id: &str,
        confirmed: Message,
    ) {
        let message_id: MessageId = confirmed.id.clone();
        let adopted = {
            let mut guard = self.state.lock();
            let active = match guard.context.as_ref() {
                Some(ctx) => ctx.active_conversation_id.clone(),
                None => {
                    debug!("Chat closed before {} was confirmed", prepared.provisional.id);
                    return;
                }
            };

            let same_feed = guard.view == prepared.view
                && (active == prepared.issued_for || active.as_deref() == Some(conversation_id));
            if !same_feed {
                debug!(
                    "Active conversation changed; not reconciling {} into {:?}",
                    prepared.provisional.id, active
                );
                return;
            }

            guard.store.reconcile(&prepared.provisional.id, confirmed);

            let adopted = active.as_deref() != Some(conversation_id);
            if adopted {
                guard.activate(conversation_id.to_string());
            }
            adopted
        };

        let _ = self.events.send(ChatEvent::MessageConfirmed {
            provisional_id: prepared.provisional.id.clone(),
            message_id,
        });

        if adopted {
            info!("Conversation {} is now active", conversation_id);
            let _ = self.events.send(ChatEvent::ConversationActivated {
                conversation_id: conversation_id.to_string(),
            });
            self.poller.start(conversation_id);
        }
    }
}
