//! In-memory `ChatBackend` for unit tests
use crate::api::ChatBackend;
use crate::error::{ChatError, Result};
use crate::session::Session;
use crate::types::{
    Conversation, Message, MessageStatus, SendMessageRequest, SendMessageResponse, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Default)]
struct FakeInner {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    calls: Vec<String>,
    fail_sends: usize,
    fail_fetches: bool,
    fetch_delay: Option<Duration>,
    send_gate: Option<Arc<Semaphore>>,
    next_id: u64,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    inner: Mutex<FakeInner>,
}

pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap_or_default()
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_conversation(&self, id: &str, property_id: &str, a: &str, b: &str, updated: i64) {
        self.inner.lock().conversations.push(Conversation {
            id: id.to_string(),
            property_id: property_id.to_string(),
            participant_ids: vec![a.to_string(), b.to_string()],
            other_user: None,
            last_message: None,
            unread_count: 0,
            updated_at: ts(updated),
        });
    }

    pub fn add_message(&self, id: &str, conversation_id: &str, sender: &str, receiver: &str, secs: i64) {
        self.inner.lock().messages.push(Message {
            id: id.to_string(),
            conversation_id: Some(conversation_id.to_string()),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: format!("content of {}", id),
            created_at: ts(secs),
            status: MessageStatus::Sent,
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn fail_next_sends(&self, n: usize) {
        self.inner.lock().fail_sends = n;
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.inner.lock().fail_fetches = fail;
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.inner.lock().fetch_delay = delay;
    }

    /// Block sends until `release_sends` is called
    pub fn hold_sends(&self) {
        self.inner.lock().send_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_sends(&self, n: usize) {
        if let Some(gate) = self.inner.lock().send_gate.as_ref() {
            gate.add_permits(n);
        }
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn list_conversations(&self, session: &Session) -> Result<Vec<Conversation>> {
        let mut inner = self.inner.lock();
        inner.calls.push("list".to_string());
        if inner.fail_fetches {
            return Err(ChatError::Network("connection refused".into()));
        }
        Ok(inner
            .conversations
            .iter()
            .filter(|c| c.participant_ids.contains(&session.user_id))
            .map(|c| {
                let mut c = c.clone();
                c.other_user = c
                    .participant_ids
                    .iter()
                    .find(|id| **id != session.user_id)
                    .map(|id| User::bare(id.clone()));
                c
            })
            .collect())
    }

    async fn fetch_messages(
        &self,
        _session: &Session,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let delay = {
            let mut inner = self.inner.lock();
            inner.calls.push(format!(
                "fetch {} {}",
                conversation_id,
                if since.is_some() { "since" } else { "full" }
            ));
            if inner.fail_fetches {
                return Err(ChatError::Network("connection refused".into()));
            }
            inner.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.inner.lock();
        let mut out: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id.as_deref() == Some(conversation_id))
            .filter(|m| since.map(|s| m.created_at > s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn send_message(
        &self,
        session: &Session,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse> {
        let gate = {
            let mut inner = self.inner.lock();
            inner.calls.push("send".to_string());
            inner.send_gate.clone()
        };
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut inner = self.inner.lock();
        if inner.fail_sends > 0 {
            inner.fail_sends -= 1;
            return Err(ChatError::Http {
                status: 503,
                body: "unavailable".into(),
            });
        }

        let conversation_id = match &request.conversation_id {
            Some(id) => id.clone(),
            None => {
                let existing = inner.conversations.iter().find(|c| {
                    c.property_id == request.property_id
                        && c.participant_ids.contains(&session.user_id)
                        && c.participant_ids.contains(&request.receiver_id)
                });
                match existing {
                    Some(c) => c.id.clone(),
                    None => {
                        inner.next_id += 1;
                        let id = format!("conv-{}", inner.next_id);
                        inner.conversations.push(Conversation {
                            id: id.clone(),
                            property_id: request.property_id.clone(),
                            participant_ids: vec![
                                session.user_id.clone(),
                                request.receiver_id.clone(),
                            ],
                            other_user: None,
                            last_message: None,
                            unread_count: 0,
                            updated_at: Utc::now(),
                        });
                        id
                    }
                }
            }
        };

        inner.next_id += 1;
        let created_at = inner
            .messages
            .iter()
            .map(|m| m.created_at)
            .max()
            .map(|t| t.max(Utc::now()) + ChronoDuration::milliseconds(1))
            .unwrap_or_else(Utc::now);
        let message = Message {
            id: format!("srv-{}", inner.next_id),
            conversation_id: Some(conversation_id.clone()),
            sender_id: session.user_id.clone(),
            receiver_id: request.receiver_id.clone(),
            content: request.content.clone(),
            created_at,
            status: MessageStatus::Sent,
        };
        inner.messages.push(message.clone());
        Ok(SendMessageResponse {
            message,
            conversation_id,
        })
    }
}
