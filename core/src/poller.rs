/// Poller: periodic incremental fetch for the active conversation.
///
/// Stands in for a push channel. Each fetch is tagged with the conversation id and the
/// state epoch it was issued under; a response that comes back after a stop or a switch
/// is dropped instead of merged.
use crate::api::ApiClient;
use crate::error::Result;
use crate::state::SharedState;
use crate::types::{ChatEvent, ConversationId};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

struct PollTask {
    conversation_id: ConversationId,
    handle: JoinHandle<()>,
}

pub struct Poller {
    client: ApiClient,
    state: SharedState,
    events: broadcast::Sender<ChatEvent>,
    interval: Duration,
    task: Mutex<Option<PollTask>>,
}

impl Poller {
    pub(crate) fn new(
        client: ApiClient,
        state: SharedState,
        events: broadcast::Sender<ChatEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            state,
            events,
            interval,
            task: Mutex::new(None),
        }
    }

    /// Begin polling `conversation_id`. Replaces any running poll loop. Does nothing if
    /// the conversation is no longer the active one. The first tick fires one interval
    /// from now; callers wanting data immediately do an initial fetch first.
    pub fn start(&self, conversation_id: &str) {
        // Held until the new handle is stored, so racing starts cannot leak a loop
        let mut task = self.task.lock();
        if let Some(old) = task.take() {
            old.handle.abort();
            debug!("Stopped polling {}", old.conversation_id);
        }
        {
            let mut guard = self.state.lock();
            guard.invalidate();
            if guard.active_conversation_id() != Some(conversation_id) {
                debug!("Not polling {}: no longer active", conversation_id);
                return;
            }
        }

        let client = self.client.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let period = self.interval;
        let id = conversation_id.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                match fetch_into_store(&client, &state, &events, &id, false).await {
                    Ok(0) => {}
                    Ok(added) => debug!("Poll merged {} new message(s) into {}", added, id),
                    Err(e) => warn!("Poll tick for {} failed: {}", id, e),
                }
            }
        });

        info!("Polling conversation {} every {:?}", conversation_id, self.interval);
        *task = Some(PollTask {
            conversation_id: conversation_id.to_string(),
            handle,
        });
    }

    /// Stop polling. Synchronous: once this returns, no response issued before the call
    /// will be merged.
    pub fn stop(&self) {
        self.state.lock().invalidate();
        if let Some(task) = self.task.lock().take() {
            task.handle.abort();
            debug!("Stopped polling {}", task.conversation_id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Conversation the poll loop is bound to, if any
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.task.lock().as_ref().map(|t| t.conversation_id.clone())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}

/// Fetch messages for `conversation_id` and merge them, unless the view moved on while
/// the request was in flight. `full` ignores the cursor; otherwise the newest timestamp
/// previously fetched is sent as `since` (no cursor yet means a full fetch).
pub(crate) async fn fetch_into_store(
    client: &ApiClient,
    state: &SharedState,
    events: &broadcast::Sender<ChatEvent>,
    conversation_id: &str,
    full: bool,
) -> Result<usize> {
    let (since, epoch) = {
        let guard = state.lock();
        if guard.active_conversation_id() != Some(conversation_id) {
            return Ok(0);
        }
        let since = if full { None } else { guard.poll_cursor };
        (since, guard.epoch)
    };

    let messages = client.fetch_messages(conversation_id, since).await?;

    let added = {
        let mut guard = state.lock();
        if guard.epoch != epoch || guard.active_conversation_id() != Some(conversation_id) {
            debug!("Discarding stale fetch for {}", conversation_id);
            return Ok(0);
        }
        let batch: Vec<_> = messages
            .into_iter()
            .filter_map(|mut m| {
                match m.conversation_id.as_deref() {
                    Some(id) if id != conversation_id => return None,
                    Some(_) => {}
                    None => m.conversation_id = Some(conversation_id.to_string()),
                }
                Some(m)
            })
            .collect();
        if let Some(newest) = batch.iter().map(|m| m.created_at).max() {
            guard.poll_cursor = Some(guard.poll_cursor.map_or(newest, |c| c.max(newest)));
        }
        guard.store.merge(batch)
    };

    if added > 0 {
        let _ = events.send(ChatEvent::MessagesChanged {
            conversation_id: Some(conversation_id.to_string()),
        });
    }
    Ok(added)
}
