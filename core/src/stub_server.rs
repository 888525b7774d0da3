/// Stub chat backend: in-memory REST server for local development and integration tests
///
/// Endpoints:
///   GET  /conversations                      conversations of the caller, `otherUser` resolved
///   GET  /conversations/:id?since=<rfc3339>  {"messages":[...]} newest first, `since` exclusive
///   POST /messages                           body: {"content","receiverId","propertyId","conversationId"?}
///
/// The bearer token is the caller's user id.
use crate::error::{ChatError, Result};
use crate::types::{
    Conversation, ConversationId, Message, MessagePreview, MessageStatus, PropertyId,
    SendMessageRequest, SendMessageResponse, User, UserId,
};
use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

type Reply = Response<Full<Bytes>>;

/// Status and message for a `{"error": ...}` reply
type Rejection = (StatusCode, String);

#[derive(Debug, Clone)]
struct StoredConversation {
    id: ConversationId,
    property_id: PropertyId,
    participants: Vec<UserId>,
    updated_at: DateTime<Utc>,
    /// Per participant: newest message they have fetched
    read_up_to: HashMap<UserId, DateTime<Utc>>,
}

impl StoredConversation {
    fn has(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

#[derive(Debug, Default)]
struct StubData {
    users: HashMap<UserId, User>,
    conversations: Vec<StoredConversation>,
    messages: Vec<Message>,
    fail_sends: usize,
}

/// Seed file format
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubSeed {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub conversations: Vec<SeedConversation>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedConversation {
    pub id: ConversationId,
    pub property_id: PropertyId,
    pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Default)]
pub struct StubBackend {
    data: Mutex<StubData>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: StubSeed) -> Result<Self> {
        let backend = Self::new();
        for user in seed.users {
            backend.add_user(user);
        }
        for c in seed.conversations {
            if c.participant_ids.len() != 2 {
                return Err(ChatError::Config(format!(
                    "conversation {} must have exactly 2 participants",
                    c.id
                )));
            }
            backend.add_conversation(&c.id, &c.property_id, &c.participant_ids[0], &c.participant_ids[1]);
        }
        for m in seed.messages {
            backend.insert_message(m);
        }
        Ok(backend)
    }

    pub fn from_seed_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let seed: StubSeed = serde_json::from_str(&raw)?;
        Self::from_seed(seed)
    }

    pub fn add_user(&self, user: User) {
        self.data.lock().users.insert(user.id.clone(), user);
    }

    pub fn add_conversation(&self, id: &str, property_id: &str, a: &str, b: &str) {
        self.data.lock().conversations.push(StoredConversation {
            id: id.to_string(),
            property_id: property_id.to_string(),
            participants: vec![a.to_string(), b.to_string()],
            updated_at: Utc::now(),
            read_up_to: HashMap::new(),
        });
    }

    /// Insert a server-side message as if another client had sent it
    pub fn insert_message(&self, mut message: Message) {
        message.status = MessageStatus::Sent;
        let mut data = self.data.lock();
        if let Some(conv) = data
            .conversations
            .iter_mut()
            .find(|c| Some(&c.id) == message.conversation_id.as_ref())
        {
            conv.updated_at = conv.updated_at.max(message.created_at);
        }
        data.messages.push(message);
    }

    /// Make the next `n` sends answer 503
    pub fn fail_next_sends(&self, n: usize) {
        self.data.lock().fail_sends = n;
    }

    pub fn message_count(&self) -> usize {
        self.data.lock().messages.len()
    }

    pub fn conversation_count(&self) -> usize {
        self.data.lock().conversations.len()
    }

    fn list_for(&self, user_id: &str) -> Vec<Conversation> {
        let data = self.data.lock();
        let mut out: Vec<Conversation> = data
            .conversations
            .iter()
            .filter(|c| c.has(user_id))
            .map(|c| render_conversation(&data, c, user_id))
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    fn messages_for(
        &self,
        user_id: &str,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> std::result::Result<Vec<Message>, Rejection> {
        let mut data = self.data.lock();
        let conv_idx = data
            .conversations
            .iter()
            .position(|c| c.id == conversation_id && c.has(user_id))
            .ok_or((StatusCode::NOT_FOUND, "conversation not found".to_string()))?;

        let mut out: Vec<Message> = data
            .messages
            .iter()
            .filter(|m| m.conversation_id.as_deref() == Some(conversation_id))
            .filter(|m| since.map(|s| m.created_at > s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if let Some(newest) = out.first().map(|m| m.created_at) {
            let mark = data.conversations[conv_idx]
                .read_up_to
                .entry(user_id.to_string())
                .or_insert(newest);
            *mark = (*mark).max(newest);
        }
        Ok(out)
    }

    fn send_from(
        &self,
        user_id: &str,
        req: SendMessageRequest,
    ) -> std::result::Result<SendMessageResponse, Rejection> {
        if req.content.trim().is_empty() {
            return Err((StatusCode::BAD_REQUEST, "content is empty".to_string()));
        }
        if req.receiver_id == user_id {
            return Err((StatusCode::BAD_REQUEST, "cannot message yourself".to_string()));
        }

        let mut data = self.data.lock();
        if data.fail_sends > 0 {
            data.fail_sends -= 1;
            return Err((StatusCode::SERVICE_UNAVAILABLE, "send temporarily unavailable".to_string()));
        }

        let conv_idx = match &req.conversation_id {
            Some(id) => data
                .conversations
                .iter()
                .position(|c| &c.id == id && c.has(user_id) && c.has(&req.receiver_id))
                .ok_or((StatusCode::NOT_FOUND, "conversation not found".to_string()))?,
            None => {
                let existing = data.conversations.iter().position(|c| {
                    c.property_id == req.property_id && c.has(user_id) && c.has(&req.receiver_id)
                });
                match existing {
                    Some(idx) => idx,
                    None => {
                        let id = format!("conv_{}", Uuid::new_v4().simple());
                        info!("Creating conversation {} about {}", id, req.property_id);
                        data.conversations.push(StoredConversation {
                            id,
                            property_id: req.property_id.clone(),
                            participants: vec![user_id.to_string(), req.receiver_id.clone()],
                            updated_at: Utc::now(),
                            read_up_to: HashMap::new(),
                        });
                        data.conversations.len() - 1
                    }
                }
            }
        };

        // Strictly increasing timestamps keep `since` cursors exact
        // and stay representable in the microsecond cursor format
        let now = Utc::now().trunc_subsecs(6);
        let created_at = data
            .messages
            .iter()
            .map(|m| m.created_at)
            .max()
            .map(|last| now.max(last + ChronoDuration::microseconds(1)))
            .unwrap_or(now);

        let conversation_id = data.conversations[conv_idx].id.clone();
        let message = Message {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            conversation_id: Some(conversation_id.clone()),
            sender_id: user_id.to_string(),
            receiver_id: req.receiver_id,
            content: req.content,
            created_at,
            status: MessageStatus::Sent,
        };
        data.conversations[conv_idx].updated_at = created_at;
        data.messages.push(message.clone());

        Ok(SendMessageResponse {
            message,
            conversation_id,
        })
    }
}

fn render_conversation(data: &StubData, c: &StoredConversation, user_id: &str) -> Conversation {
    let other_user = c
        .participants
        .iter()
        .find(|p| p.as_str() != user_id)
        .map(|id| data.users.get(id).cloned().unwrap_or_else(|| User::bare(id.clone())));

    let in_conv = data
        .messages
        .iter()
        .filter(|m| m.conversation_id.as_deref() == Some(c.id.as_str()));
    let last_message = in_conv
        .clone()
        .max_by_key(|m| m.created_at)
        .map(|m| MessagePreview {
            content: m.content.clone(),
            sender_id: m.sender_id.clone(),
            created_at: m.created_at,
        });
    let read_mark = c.read_up_to.get(user_id).copied();
    let unread_count = in_conv
        .filter(|m| m.receiver_id == user_id)
        .filter(|m| read_mark.map(|r| m.created_at > r).unwrap_or(true))
        .count() as u32;

    Conversation {
        id: c.id.clone(),
        property_id: c.property_id.clone(),
        participant_ids: c.participants.clone(),
        other_user,
        last_message,
        unread_count,
        updated_at: c.updated_at,
    }
}

fn reply<T: serde::Serialize>(status: StatusCode, value: &T) -> Reply {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn reject((status, message): Rejection) -> Reply {
    reply(status, &serde_json::json!({ "error": message }))
}

fn bearer_user(req: &Request<Incoming>) -> Option<UserId> {
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn parse_since(query: &str) -> std::result::Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "since")
        .map(|(_, v)| v)
    else {
        return Ok(None);
    };
    let decoded = urlencoding::decode(raw).map_err(|e| e.to_string())?;
    DateTime::parse_from_rfc3339(&decoded)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| format!("invalid since: {}", e))
}

/// Bind `addr` and serve until the returned task is aborted. Returns the bound address
/// (useful with port 0).
pub async fn start_stub_server(
    backend: Arc<StubBackend>,
    addr: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Stub chat backend listening on http://{}", local);

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(serve(TokioIo::new(stream), backend.clone()));
                }
                Err(e) => error!("Stub backend accept failed: {}", e),
            }
        }
    });
    Ok((local, handle))
}

async fn serve(io: TokioIo<tokio::net::TcpStream>, backend: Arc<StubBackend>) {
    let svc = service_fn(move |req| {
        let backend = backend.clone();
        async move { Ok::<_, Infallible>(route(req, &backend).await) }
    });
    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
        if !e.is_incomplete_message() {
            debug!("Stub backend connection closed: {}", e);
        }
    }
}

async fn route(req: Request<Incoming>, backend: &StubBackend) -> Reply {
    debug!("{} {}", req.method(), req.uri());
    let Some(user_id) = bearer_user(&req) else {
        return reject((StatusCode::UNAUTHORIZED, "not authenticated".to_string()));
    };

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["conversations"]) => {
            let conversations = backend.list_for(&user_id);
            Ok(reply(StatusCode::OK, &serde_json::json!({ "conversations": conversations })))
        }
        (&Method::GET, ["conversations", raw_id]) => {
            let conversation_id = urlencoding::decode(raw_id)
                .map(|id| id.into_owned())
                .unwrap_or_else(|_| raw_id.to_string());
            let query = req.uri().query().unwrap_or_default();
            parse_since(query)
                .map_err(|e| (StatusCode::BAD_REQUEST, e))
                .and_then(|since| backend.messages_for(&user_id, &conversation_id, since))
                .map(|messages| reply(StatusCode::OK, &serde_json::json!({ "messages": messages })))
        }
        (&Method::POST, ["messages"]) => post_message(req, &user_id, backend).await,
        _ => Err((StatusCode::NOT_FOUND, "not found".to_string())),
    };
    result.unwrap_or_else(reject)
}

async fn post_message(
    req: Request<Incoming>,
    user_id: &str,
    backend: &StubBackend,
) -> std::result::Result<Reply, Rejection> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("unreadable body: {}", e)))?
        .to_bytes();
    let request: SendMessageRequest = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)))?;
    let sent = backend.send_from(user_id, request)?;
    Ok(reply(StatusCode::OK, &sent))
}
