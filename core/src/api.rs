/// Backend access: the `ChatBackend` seam, its reqwest implementation, and the
/// session/timeout-enforcing client every engine component goes through.
///
/// Endpoints:
///   GET  /conversations                      conversations visible to the caller
///   GET  /conversations/:id?since=<rfc3339>  messages (full history without `since`)
///   POST /messages                           body: {"content","receiverId","propertyId","conversationId"?}
use crate::error::{ChatError, Result};
use crate::session::{Session, SessionHandle};
use crate::types::{
    Conversation, ConversationList, Message, MessagesPage, SendMessageRequest,
    SendMessageResponse,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// The three backend operations the engine consumes
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_conversations(&self, session: &Session) -> Result<Vec<Conversation>>;

    async fn fetch_messages(
        &self,
        session: &Session,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    async fn send_message(
        &self,
        session: &Session,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse>;
}

// ─── HTTP backend ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            base_url,
            timeout,
            http,
        })
    }

    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    pub fn conversations_path() -> &'static str {
        "/conversations"
    }

    pub fn conversation_path(conversation_id: &str, since: Option<DateTime<Utc>>) -> String {
        let id = urlencoding::encode(conversation_id);
        match since {
            Some(ts) => format!(
                "/conversations/{}?since={}",
                id,
                urlencoding::encode(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            ),
            None => format!("/conversations/{}", id),
        }
    }

    pub fn messages_path() -> &'static str {
        "/messages"
    }

    fn request(&self, method: reqwest::Method, path: &str, session: &Session) -> Result<reqwest::RequestBuilder> {
        let url = self
            .endpoint(path)
            .ok_or_else(|| ChatError::InvalidUrl(path.to_string()))?;
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(&session.token)
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .timeout(self.timeout))
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn list_conversations(&self, session: &Session) -> Result<Vec<Conversation>> {
        let response = self
            .request(reqwest::Method::GET, Self::conversations_path(), session)?
            .send()
            .await
            .map_err(map_request_error)?;
        let list: ConversationList = decode_json_response(response).await?;
        Ok(list.conversations)
    }

    async fn fetch_messages(
        &self,
        session: &Session,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let path = Self::conversation_path(conversation_id, since);
        debug!("GET {}", path);
        let response = self
            .request(reqwest::Method::GET, &path, session)?
            .send()
            .await
            .map_err(map_request_error)?;
        let page: MessagesPage = decode_json_response(response).await?;
        Ok(page.messages)
    }

    async fn send_message(
        &self,
        session: &Session,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse> {
        let response = self
            .request(reqwest::Method::POST, Self::messages_path(), session)?
            .json(request)
            .send()
            .await
            .map_err(map_request_error)?;
        decode_json_response(response).await
    }
}

fn normalize_base_url(base_url: &str) -> Result<String> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidUrl("base url is empty".to_string()));
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(ChatError::InvalidUrl(trimmed.to_string()));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

fn map_request_error(error: reqwest::Error) -> ChatError {
    if error.is_timeout() {
        ChatError::Timeout(error.to_string())
    } else {
        ChatError::Network(error.to_string())
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<String>,
}

fn parse_error_message(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.error)
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(body).trim().to_string();
            if text.is_empty() {
                "<empty>".to_string()
            } else {
                text
            }
        })
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    let bytes = response.bytes().await.map_err(map_request_error)?;

    if !status.is_success() {
        return Err(ChatError::Http {
            status: status.as_u16(),
            body: parse_error_message(&bytes),
        });
    }

    serde_json::from_slice::<T>(&bytes).map_err(|e| ChatError::Decode(e.to_string()))
}

// ─── Engine-facing client ────────────────────────────────────────────────────

/// Wraps a backend with the current session and a bounded timeout. A missing
/// credential short-circuits before any I/O; an elapsed timeout becomes `ChatError::Timeout`.
#[derive(Clone)]
pub struct ApiClient {
    backend: Arc<dyn ChatBackend>,
    session: SessionHandle,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(backend: Arc<dyn ChatBackend>, session: SessionHandle, timeout: Duration) -> Self {
        Self {
            backend,
            session,
            timeout,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Conversation directory: every conversation the current user can see
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let session = self.session.require()?;
        self.bounded("list conversations", self.backend.list_conversations(&session))
            .await
    }

    pub async fn fetch_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let session = self.session.require()?;
        self.bounded(
            "fetch messages",
            self.backend.fetch_messages(&session, conversation_id, since),
        )
        .await
    }

    pub async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        let session = self.session.require()?;
        self.bounded("send message", self.backend.send_message(&session, request))
            .await
    }

    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Timeout(format!(
                "{} exceeded {:?}",
                what, self.timeout
            ))),
        }
    }
}
