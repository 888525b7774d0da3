/// Authenticated session supplied by the identity provider
use crate::error::{ChatError, Result};
use crate::types::UserId;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
}

impl Session {
    pub fn new(user_id: impl Into<UserId>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

/// Shared slot the identity provider writes into. The engine only reads it, and
/// treats an empty slot (or an empty token) as "not authenticated".
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<Option<Session>>>,
}

impl SessionHandle {
    /// A handle with no session yet (credentials still loading)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        let handle = Self::default();
        handle.set(session);
        handle
    }

    pub fn set(&self, session: Session) {
        *self.inner.write() = Some(session);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    pub fn current(&self) -> Option<Session> {
        self.inner
            .read()
            .as_ref()
            .filter(|s| !s.token.trim().is_empty() && !s.user_id.is_empty())
            .cloned()
    }

    pub fn require(&self) -> Result<Session> {
        self.current().ok_or(ChatError::AuthenticationMissing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_without_session() {
        let handle = SessionHandle::empty();
        assert!(matches!(handle.require(), Err(ChatError::AuthenticationMissing)));
    }

    #[test]
    fn test_session_appears_later() {
        let handle = SessionHandle::empty();
        let reader = handle.clone();

        handle.set(Session::new("u1", "tok"));
        assert_eq!(reader.require().unwrap().user_id, "u1");

        handle.clear();
        assert!(reader.current().is_none());
    }

    #[test]
    fn test_blank_token_counts_as_missing() {
        let handle = SessionHandle::with_session(Session::new("u1", "  "));
        assert!(handle.current().is_none());
    }
}
