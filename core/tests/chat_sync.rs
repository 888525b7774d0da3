/// Engine against the stub backend over real HTTP
use estatechat_core::stub_server::{start_stub_server, StubBackend};
use estatechat_core::types::{MessageStatus, User};
use estatechat_core::{ChatEngine, ChatError, Config, Session, SessionHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_backend() -> (Arc<StubBackend>, SocketAddr, JoinHandle<()>) {
    let backend = Arc::new(StubBackend::new());
    let (addr, handle) = start_stub_server(backend.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .expect("stub backend failed to start");
    (backend, addr, handle)
}

fn engine_for(addr: SocketAddr, user: &str) -> ChatEngine {
    let config = Config {
        api_base_url: format!("http://{}", addr),
        poll_interval: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    ChatEngine::with_http(config, SessionHandle::with_session(Session::new(user, user)))
        .expect("engine")
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(20)).await;
    }
}

fn contents(engine: &ChatEngine) -> Vec<String> {
    engine.messages().into_iter().map(|m| m.content).collect()
}

#[tokio::test]
async fn test_first_message_creates_conversation() {
    timeout(TEST_TIMEOUT, async {
        let (backend, addr, server) = start_backend().await;
        let inquirer = engine_for(addr, "u1");

        let resolved = inquirer
            .open_with_counterpart("p1", User::bare("o1"))
            .await
            .unwrap();
        assert_eq!(resolved, None);
        assert!(!inquirer.is_polling());

        let sent = inquirer.send_and_wait("Is it still available?").await.unwrap();

        let active = inquirer.active_conversation_id().expect("adopted conversation");
        assert_eq!(sent.conversation_id.as_deref(), Some(active.as_str()));
        assert_eq!(backend.conversation_count(), 1);
        assert!(inquirer.is_polling());

        let feed = inquirer.messages();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].id, sent.id);
        assert_eq!(feed[0].status, MessageStatus::Sent);

        // Reopening resolves the same conversation
        inquirer.close();
        let again = inquirer
            .open_with_counterpart("p1", User::bare("o1"))
            .await
            .unwrap();
        assert_eq!(again.as_deref(), Some(active.as_str()));
        assert_eq!(contents(&inquirer), vec!["Is it still available?"]);

        server.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_poll_picks_up_replies_without_duplicates() {
    timeout(TEST_TIMEOUT, async {
        let (_backend, addr, server) = start_backend().await;
        let inquirer = engine_for(addr, "u1");
        let owner = engine_for(addr, "o1");

        inquirer
            .open_with_counterpart("p1", User::bare("o1"))
            .await
            .unwrap();
        inquirer.send_and_wait("Hello").await.unwrap();

        let inbox = owner.owner_inbox("o1").unwrap().expect("owner view");
        let list = inbox.load_for_property("p1").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].other_user.as_ref().unwrap().id, "u1");
        assert_eq!(contents(&owner), vec!["Hello"]);

        owner.send_and_wait("Yes, it is").await.unwrap();
        owner.send_and_wait("When can you visit?").await.unwrap();

        wait_until("replies to reach the inquirer", || inquirer.messages().len() == 3).await;
        // several more ticks must not duplicate anything
        sleep(Duration::from_millis(200)).await;
        assert_eq!(
            contents(&inquirer),
            vec!["When can you visit?", "Yes, it is", "Hello"]
        );
        assert!(inquirer
            .messages()
            .iter()
            .all(|m| m.status == MessageStatus::Sent));

        server.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_owner_switches_between_inquirers() {
    timeout(TEST_TIMEOUT, async {
        let (_backend, addr, server) = start_backend().await;
        let u2 = engine_for(addr, "u2");
        let u3 = engine_for(addr, "u3");
        let owner = engine_for(addr, "o1");

        u2.open_with_counterpart("p1", User::bare("o1")).await.unwrap();
        u2.send_and_wait("from u2").await.unwrap();
        u3.open_with_counterpart("p1", User::bare("o1")).await.unwrap();
        u3.send_and_wait("from u3").await.unwrap();
        // different property, must not show up
        u3.open_with_counterpart("p2", User::bare("o1")).await.unwrap();
        u3.send_and_wait("about p2").await.unwrap();

        let inbox = owner.owner_inbox("o1").unwrap().unwrap();
        let list = inbox.load_for_property("p1").await.unwrap();
        let others: Vec<_> = list
            .iter()
            .map(|c| c.other_user.as_ref().unwrap().id.clone())
            .collect();
        assert_eq!(others, vec!["u3", "u2"]);
        assert_eq!(contents(&owner), vec!["from u3"]);

        let u2_conversation = list[1].id.clone();
        inbox.select_conversation(&u2_conversation).await.unwrap();
        assert_eq!(owner.active_conversation_id(), Some(u2_conversation));
        assert_eq!(contents(&owner), vec!["from u2"]);

        // replies go to the selected inquirer only
        owner.send_and_wait("hi u2").await.unwrap();
        wait_until("u2 to see the reply", || u2.messages().len() == 2).await;
        sleep(Duration::from_millis(150)).await;
        assert_eq!(contents(&u3), vec!["about p2"]);

        server.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_failed_send_can_be_retried() {
    timeout(TEST_TIMEOUT, async {
        let (backend, addr, server) = start_backend().await;
        let inquirer = engine_for(addr, "u1");
        inquirer
            .open_with_counterpart("p1", User::bare("o1"))
            .await
            .unwrap();
        let mut events = inquirer.subscribe();

        backend.fail_next_sends(1);
        let err = inquirer.send_and_wait("Second try").await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, ChatError::Http { status: 503, .. }));

        let failed = inquirer.failed_messages();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].content, "Second try");
        assert_eq!(backend.message_count(), 0);

        let mut saw_notice = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, estatechat_core::types::ChatEvent::MessageFailed { .. }) {
                saw_notice = true;
            }
        }
        assert!(saw_notice);

        let confirmed = inquirer.retry_and_wait(&failed[0].id).await.unwrap();
        assert!(inquirer.failed_messages().is_empty());
        assert_eq!(inquirer.status_of(&failed[0].id), None);
        assert_eq!(inquirer.status_of(&confirmed.id), Some(MessageStatus::Sent));
        assert_eq!(contents(&inquirer), vec!["Second try"]);
        assert_eq!(backend.message_count(), 1);

        server.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_missing_session_short_circuits() {
    timeout(TEST_TIMEOUT, async {
        let (_backend, addr, server) = start_backend().await;
        let config = Config {
            api_base_url: format!("http://{}", addr),
            ..Default::default()
        };
        let engine = ChatEngine::with_http(config, SessionHandle::empty()).unwrap();

        let result = engine.open_with_counterpart("p1", User::bare("o1")).await;
        assert!(matches!(result, Err(ChatError::AuthenticationMissing)));
        assert!(engine.messages().is_empty());

        server.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_backend_unreachable_degrades_to_new_chat() {
    timeout(TEST_TIMEOUT, async {
        let (_backend, addr, server) = start_backend().await;
        server.abort();
        sleep(Duration::from_millis(50)).await;

        let inquirer = engine_for(addr, "u1");
        // resolver failure reads as "no conversation yet"
        let resolved = inquirer
            .open_with_counterpart("p1", User::bare("o1"))
            .await
            .unwrap();
        assert_eq!(resolved, None);

        let err = inquirer.send_and_wait("anyone there?").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(inquirer.failed_messages().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_stub_rejects_unauthenticated_and_unknown_routes() {
    timeout(TEST_TIMEOUT, async {
        let (_backend, addr, server) = start_backend().await;
        let http = reqwest::Client::new();

        let anonymous = http
            .get(format!("http://{}/conversations", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(anonymous.status().as_u16(), 401);
        let body: serde_json::Value = anonymous.json().await.unwrap();
        assert_eq!(body["error"], "not authenticated");

        let unknown = http
            .get(format!("http://{}/listings", addr))
            .bearer_auth("u1")
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status().as_u16(), 404);

        let bad_cursor = http
            .get(format!("http://{}/conversations/c1?since=yesterday", addr))
            .bearer_auth("u1")
            .send()
            .await
            .unwrap();
        assert_eq!(bad_cursor.status().as_u16(), 400);

        server.abort();
    })
    .await
    .expect("test timed out");
}
