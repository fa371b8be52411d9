use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bridge_config::{Chatwoot, Config, Dedupe, Http, Log, Server, Store, Unipile, Webhook};
use bridge_kernel::{LEGACY_MARKER, MARKER};
use bridge_server::build_app;
use mockito::Matcher;
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn test_config(chatwoot_url: &str, unipile_url: &str) -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        chatwoot: Chatwoot {
            base_url: chatwoot_url.to_string(),
            account_id: "1".to_string(),
            inbox_id: "1".to_string(),
            api_token: "token".to_string(),
        },
        unipile: Unipile {
            base_url: unipile_url.to_string(),
            api_key: "key".to_string(),
        },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
            supabase_url: None,
            supabase_key: None,
        },
        webhook: Webhook { secret: None },
        dedupe: Dedupe { ttl_seconds: 120 },
        http: Http {
            timeout_ms: 2000,
            retries: 0,
            retry_backoff_ms: 0,
            retry_statuses: vec![429, 500, 502, 503, 504],
        },
        log: Log {
            level: "info".to_string(),
        },
    }
}

fn chatwoot_event(content: &str) -> Value {
    json!({
        "event": "message_created",
        "message_type": "outgoing",
        "content": content,
        "conversation": {
            "meta": {"sender": {"custom_attributes": {"chat_id": "chat-1"}}}
        }
    })
}

async fn post_webhook(app: Router, path: &str, body: String) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload: Value = serde_json::from_slice(&bytes).unwrap();
    (status, payload)
}

#[tokio::test]
async fn health_ok() {
    let app = build_app(test_config("http://127.0.0.1:9", "http://127.0.0.1:9"))
        .await
        .unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn wrong_webhook_secret_is_rejected() {
    let mut cfg = test_config("http://127.0.0.1:9", "http://127.0.0.1:9");
    cfg.webhook.secret = Some("s3cret".to_string());
    let app = build_app(cfg).await.unwrap();

    for path in ["/webhook/chatwoot", "/webhook/unipile"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .header("x-webhook-secret", "wrong")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn correct_webhook_secret_is_accepted() {
    let mut cfg = test_config("http://127.0.0.1:9", "http://127.0.0.1:9");
    cfg.webhook.secret = Some("s3cret".to_string());
    let app = build_app(cfg).await.unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/chatwoot")
                .header("content-type", "application/json")
                .header("x-webhook-secret", "s3cret")
                .body(Body::from(json!({"event": "conversation_updated"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn chatwoot_invalid_json_is_rejected() {
    let app = build_app(test_config("http://127.0.0.1:9", "http://127.0.0.1:9"))
        .await
        .unwrap();
    let (status, payload) =
        post_webhook(app, "/webhook/chatwoot", "{not json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["code"], "invalid_json");
}

#[tokio::test]
async fn chatwoot_ignores_non_outgoing_events() {
    let app = build_app(test_config("http://127.0.0.1:9", "http://127.0.0.1:9"))
        .await
        .unwrap();

    let mut event = chatwoot_event("hello");
    event["message_type"] = json!("incoming");
    let (status, payload) = post_webhook(app, "/webhook/chatwoot", event.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "ignored");
}

#[tokio::test]
async fn chatwoot_ignores_marker_tagged_content() {
    let app = build_app(test_config("http://127.0.0.1:9", "http://127.0.0.1:9"))
        .await
        .unwrap();

    let event = chatwoot_event(&format!("{MARKER}mirrored text"));
    let (status, payload) = post_webhook(app, "/webhook/chatwoot", event.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "ignored_marker");
}

#[tokio::test]
async fn chatwoot_without_chat_id_is_acknowledged() {
    let app = build_app(test_config("http://127.0.0.1:9", "http://127.0.0.1:9"))
        .await
        .unwrap();

    let event = json!({
        "event": "message_created",
        "message_type": "outgoing",
        "content": "hello",
        "conversation": {"meta": {"sender": {"custom_attributes": {}}}}
    });
    let (status, payload) = post_webhook(app, "/webhook/chatwoot", event.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "missing_chat_id");
}

#[tokio::test]
async fn relayed_message_is_blocked_when_echoed_back() {
    let mut unipile = mockito::Server::new_async().await;
    let send = unipile
        .mock("POST", "/chats/chat-1/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"object": "MessageSent"}).to_string())
        .expect(1)
        .create_async()
        .await;

    let app = build_app(test_config("http://127.0.0.1:9", &unipile.url()))
        .await
        .unwrap();

    let event = chatwoot_event("hello   from agent");
    let (status, payload) =
        post_webhook(app.clone(), "/webhook/chatwoot", event.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "sent");

    // The provider echoes the relayed message back, legacy-marked and with
    // collapsed whitespace; the fingerprint must still match.
    let echo = json!({
        "chat_id": "chat-1",
        "message": format!("{LEGACY_MARKER}hello from agent"),
        "is_sender": true
    });
    let (status, payload) = post_webhook(app, "/webhook/unipile", echo.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "blocked_echo");

    send.assert_async().await;
}

#[tokio::test]
async fn unipile_garbage_body_is_acknowledged_as_missing_chat_id() {
    let app = build_app(test_config("http://127.0.0.1:9", "http://127.0.0.1:9"))
        .await
        .unwrap();
    let (status, payload) = post_webhook(
        app,
        "/webhook/unipile",
        "no identifiers here".to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "missing_chat_id");
}

#[tokio::test]
async fn unipile_without_direction_flag_is_acknowledged() {
    let app = build_app(test_config("http://127.0.0.1:9", "http://127.0.0.1:9"))
        .await
        .unwrap();
    let body = json!({"chat_id": "chat-1", "message": "hi"}).to_string();
    let (status, payload) = post_webhook(app, "/webhook/unipile", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "missing_is_sender");
}

#[tokio::test]
async fn remote_message_creates_incoming_helpdesk_message() {
    let mut chatwoot = mockito::Server::new_async().await;
    let filter = chatwoot
        .mock("POST", "/api/v1/accounts/1/contacts/filter")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"payload": []}).to_string())
        .create_async()
        .await;
    let create_contact = chatwoot
        .mock("POST", "/api/v1/accounts/1/contacts")
        .match_body(Matcher::Json(json!({
            "inbox_id": "1",
            "name": "Customer",
            "email": "att-9@gmail.com",
            "custom_attributes": {"chat_id": "chat-9"}
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "payload": {
                    "contact": {
                        "id": 7,
                        "contact_inboxes": [{"inbox_id": 1, "source_id": "src-9"}]
                    }
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    let conversations = chatwoot
        .mock("GET", "/api/v1/accounts/1/contacts/7/conversations")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"payload": []}).to_string())
        .create_async()
        .await;
    let create_conversation = chatwoot
        .mock("POST", "/api/v1/accounts/1/conversations")
        .match_body(Matcher::Json(json!({
            "source_id": "src-9",
            "inbox_id": "1",
            "contact_id": "7",
            "status": "open"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"id": 42, "inbox_id": 1}).to_string())
        .create_async()
        .await;
    let create_message = chatwoot
        .mock("POST", "/api/v1/accounts/1/conversations/42/messages")
        .match_body(Matcher::Json(json!({
            "content": "hi from customer",
            "message_type": "incoming"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"id": 99}).to_string())
        .create_async()
        .await;

    let app = build_app(test_config(&chatwoot.url(), "http://127.0.0.1:9"))
        .await
        .unwrap();

    let body = json!({
        "chat_id": "chat-9",
        "message": "hi from customer",
        "is_sender": false,
        "attendees": [{"attendee_id": "att-9", "attendee_name": "Customer"}]
    });
    let (status, payload) = post_webhook(app, "/webhook/unipile", body.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "created_incoming");

    filter.assert_async().await;
    create_contact.assert_async().await;
    conversations.assert_async().await;
    create_conversation.assert_async().await;
    create_message.assert_async().await;
}

#[tokio::test]
async fn untracked_self_message_is_mirrored_with_marker() {
    let mut chatwoot = mockito::Server::new_async().await;
    let _filter = chatwoot
        .mock("POST", "/api/v1/accounts/1/contacts/filter")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "payload": [{
                    "id": 7,
                    "contact_inboxes": [{"inbox_id": 1, "source_id": "src-1"}]
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;
    let _conversations = chatwoot
        .mock("GET", "/api/v1/accounts/1/contacts/7/conversations")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"payload": [{"id": 42, "inbox_id": 1}]}).to_string())
        .create_async()
        .await;
    let create_message = chatwoot
        .mock("POST", "/api/v1/accounts/1/conversations/42/messages")
        .match_body(Matcher::Json(json!({
            "content": format!("{MARKER}fresh text"),
            "message_type": "outgoing"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"id": 99}).to_string())
        .create_async()
        .await;

    let app = build_app(test_config(&chatwoot.url(), "http://127.0.0.1:9"))
        .await
        .unwrap();

    let body = json!({
        "chat_id": "chat-1",
        "message": "fresh text",
        "is_sender": true
    });
    let (status, payload) = post_webhook(app, "/webhook/unipile", body.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "created_outgoing");

    create_message.assert_async().await;
}

#[tokio::test]
async fn unreachable_store_fails_open() {
    let mut chatwoot = mockito::Server::new_async().await;
    let _filter = chatwoot
        .mock("POST", "/api/v1/accounts/1/contacts/filter")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "payload": [{
                    "id": 7,
                    "contact_inboxes": [{"inbox_id": 1, "source_id": "src-1"}]
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;
    let _conversations = chatwoot
        .mock("GET", "/api/v1/accounts/1/contacts/7/conversations")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"payload": [{"id": 42, "inbox_id": 1}]}).to_string())
        .create_async()
        .await;
    let _create_message = chatwoot
        .mock("POST", "/api/v1/accounts/1/conversations/42/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"id": 99}).to_string())
        .create_async()
        .await;

    let mut supabase = mockito::Server::new_async().await;
    let dedupe_lookup = supabase
        .mock("GET", "/rest/v1/dedupe_cache")
        .match_query(Matcher::Any)
        .with_status(500)
        .expect_at_least(1)
        .create_async()
        .await;
    let _event_log = supabase
        .mock("POST", "/rest/v1/event_logs")
        .match_query(Matcher::Any)
        .with_status(201)
        .expect_at_least(0)
        .create_async()
        .await;

    let mut cfg = test_config(&chatwoot.url(), "http://127.0.0.1:9");
    cfg.store.kind = "supabase".to_string();
    cfg.store.supabase_url = Some(supabase.url());
    cfg.store.supabase_key = Some("service-role".to_string());
    let app = build_app(cfg).await.unwrap();

    let body = json!({
        "chat_id": "chat-1",
        "message": "self sent while store is down",
        "is_sender": true
    });
    let (status, payload) = post_webhook(app, "/webhook/unipile", body.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "created_outgoing");

    dedupe_lookup.assert_async().await;
}

#[tokio::test]
async fn unipile_relay_failure_is_acknowledged_as_error() {
    let mut unipile = mockito::Server::new_async().await;
    let send = unipile
        .mock("POST", "/chats/chat-1/messages")
        .with_status(503)
        .expect_at_least(1)
        .create_async()
        .await;

    let app = build_app(test_config("http://127.0.0.1:9", &unipile.url()))
        .await
        .unwrap();

    let event = chatwoot_event("hello");
    let (status, payload) = post_webhook(app, "/webhook/chatwoot", event.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "error");

    send.assert_async().await;
}
