use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bridge_config::Config;
use bridge_contracts::DedupeRecord;
use bridge_kernel::{
    dedupe_key, has_marker, normalize_text, parse_provider_webhook, strip_markers, MARKER,
};
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg)?;
    Ok(Router::new()
        .route("/health", get(health))
        .route("/webhook/chatwoot", post(chatwoot_webhook))
        .route("/webhook/unipile", post(unipile_webhook))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    cfg: Config,
    chatwoot: ChatwootClient,
    unipile: UnipileClient,
    store: Arc<StoreBackend>,
}

impl AppState {
    fn new(cfg: Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.http.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        let retry = RetryPolicy::from_config(&cfg.http);

        let store = match cfg.store.kind.as_str() {
            "sqlite" => {
                let path = cfg
                    .store
                    .sqlite_path
                    .clone()
                    .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
                StoreBackend::Sqlite(Mutex::new(open_sqlite(&path)?))
            }
            "supabase" => {
                let base_url = cfg
                    .store
                    .supabase_url
                    .clone()
                    .ok_or_else(|| "store.supabase_url is required for supabase store".to_string())?;
                let api_key = cfg
                    .store
                    .supabase_key
                    .clone()
                    .ok_or_else(|| "store.supabase_key is required for supabase store".to_string())?;
                StoreBackend::Supabase(SupabaseClient::new(
                    base_url,
                    api_key,
                    client.clone(),
                    retry.clone(),
                ))
            }
            _ => StoreBackend::Memory(Mutex::new(HashMap::new())),
        };

        Ok(Self {
            chatwoot: ChatwootClient::new(&cfg.chatwoot, client.clone(), retry.clone()),
            unipile: UnipileClient::new(&cfg.unipile, client, retry),
            store: Arc::new(store),
            cfg,
        })
    }
}

type WebhookResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn chatwoot_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    verify_secret(&state.cfg, &headers)?;
    let signature = header_value(&headers, "x-signature").to_string();

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            let mut record = event_record("chatwoot", "error");
            record.insert("error".into(), json!(format!("invalid_json: {err}")));
            record.insert(
                "payload".into(),
                json!(truncate_chars(&String::from_utf8_lossy(&body), 1000)),
            );
            record.insert("signature".into(), json!(signature));
            record_event(&state, record).await;
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"code": "invalid_json", "message": "invalid json"}})),
            ));
        }
    };

    let event = payload.get("event").and_then(Value::as_str);
    let message_type = payload.get("message_type").and_then(Value::as_str);
    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    if event != Some("message_created") || message_type != Some("outgoing") {
        let mut record = event_record("chatwoot", "ignored_event");
        record.insert("payload".into(), payload);
        record.insert("signature".into(), json!(signature));
        record_event(&state, record).await;
        return Ok(Json(json!({"status": "ignored"})));
    }

    // A marker means this outgoing message is the bridge's own mirror of a
    // provider-side message; relaying it would loop.
    if has_marker(&content) {
        let mut record = event_record("chatwoot", "ignored_marker");
        record.insert("payload".into(), payload);
        record.insert("signature".into(), json!(signature));
        record_event(&state, record).await;
        return Ok(Json(json!({"status": "ignored_marker"})));
    }

    let chat_id = payload
        .pointer("/conversation/meta/sender/custom_attributes/chat_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(chat_id) = chat_id else {
        let mut record = event_record("chatwoot", "error");
        record.insert("error".into(), json!("missing_chat_id"));
        record.insert("payload".into(), payload);
        record.insert("signature".into(), json!(signature));
        record_event(&state, record).await;
        return Ok(Json(json!({"status": "missing_chat_id"})));
    };

    let normalized_text = normalize_text(&content);
    let key = dedupe_key(&chat_id, &normalized_text);
    let text_to_send = format!("{MARKER}{}", strip_markers(&content));

    match state.unipile.send_message(&chat_id, &text_to_send).await {
        Ok(response) => {
            if let Some(key) = &key {
                let record = DedupeRecord {
                    dedupe_key: key.clone(),
                    chat_id: chat_id.clone(),
                    normalized_text: normalized_text.clone(),
                    expires_at: Utc::now()
                        + chrono::Duration::seconds(state.cfg.dedupe.ttl_seconds as i64),
                };
                if let Err(err) = state.store.register_outbound(record).await {
                    let mut record = event_record("chatwoot", "error");
                    record.insert("error".into(), json!(format!("dedupe_upsert_failed: {err}")));
                    record.insert("chat_id".into(), json!(chat_id));
                    record.insert("dedupe_key".into(), json!(key));
                    record.insert("normalized_text".into(), json!(normalized_text));
                    record.insert("signature".into(), json!(signature));
                    record_event(&state, record).await;
                }
            }
            let mut record = event_record("chatwoot", "sent_to_unipile");
            record.insert("chat_id".into(), json!(chat_id));
            record.insert("dedupe_key".into(), json!(key));
            record.insert("normalized_text".into(), json!(normalized_text));
            record.insert("payload".into(), payload);
            record.insert("signature".into(), json!(signature));
            record.insert("response".into(), response);
            record_event(&state, record).await;
            Ok(Json(json!({"status": "sent"})))
        }
        Err(err) => {
            let mut record = event_record("chatwoot", "error");
            record.insert("error".into(), json!(format!("unipile_send_failed: {err}")));
            record.insert("chat_id".into(), json!(chat_id));
            record.insert("dedupe_key".into(), json!(key));
            record.insert("normalized_text".into(), json!(normalized_text));
            record.insert("payload".into(), payload);
            record.insert("signature".into(), json!(signature));
            record_event(&state, record).await;
            Ok(Json(json!({"status": "error"})))
        }
    }
}

async fn unipile_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    verify_secret(&state.cfg, &headers)?;
    let signature = header_value(&headers, "x-signature").to_string();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let parsed = parse_provider_webhook(&body, content_type);
    let parse_mode = parsed.parse_mode.as_str();

    let Some(chat_id) = parsed.chat_id.clone() else {
        let mut record = event_record("unipile", "error");
        record.insert("error".into(), json!("missing_chat_id"));
        record.insert("payload".into(), parsed.raw.clone());
        record.insert("signature".into(), json!(signature));
        record.insert("parse_mode".into(), json!(parse_mode));
        record_event(&state, record).await;
        return Ok(Json(json!({"status": "missing_chat_id"})));
    };

    let Some(is_sender) = parsed.is_sender else {
        let mut record = event_record("unipile", "error");
        record.insert("error".into(), json!("missing_is_sender"));
        record.insert("chat_id".into(), json!(chat_id));
        record.insert("payload".into(), parsed.raw.clone());
        record.insert("signature".into(), json!(signature));
        record.insert("parse_mode".into(), json!(parse_mode));
        record_event(&state, record).await;
        return Ok(Json(json!({"status": "missing_is_sender"})));
    };

    let message = parsed.message.clone().unwrap_or_default();

    let mut normalized_text = None;
    let mut key = None;
    if is_sender {
        let normalized = normalize_text(&message);
        key = dedupe_key(&chat_id, &normalized);

        let deduped = match &key {
            Some(key) => match state.store.is_echo(key, Utc::now()).await {
                Ok(hit) => hit,
                Err(err) => {
                    // Fail open: an unreachable store must not block traffic.
                    let mut record = event_record("unipile", "error");
                    record.insert("error".into(), json!(format!("dedupe_check_failed: {err}")));
                    record.insert("chat_id".into(), json!(chat_id));
                    record.insert("dedupe_key".into(), json!(key));
                    record.insert("normalized_text".into(), json!(normalized));
                    record.insert("payload".into(), parsed.raw.clone());
                    record.insert("signature".into(), json!(signature));
                    record.insert("parse_mode".into(), json!(parse_mode));
                    record_event(&state, record).await;
                    false
                }
            },
            None => false,
        };

        if deduped {
            let mut record = event_record("unipile", "blocked_echo");
            record.insert("chat_id".into(), json!(chat_id));
            record.insert("dedupe_key".into(), json!(key));
            record.insert("normalized_text".into(), json!(normalized));
            record.insert("payload".into(), parsed.raw.clone());
            record.insert("signature".into(), json!(signature));
            record.insert("parse_mode".into(), json!(parse_mode));
            record_event(&state, record).await;
            return Ok(Json(json!({"status": "blocked_echo"})));
        }
        normalized_text = Some(normalized);
    }

    let attendee_id = parsed.attendee_id.clone().unwrap_or_else(|| chat_id.clone());
    let attendee_name = parsed
        .attendee_name
        .clone()
        .unwrap_or_else(|| attendee_id.clone());
    let email = format!("{attendee_id}@gmail.com");

    let conversation_id = match resolve_conversation(&state, &attendee_name, &email, &chat_id).await
    {
        Ok(conversation_id) => conversation_id,
        Err(err) => {
            let mut record = event_record("unipile", "error");
            record.insert("error".into(), json!(format!("chatwoot_contact_failed: {err}")));
            record.insert("chat_id".into(), json!(chat_id));
            record.insert("dedupe_key".into(), json!(key));
            record.insert("normalized_text".into(), json!(normalized_text));
            record.insert("payload".into(), parsed.raw.clone());
            record.insert("signature".into(), json!(signature));
            record.insert("parse_mode".into(), json!(parse_mode));
            record_event(&state, record).await;
            return Ok(Json(json!({"status": "error"})));
        }
    };

    if !is_sender {
        return match state
            .chatwoot
            .create_message(&conversation_id, "incoming", &message)
            .await
        {
            Ok(response) => {
                let mut record = event_record("unipile", "created_incoming");
                record.insert("chat_id".into(), json!(chat_id));
                record.insert("is_sender".into(), json!(is_sender));
                record.insert("message_id".into(), json!(parsed.message_id));
                record.insert(
                    "provider_message_id".into(),
                    json!(parsed.provider_message_id),
                );
                record.insert("payload".into(), parsed.raw.clone());
                record.insert("signature".into(), json!(signature));
                record.insert("parse_mode".into(), json!(parse_mode));
                record.insert("response".into(), response);
                record_event(&state, record).await;
                Ok(Json(json!({"status": "created_incoming"})))
            }
            Err(err) => {
                let mut record = event_record("unipile", "error");
                record.insert("error".into(), json!(format!("chatwoot_incoming_failed: {err}")));
                record.insert("chat_id".into(), json!(chat_id));
                record.insert("payload".into(), parsed.raw.clone());
                record.insert("signature".into(), json!(signature));
                record.insert("parse_mode".into(), json!(parse_mode));
                record_event(&state, record).await;
                Ok(Json(json!({"status": "error"})))
            }
        };
    }

    // The provider reported one of our own messages that is not a tracked
    // echo: mirror it into the helpdesk, marker re-applied.
    let outgoing_content = format!("{MARKER}{}", strip_markers(&message));
    match state
        .chatwoot
        .create_message(&conversation_id, "outgoing", &outgoing_content)
        .await
    {
        Ok(response) => {
            let mut record = event_record("unipile", "created_outgoing");
            record.insert("chat_id".into(), json!(chat_id));
            record.insert("is_sender".into(), json!(is_sender));
            record.insert("message_id".into(), json!(parsed.message_id));
            record.insert(
                "provider_message_id".into(),
                json!(parsed.provider_message_id),
            );
            record.insert("dedupe_key".into(), json!(key));
            record.insert("normalized_text".into(), json!(normalized_text));
            record.insert("payload".into(), parsed.raw.clone());
            record.insert("signature".into(), json!(signature));
            record.insert("parse_mode".into(), json!(parse_mode));
            record.insert("response".into(), response);
            record_event(&state, record).await;
            Ok(Json(json!({"status": "created_outgoing"})))
        }
        Err(err) => {
            let mut record = event_record("unipile", "error");
            record.insert("error".into(), json!(format!("chatwoot_outgoing_failed: {err}")));
            record.insert("chat_id".into(), json!(chat_id));
            record.insert("dedupe_key".into(), json!(key));
            record.insert("normalized_text".into(), json!(normalized_text));
            record.insert("payload".into(), parsed.raw.clone());
            record.insert("signature".into(), json!(signature));
            record.insert("parse_mode".into(), json!(parse_mode));
            record_event(&state, record).await;
            Ok(Json(json!({"status": "error"})))
        }
    }
}

async fn resolve_conversation(
    state: &AppState,
    name: &str,
    email: &str,
    chat_id: &str,
) -> Result<String, String> {
    let contact = state.chatwoot.get_or_create_contact(name, email, chat_id).await?;
    let conversation = state.chatwoot.get_or_create_conversation(&contact).await?;
    value_to_string(conversation.get("id"))
        .ok_or_else(|| "chatwoot conversation is missing an id".to_string())
}

fn verify_secret(cfg: &Config, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(secret) = cfg.webhook.secret.as_deref().filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    if header_value(headers, "x-webhook-secret") != secret {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {"code": "invalid_webhook_secret", "message": "invalid webhook secret"}
            })),
        ));
    }
    Ok(())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

fn event_record(source: &str, decision: &str) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert(
        "record_id".into(),
        json!(format!("evt_{}", uuid::Uuid::new_v4().as_simple())),
    );
    record.insert("ts".into(), json!(Utc::now().to_rfc3339()));
    record.insert("source".into(), json!(source));
    record.insert("decision".into(), json!(decision));
    record
}

async fn record_event(state: &AppState, record: Map<String, Value>) {
    let event = Value::Object(record);
    tracing::info!(target: "bridge::event", "{event}");
    if let Err(err) = state.store.append_event(&event).await {
        tracing::warn!("event log append failed: {err}");
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn value_to_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Error)]
enum HttpError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("retries exhausted on status {0}")]
    RetryableStatus(StatusCode),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("invalid json in response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no request attempts were made")]
    NoAttempts,
}

#[derive(Clone)]
struct RetryPolicy {
    retries: u32,
    backoff: Duration,
    statuses: Vec<u16>,
}

impl RetryPolicy {
    fn from_config(http: &bridge_config::Http) -> Self {
        Self {
            retries: http.retries,
            backoff: Duration::from_millis(http.retry_backoff_ms),
            statuses: http.retry_statuses.clone(),
        }
    }
}

async fn request_with_retries<F>(retry: &RetryPolicy, build: F) -> Result<reqwest::Response, HttpError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last = None;
    for attempt in 0..=retry.retries {
        match build().send().await {
            Ok(response) => {
                if !retry.statuses.contains(&response.status().as_u16()) {
                    return Ok(response);
                }
                last = Some(HttpError::RetryableStatus(response.status()));
            }
            Err(err) => last = Some(HttpError::Transport(err)),
        }
        if attempt < retry.retries && retry.backoff > Duration::ZERO {
            sleep(retry.backoff * 2u32.saturating_pow(attempt)).await;
        }
    }
    Err(last.unwrap_or(HttpError::NoAttempts))
}

async fn read_json(response: reqwest::Response) -> Result<Value, HttpError> {
    let status = response.status();
    if !status.is_success() {
        return Err(HttpError::Status(status));
    }
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

#[derive(Clone)]
struct ChatwootClient {
    base_url: String,
    account_id: String,
    inbox_id: String,
    api_token: String,
    http: Client,
    retry: RetryPolicy,
}

impl ChatwootClient {
    fn new(cfg: &bridge_config::Chatwoot, http: Client, retry: RetryPolicy) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            account_id: cfg.account_id.clone(),
            inbox_id: cfg.inbox_id.clone(),
            api_token: cfg.api_token.clone(),
            http,
            retry,
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, HttpError> {
        let url = format!("{}{path}", self.base_url);
        let response = request_with_retries(&self.retry, || {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("api_access_token", &self.api_token);
            if let Some(body) = &body {
                request = request.json(body);
            }
            request
        })
        .await?;
        read_json(response).await
    }

    async fn filter_contact_by_email(&self, email: &str) -> Result<Option<Value>, String> {
        let body = json!({
            "payload": [{
                "attribute_key": "email",
                "filter_operator": "equal_to",
                "values": [email],
            }]
        });
        let data = self
            .request(
                Method::POST,
                &format!("/api/v1/accounts/{}/contacts/filter", self.account_id),
                Some(body),
            )
            .await
            .map_err(|e| e.to_string())?;
        if let Some(contacts) = data.get("payload").and_then(Value::as_array) {
            return Ok(contacts.first().filter(|c| c.is_object()).cloned());
        }
        Ok(extract_contact(&data))
    }

    async fn create_contact(&self, name: &str, email: &str, chat_id: &str) -> Result<Value, String> {
        let body = json!({
            "inbox_id": self.inbox_id,
            "name": name,
            "email": email,
            "custom_attributes": {"chat_id": chat_id},
        });
        let data = self
            .request(
                Method::POST,
                &format!("/api/v1/accounts/{}/contacts", self.account_id),
                Some(body),
            )
            .await
            .map_err(|e| e.to_string())?;
        extract_contact(&data)
            .ok_or_else(|| "chatwoot contact creation returned empty payload".to_string())
    }

    async fn contact_conversations(&self, contact_id: &str) -> Result<Vec<Value>, String> {
        let data = self
            .request(
                Method::GET,
                &format!(
                    "/api/v1/accounts/{}/contacts/{contact_id}/conversations",
                    self.account_id
                ),
                None,
            )
            .await
            .map_err(|e| e.to_string())?;
        let conversations = match &data {
            Value::Object(_) => data.get("payload").cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        Ok(conversations.as_array().cloned().unwrap_or_default())
    }

    async fn create_conversation(&self, contact_id: &str, source_id: &str) -> Result<Value, String> {
        let body = json!({
            "source_id": source_id,
            "inbox_id": self.inbox_id,
            "contact_id": contact_id,
            "status": "open",
        });
        self.request(
            Method::POST,
            &format!("/api/v1/accounts/{}/conversations", self.account_id),
            Some(body),
        )
        .await
        .map_err(|e| e.to_string())
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        message_type: &str,
        content: &str,
    ) -> Result<Value, String> {
        let body = json!({"content": content, "message_type": message_type});
        self.request(
            Method::POST,
            &format!(
                "/api/v1/accounts/{}/conversations/{conversation_id}/messages",
                self.account_id
            ),
            Some(body),
        )
        .await
        .map_err(|e| e.to_string())
    }

    fn pick_source_id(&self, contact: &Value) -> Option<String> {
        let inboxes = contact.get("contact_inboxes")?.as_array()?;
        for inbox in inboxes {
            if value_to_string(inbox.get("inbox_id")).as_deref() == Some(self.inbox_id.as_str()) {
                return value_to_string(inbox.get("source_id"));
            }
        }
        inboxes
            .first()
            .and_then(|inbox| value_to_string(inbox.get("source_id")))
    }

    fn pick_conversation_by_inbox<'a>(&self, conversations: &'a [Value]) -> Option<&'a Value> {
        conversations
            .iter()
            .find(|conversation| {
                value_to_string(conversation.get("inbox_id")).as_deref()
                    == Some(self.inbox_id.as_str())
            })
            .or_else(|| conversations.first())
    }

    async fn get_or_create_contact(
        &self,
        name: &str,
        email: &str,
        chat_id: &str,
    ) -> Result<Value, String> {
        if let Some(contact) = self.filter_contact_by_email(email).await? {
            return Ok(contact);
        }
        let name = if name.is_empty() { email } else { name };
        self.create_contact(name, email, chat_id).await
    }

    async fn get_or_create_conversation(&self, contact: &Value) -> Result<Value, String> {
        let contact_id = value_to_string(contact.get("id"))
            .ok_or_else(|| "chatwoot contact is missing an id".to_string())?;
        let conversations = self.contact_conversations(&contact_id).await?;
        if let Some(conversation) = self.pick_conversation_by_inbox(&conversations) {
            return Ok(conversation.clone());
        }
        let source_id = self
            .pick_source_id(contact)
            .ok_or_else(|| "missing source_id for contact".to_string())?;
        self.create_conversation(&contact_id, &source_id).await
    }
}

// Chatwoot wraps contact payloads inconsistently across endpoints:
// payload.contact, payload[0], a bare contact, or a top-level contact key.
fn extract_contact(data: &Value) -> Option<Value> {
    if !data.is_object() {
        return None;
    }
    if let Some(payload) = data.get("payload") {
        if let Some(contact) = payload.get("contact").filter(|c| c.is_object()) {
            return Some(contact.clone());
        }
        if let Some(first) = payload.as_array().and_then(|contacts| contacts.first()) {
            return first.is_object().then(|| first.clone());
        }
    }
    if let Some(contact) = data.get("contact").filter(|c| c.is_object()) {
        return Some(contact.clone());
    }
    Some(data.clone())
}

#[derive(Clone)]
struct UnipileClient {
    base_url: String,
    api_key: String,
    http: Client,
    retry: RetryPolicy,
}

impl UnipileClient {
    fn new(cfg: &bridge_config::Unipile, http: Client, retry: RetryPolicy) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            http,
            retry,
        }
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<Value, String> {
        let url = format!("{}/chats/{chat_id}/messages", self.base_url);
        let text = text.to_string();
        let response = request_with_retries(&self.retry, || {
            self.http
                .post(&url)
                .header("X-API-KEY", &self.api_key)
                .header(header::ACCEPT, "application/json")
                .multipart(reqwest::multipart::Form::new().text("text", text.clone()))
        })
        .await
        .map_err(|e| e.to_string())?;
        read_json(response).await.map_err(|e| e.to_string())
    }
}

#[derive(Clone)]
struct SupabaseClient {
    base_url: String,
    api_key: String,
    http: Client,
    retry: RetryPolicy,
}

impl SupabaseClient {
    fn new(base_url: String, api_key: String, http: Client, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
            retry,
        }
    }

    async fn upsert_dedupe(&self, record: &DedupeRecord) -> Result<(), String> {
        let url = format!("{}/rest/v1/dedupe_cache", self.base_url);
        let body = json!([{
            "dedupe_key": record.dedupe_key,
            "chat_id": record.chat_id,
            "normalized_text": record.normalized_text,
            "expires_at": record.expires_at.to_rfc3339(),
        }]);
        let response = request_with_retries(&self.retry, || {
            self.http
                .post(&url)
                .query(&[("on_conflict", "dedupe_key")])
                .header("apikey", &self.api_key)
                .bearer_auth(&self.api_key)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&body)
        })
        .await
        .map_err(|e| e.to_string())?;
        read_json(response).await.map(|_| ()).map_err(|e| e.to_string())
    }

    async fn is_deduped(&self, dedupe_key: &str, now: DateTime<Utc>) -> Result<bool, String> {
        let url = format!("{}/rest/v1/dedupe_cache", self.base_url);
        let response = request_with_retries(&self.retry, || {
            self.http
                .get(&url)
                .query(&[
                    ("dedupe_key", format!("eq.{dedupe_key}")),
                    ("expires_at", format!("gt.{}", now.to_rfc3339())),
                    ("select", "dedupe_key,expires_at".to_string()),
                ])
                .header("apikey", &self.api_key)
                .bearer_auth(&self.api_key)
        })
        .await
        .map_err(|e| e.to_string())?;
        let data = read_json(response).await.map_err(|e| e.to_string())?;
        Ok(data.as_array().map(|rows| !rows.is_empty()).unwrap_or(false))
    }

    async fn log_event(&self, event: &Value) -> Result<(), String> {
        let url = format!("{}/rest/v1/event_logs", self.base_url);
        let body = json!([event]);
        let response = request_with_retries(&self.retry, || {
            self.http
                .post(&url)
                .header("apikey", &self.api_key)
                .bearer_auth(&self.api_key)
                .header("Prefer", "return=minimal")
                .json(&body)
        })
        .await
        .map_err(|e| e.to_string())?;
        read_json(response).await.map(|_| ()).map_err(|e| e.to_string())
    }
}

enum StoreBackend {
    Memory(Mutex<HashMap<String, DedupeRecord>>),
    Sqlite(Mutex<Connection>),
    Supabase(SupabaseClient),
}

impl StoreBackend {
    async fn register_outbound(&self, record: DedupeRecord) -> Result<(), String> {
        match self {
            StoreBackend::Memory(map) => {
                map.lock().await.insert(record.dedupe_key.clone(), record);
                Ok(())
            }
            StoreBackend::Sqlite(conn) => {
                let conn = conn.lock().await;
                conn.execute(
                    "
                    INSERT INTO dedupe_cache (dedupe_key, chat_id, normalized_text, expires_at_ms)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(dedupe_key) DO UPDATE SET
                        chat_id=excluded.chat_id,
                        normalized_text=excluded.normalized_text,
                        expires_at_ms=excluded.expires_at_ms
                    ",
                    params![
                        record.dedupe_key,
                        record.chat_id,
                        record.normalized_text,
                        record.expires_at.timestamp_millis()
                    ],
                )
                .map_err(|e| e.to_string())?;
                Ok(())
            }
            StoreBackend::Supabase(client) => client.upsert_dedupe(&record).await,
        }
    }

    async fn is_echo(&self, dedupe_key: &str, now: DateTime<Utc>) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(map) => Ok(map
                .lock()
                .await
                .get(dedupe_key)
                .map(|record| record.expires_at > now)
                .unwrap_or(false)),
            StoreBackend::Sqlite(conn) => {
                let conn = conn.lock().await;
                let hit: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM dedupe_cache WHERE dedupe_key = ?1 AND expires_at_ms > ?2",
                        params![dedupe_key, now.timestamp_millis()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| e.to_string())?;
                Ok(hit.is_some())
            }
            StoreBackend::Supabase(client) => client.is_deduped(dedupe_key, now).await,
        }
    }

    async fn append_event(&self, event: &Value) -> Result<(), String> {
        match self {
            StoreBackend::Memory(_) => Ok(()),
            StoreBackend::Sqlite(conn) => {
                let conn = conn.lock().await;
                conn.execute(
                    "INSERT INTO event_logs (record_json) VALUES (?1)",
                    params![event.to_string()],
                )
                .map_err(|e| e.to_string())?;
                Ok(())
            }
            StoreBackend::Supabase(client) => client.log_event(event).await,
        }
    }
}

fn open_sqlite(path: &str) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| e.to_string())?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS dedupe_cache (
            dedupe_key TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            normalized_text TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS event_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_json TEXT NOT NULL
        );
        ",
    )
    .map_err(|e| e.to_string())?;
    Ok(conn)
}
