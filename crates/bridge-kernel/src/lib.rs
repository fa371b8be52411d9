use std::collections::HashSet;
use std::sync::OnceLock;

use bridge_contracts::{ParseMode, ParsedEvent};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const MARKER: &str = "\u{2063}\u{2063}\u{2063}";
pub const LEGACY_MARKER: &str = "\u{200B}LI_ECHO\u{200B}";

const MARKERS: [&str; 2] = [LEGACY_MARKER, MARKER];

const FALLBACK_RAW_LIMIT: usize = 1000;

fn space_runs_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

fn leading_wrap_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^\s*\{\s*"\{"#).expect("valid leading wrap regex"))
}

fn trailing_wrap_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\}"\s*\}\s*$"#).expect("valid trailing wrap regex"))
}

// Upstream occasionally splices a chat identifier value into two adjacent
// quoted segments: "provider_chat_id":"abc":"def",
fn chat_id_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""provider_chat_id"\s*:\s*"([^"]+)"\s*:\s*"([^"]*)"\s*,"#)
            .expect("valid chat id repair regex")
    })
}

// Same splice on profile occupations, with an empty segment wedged in the
// middle: "occupation":"Sen":"","ior",
fn occupation_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""occupation"\s*:\s*"([^"]*?)"\s*:\s*""\s*,\s*"([^"]*?)"\s*,"#)
            .expect("valid occupation repair regex")
    })
}

pub fn strip_markers(text: &str) -> String {
    let mut cleaned = text.to_string();
    for marker in MARKERS {
        cleaned = cleaned.replace(marker, "");
    }
    cleaned
}

pub fn has_marker(text: &str) -> bool {
    MARKERS.iter().any(|marker| text.contains(marker))
}

pub fn normalize_text(text: &str) -> String {
    let cleaned = strip_markers(text);
    space_runs_re().replace_all(cleaned.trim(), " ").into_owned()
}

/// Composite fingerprint for echo suppression. Returns `None` for empty
/// normalized text: blank content must never share a dedupe key.
pub fn dedupe_key(chat_id: &str, normalized_text: &str) -> Option<String> {
    if normalized_text.is_empty() {
        return None;
    }
    Some(format!(
        "{chat_id}|{}",
        sha256_hex(normalized_text.as_bytes())
    ))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Best-effort recovery of a provider webhook body into a [`ParsedEvent`].
/// Never fails: strict JSON first, then targeted repairs of known upstream
/// corruption, then regex extraction over the raw body as the terminal tier.
pub fn parse_provider_webhook(body: &[u8], _content_type: Option<&str>) -> ParsedEvent {
    // The declared content type is advisory only; recovery sniffs the body.
    let decoded = String::from_utf8_lossy(body);
    let raw = decoded.trim();

    let mut candidates: Vec<String> = Vec::new();
    if !raw.is_empty() {
        candidates.push(raw.to_string());
        // Providers sometimes wrap the JSON document inside a form field
        // name or value.
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            let key = key.trim();
            let value = value.trim();
            if key.starts_with('{') {
                candidates.push(key.to_string());
            }
            if value.starts_with('{') {
                candidates.push(value.to_string());
            }
        }
    }

    let mut seen = HashSet::new();
    for candidate in candidates {
        if !seen.insert(candidate.clone()) {
            continue;
        }
        let unwrapped = unwrap_body_string(&candidate);
        let (parsed, parse_mode) = match serde_json::from_str::<Value>(&unwrapped) {
            Ok(value) => (value, ParseMode::StrictJson),
            Err(_) => {
                let repaired = repair_known_breaks(&unwrapped);
                match serde_json::from_str::<Value>(&repaired) {
                    Ok(value) => (value, ParseMode::RepairedJson),
                    Err(_) => continue,
                }
            }
        };
        if parsed.is_object() {
            return extract_from_value(parsed, parse_mode);
        }
    }

    fallback_extract(raw)
}

fn unwrap_body_string(raw: &str) -> String {
    let mut out = raw.trim().to_string();
    if out.len() >= 2 && out.starts_with('"') && out.ends_with('"') {
        out = out[1..out.len() - 1].to_string();
    }
    out = leading_wrap_re().replace(&out, "{").into_owned();
    out = trailing_wrap_re().replace(&out, "}").into_owned();
    out = out.replace("\\\"", "\"");
    out.trim().to_string()
}

fn repair_known_breaks(raw: &str) -> String {
    let fixed = chat_id_split_re().replace_all(raw, r#""provider_chat_id":"${1}${2}","#);
    occupation_split_re()
        .replace_all(&fixed, r#""occupation":"${1}${2}","#)
        .into_owned()
}

fn extract_from_value(parsed: Value, parse_mode: ParseMode) -> ParsedEvent {
    let payload = match parsed.get("data") {
        Some(data @ Value::Object(_)) => data,
        _ => &parsed,
    };

    let (attendee_name, attendee_id) = payload
        .get("attendees")
        .and_then(Value::as_array)
        .and_then(|attendees| attendees.first())
        .map(|attendee| {
            (
                string_field(attendee.get("attendee_name")),
                string_field(attendee.get("attendee_id")),
            )
        })
        .unwrap_or((None, None));

    let chat_id = string_field(payload.get("chat_id"));
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .map(unescape_message);
    let is_sender = coerce_bool(payload.get("is_sender"));
    let message_id = string_field(payload.get("message_id"));
    let provider_message_id = string_field(payload.get("provider_message_id"));
    let timestamp =
        string_field(payload.get("timestamp")).or_else(|| string_field(parsed.get("timestamp")));
    let event = string_field(parsed.get("event"));

    ParsedEvent {
        chat_id,
        message,
        is_sender,
        attendee_name,
        attendee_id,
        message_id,
        provider_message_id,
        event,
        timestamp,
        parse_mode,
        raw: parsed,
    }
}

fn fallback_extract(raw: &str) -> ParsedEvent {
    ParsedEvent {
        chat_id: regex_pick(raw, "chat_id"),
        message: regex_pick(raw, "message").map(|m| unescape_message(&m)),
        is_sender: regex_pick_bool(raw, "is_sender"),
        attendee_name: regex_pick(raw, "attendee_name"),
        attendee_id: regex_pick(raw, "attendee_id"),
        message_id: regex_pick(raw, "message_id"),
        provider_message_id: regex_pick(raw, "provider_message_id"),
        event: regex_pick(raw, "event"),
        timestamp: regex_pick(raw, "timestamp"),
        parse_mode: ParseMode::RegexFallback,
        raw: Value::String(raw.chars().take(FALLBACK_RAW_LIMIT).collect()),
    }
}

fn regex_pick(raw: &str, key: &str) -> Option<String> {
    let pattern = format!(r#"(?i)"{}"\s*:\s*"([^"]*)""#, regex::escape(key));
    Regex::new(&pattern)
        .ok()?
        .captures(raw)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

fn regex_pick_bool(raw: &str, key: &str) -> Option<bool> {
    let pattern = format!(r#"(?i)"{}"\s*:\s*(true|false|1|0)"#, regex::escape(key));
    Regex::new(&pattern)
        .ok()?
        .captures(raw)
        .and_then(|captures| captures.get(1))
        .map(|m| matches!(m.as_str().to_ascii_lowercase().as_str(), "true" | "1"))
}

fn unescape_message(value: &str) -> String {
    value.replace("\\n", "\n").replace("\\\"", "\"")
}

fn string_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
