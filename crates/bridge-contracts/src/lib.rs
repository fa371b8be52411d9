use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    StrictJson,
    RepairedJson,
    RegexFallback,
}

impl ParseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseMode::StrictJson => "strict_json",
            ParseMode::RepairedJson => "repaired_json",
            ParseMode::RegexFallback => "regex_fallback",
        }
    }
}

/// Normalized form of an inbound provider webhook. Every field except
/// `parse_mode` and `raw` is best-effort: absence is data, not failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedEvent {
    pub chat_id: Option<String>,
    pub message: Option<String>,
    pub is_sender: Option<bool>,
    pub attendee_name: Option<String>,
    pub attendee_id: Option<String>,
    pub message_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub event: Option<String>,
    pub timestamp: Option<String>,
    pub parse_mode: ParseMode,
    /// Original parsed structure, or the truncated raw body in fallback
    /// mode. Kept for audit logging, never consulted by decision logic.
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub dedupe_key: String,
    pub chat_id: String,
    pub normalized_text: String,
    pub expires_at: DateTime<Utc>,
}
