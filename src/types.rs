use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const META_PROVIDER: &str = "provider";
pub const META_PROVIDER_MESSAGE_ID: &str = "provider_message_id";
pub const META_PROVIDER_STATUS: &str = "provider_status";
pub const META_MESSAGE_ID: &str = "message_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Voice,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Voice => "voice",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    #[default]
    Transactional,
    Marketing,
}

/// A reply on its way out. `metadata` carries provider results back to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundReply {
    pub org_id: String,
    #[serde(default)]
    pub lead_id: String,
    #[serde(default)]
    pub conversation_id: String,
    pub to: String,
    #[serde(default)]
    pub from: String,
    pub body: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl OutboundReply {
    pub fn provider_message_id(&self) -> Option<&str> {
        self.metadata
            .get(META_PROVIDER_MESSAGE_ID)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn provider_status(&self) -> Option<&str> {
        self.metadata.get(META_PROVIDER_STATUS).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSms {
    pub message_sid: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStatusEvent {
    pub call_sid: String,
    pub from: String,
    pub to: String,
    pub call_status: String,
}

impl CallStatusEvent {
    pub fn is_missed(&self) -> bool {
        matches!(
            self.call_status.as_str(),
            "no-answer" | "busy" | "failed" | "canceled"
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatusEvent {
    pub message_sid: String,
    pub message_status: String,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub org_id: String,
    pub phone: String,
    pub source: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl TranscriptRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptRole::User => "user",
            TranscriptRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub role: TranscriptRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Payload handed to the reply worker through the job outbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationJob {
    pub org_id: String,
    pub lead_id: String,
    pub conversation_id: String,
    pub channel: String,
    pub from: String,
    pub to: String,
    pub message: String,
    pub clinic_name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
