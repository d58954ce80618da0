use super::{resolve_sender, send_with_retry, RetryPolicy};
use crate::config::TelnyxConfig;
use crate::error::{SendError, WebhookError};
use crate::messenger::ReplyMessenger;
use crate::types::{
    DeliveryStatusEvent, InboundSms, OutboundReply, META_PROVIDER, META_PROVIDER_MESSAGE_ID,
    META_PROVIDER_STATUS,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

pub const TIMESTAMP_HEADER: &str = "Telnyx-Timestamp";
pub const SIGNATURE_HEADER: &str = "Telnyx-Signature";
pub const EVENT_MESSAGE_RECEIVED: &str = "message.received";
pub const EVENT_DELIVERY_STATUS: &str = "message.delivery_status";

type HmacSha256 = Hmac<Sha256>;

pub struct TelnyxSender {
    http: Client,
    api_key: String,
    messaging_profile_id: Option<String>,
    default_from: Option<String>,
    api_base: String,
    retry: RetryPolicy,
}

impl TelnyxSender {
    pub fn from_config(http: Client, cfg: &TelnyxConfig) -> Result<Self, SendError> {
        if !cfg.is_configured() {
            return Err(SendError::NotConfigured(
                "telnyx api key is required".to_string(),
            ));
        }
        Ok(Self {
            http,
            api_key: cfg.api_key.clone().unwrap_or_default(),
            messaging_profile_id: cfg
                .messaging_profile_id
                .clone()
                .filter(|v| !v.trim().is_empty()),
            default_from: cfg.from_number.clone(),
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn delivery_status(data: &Value) -> Option<&str> {
    data.get("to")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|to| to.get("status"))
        .or_else(|| data.get("status"))
        .and_then(|v| v.as_str())
}

#[async_trait]
impl ReplyMessenger for TelnyxSender {
    async fn send_reply(&self, reply: &mut OutboundReply) -> Result<(), SendError> {
        let from = resolve_sender(reply, self.default_from.as_deref())?.to_string();
        let url = format!("{}/v2/messages", self.api_base);
        let mut payload = json!({
            "from": from,
            "to": reply.to,
            "text": reply.body,
        });
        if let Some(profile) = self.messaging_profile_id.as_ref() {
            payload["messaging_profile_id"] = json!(profile);
        }

        let value = send_with_retry("telnyx", &self.retry, || {
            self.http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&payload)
        })
        .await?;

        reply
            .metadata
            .insert(META_PROVIDER.to_string(), "telnyx".to_string());
        if let Some(data) = value.get("data") {
            if let Some(id) = data.get("id").and_then(|v| v.as_str()) {
                reply
                    .metadata
                    .insert(META_PROVIDER_MESSAGE_ID.to_string(), id.to_string());
            }
            if let Some(status) = delivery_status(data) {
                reply
                    .metadata
                    .insert(META_PROVIDER_STATUS.to_string(), status.to_string());
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "telnyx"
    }
}

// ---- webhooks ----

/// hex(HMAC-SHA256(secret, "<timestamp>.<body>")).
pub fn compute_signature(secret: &str, timestamp: &str, payload: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(timestamp.trim().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks the signature and rejects timestamps further than `max_skew_seconds` from `now`.
pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    signature: &str,
    payload: &[u8],
    now: DateTime<Utc>,
    max_skew_seconds: i64,
) -> Result<(), WebhookError> {
    let timestamp = timestamp.trim();
    if timestamp.is_empty() {
        return Err(WebhookError::Authentication("missing signature timestamp".to_string()));
    }
    let sent_at: i64 = timestamp
        .parse()
        .map_err(|_| WebhookError::Authentication("invalid signature timestamp".to_string()))?;
    if (now.timestamp() - sent_at).abs() > max_skew_seconds {
        return Err(WebhookError::Authentication("signature timestamp outside allowed skew".to_string()));
    }
    let signature = signature.trim().to_ascii_lowercase();
    if signature.is_empty() {
        return Err(WebhookError::Authentication("missing signature".to_string()));
    }
    let expected = hex::decode(&signature)
        .map_err(|_| WebhookError::Authentication("invalid signature".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::Authentication("invalid signature".to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::Authentication("invalid signature".to_string()))
}

/// A webhook event normalized from either the `{"data": {...}}` envelope or a
/// bare message record.
#[derive(Debug, Clone)]
pub struct TelnyxEvent {
    pub id: String,
    pub event_type: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub payload: Value,
}

#[derive(Deserialize)]
struct Envelope {
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    id: String,
    #[serde(default)]
    event_type: String,
    occurred_at: Option<String>,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct FlatRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    record_type: String,
    #[serde(default)]
    direction: String,
    received_at: Option<String>,
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_event(body: &[u8]) -> Result<TelnyxEvent, WebhookError> {
    let invalid = |err: serde_json::Error| WebhookError::Validation(format!("invalid payload: {err}"));
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(body) {
        if !envelope.data.id.is_empty() {
            let data = envelope.data;
            return Ok(TelnyxEvent {
                id: data.id,
                event_type: data.event_type,
                occurred_at: parse_time(data.occurred_at.as_deref()),
                payload: data.payload,
            });
        }
    }

    let payload: Value = serde_json::from_slice(body).map_err(invalid)?;
    let record: FlatRecord = serde_json::from_value(payload.clone()).map_err(invalid)?;
    if record.id.is_empty() {
        return Err(WebhookError::Validation("missing event id".to_string()));
    }
    let event_type = match (record.record_type.as_str(), record.direction.as_str()) {
        ("message", "inbound") => EVENT_MESSAGE_RECEIVED,
        ("message", "outbound") => EVENT_DELIVERY_STATUS,
        _ => "",
    };
    Ok(TelnyxEvent {
        id: record.id,
        event_type: event_type.to_string(),
        occurred_at: parse_time(record.received_at.as_deref()),
        payload,
    })
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn parse_inbound_message(payload: &Value) -> Result<InboundSms, WebhookError> {
    let missing = |what: &str| WebhookError::Validation(format!("missing {what}"));
    let id = str_at(payload, "/id").ok_or_else(|| missing("message id"))?;
    let from = str_at(payload, "/from/phone_number")
        .or_else(|| str_at(payload, "/from_number"))
        .ok_or_else(|| missing("from number"))?;
    let to = str_at(payload, "/to/0/phone_number")
        .or_else(|| str_at(payload, "/to_number"))
        .ok_or_else(|| missing("to number"))?;
    let media_urls = payload
        .get("media_urls")
        .and_then(|v| v.as_array())
        .map(|urls| {
            urls.iter()
                .filter_map(|u| u.as_str().or_else(|| u.get("url").and_then(|v| v.as_str())))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(InboundSms {
        message_sid: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        body: str_at(payload, "/text").unwrap_or_default().to_string(),
        media_urls,
    })
}

pub fn parse_delivery_status(payload: &Value) -> Result<DeliveryStatusEvent, WebhookError> {
    let message_id = str_at(payload, "/message_id")
        .or_else(|| str_at(payload, "/id"))
        .ok_or_else(|| WebhookError::Validation("missing message id".to_string()))?;
    let status = str_at(payload, "/status")
        .or_else(|| str_at(payload, "/to/0/status"))
        .ok_or_else(|| WebhookError::Validation("missing status".to_string()))?;
    Ok(DeliveryStatusEvent {
        message_sid: message_id.to_string(),
        message_status: status.to_lowercase(),
        error_code: str_at(payload, "/errors/0/code").map(str::to_string),
    })
}

/// Hosted messaging order lifecycle update.
#[derive(Debug, Clone, Deserialize)]
pub struct HostedOrderEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clinic_id: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub last_error: String,
}

pub fn parse_hosted_order(payload: &Value) -> Result<HostedOrderEvent, WebhookError> {
    serde_json::from_value(payload.clone())
        .map_err(|err| WebhookError::Validation(format!("invalid hosted order payload: {err}")))
}
