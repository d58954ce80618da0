use super::{resolve_sender, send_with_retry, RetryPolicy};
use crate::config::TwilioConfig;
use crate::error::{SendError, WebhookError};
use crate::messenger::ReplyMessenger;
use crate::types::{
    CallStatusEvent, DeliveryStatusEvent, InboundSms, OutboundReply, META_PROVIDER,
    META_PROVIDER_MESSAGE_ID, META_PROVIDER_STATUS,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha1::Sha1;

pub const SIGNATURE_HEADER: &str = "X-Twilio-Signature";
pub const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;
pub const REJECT_TWIML: &str =
    r#"<?xml version="1.0" encoding="UTF-8"?><Response><Reject reason="busy"/></Response>"#;

type HmacSha1 = Hmac<Sha1>;

fn signing_payload(url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut payload = String::from(url);
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }
    payload
}

/// base64(HMAC-SHA1(secret, url + sorted key/value pairs)).
pub fn compute_signature(secret: &str, url: &str, params: &[(String, String)]) -> String {
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(signing_payload(url, params).as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

pub fn validate_signature(
    secret: &str,
    url: &str,
    params: &[(String, String)],
    signature: &str,
) -> bool {
    let signature = signature.trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(expected) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signing_payload(url, params).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

pub fn parse_form(body: &[u8]) -> Result<Vec<(String, String)>, WebhookError> {
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(body)
        .map_err(|err| WebhookError::Validation(format!("malformed form body: {err}")))
}

fn form_value<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

fn required<'a>(params: &'a [(String, String)], key: &str) -> Result<&'a str, WebhookError> {
    form_value(params, key).ok_or_else(|| WebhookError::Validation(format!("missing {key}")))
}

pub fn parse_inbound_sms(params: &[(String, String)]) -> Result<InboundSms, WebhookError> {
    let num_media = form_value(params, "NumMedia")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let media_urls = (0..num_media)
        .filter_map(|i| form_value(params, &format!("MediaUrl{i}")).map(|s| s.to_string()))
        .collect();
    Ok(InboundSms {
        message_sid: required(params, "MessageSid")?.to_string(),
        from: required(params, "From")?.to_string(),
        to: required(params, "To")?.to_string(),
        // MMS without text arrives with an empty Body.
        body: params
            .iter()
            .find(|(k, _)| k == "Body")
            .map(|(_, v)| v.trim().to_string())
            .ok_or_else(|| WebhookError::Validation("missing Body".to_string()))?,
        media_urls,
    })
}

pub fn parse_call_status(params: &[(String, String)]) -> Result<CallStatusEvent, WebhookError> {
    Ok(CallStatusEvent {
        call_sid: required(params, "CallSid")?.to_string(),
        from: required(params, "From")?.to_string(),
        to: required(params, "To")?.to_string(),
        call_status: required(params, "CallStatus")?.to_lowercase(),
    })
}

pub fn parse_status_callback(
    params: &[(String, String)],
) -> Result<DeliveryStatusEvent, WebhookError> {
    let message_sid = form_value(params, "MessageSid")
        .or_else(|| form_value(params, "SmsSid"))
        .ok_or_else(|| WebhookError::Validation("missing MessageSid".to_string()))?;
    let message_status = form_value(params, "MessageStatus")
        .or_else(|| form_value(params, "SmsStatus"))
        .ok_or_else(|| WebhookError::Validation("missing MessageStatus".to_string()))?;
    Ok(DeliveryStatusEvent {
        message_sid: message_sid.to_string(),
        message_status: message_status.to_lowercase(),
        error_code: form_value(params, "ErrorCode").map(|s| s.to_string()),
    })
}

pub struct TwilioSender {
    http: Client,
    account_sid: String,
    auth_token: String,
    default_from: Option<String>,
    api_base: String,
    retry: RetryPolicy,
}

impl TwilioSender {
    pub fn from_config(http: Client, cfg: &TwilioConfig) -> Result<Self, SendError> {
        if !cfg.is_configured() {
            return Err(SendError::NotConfigured(
                "twilio account sid and auth token are required".to_string(),
            ));
        }
        Ok(Self {
            http,
            account_sid: cfg.account_sid.clone().unwrap_or_default(),
            auth_token: cfg.auth_token.clone().unwrap_or_default(),
            default_from: cfg.from_number.clone(),
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        )
    }
}

#[async_trait]
impl ReplyMessenger for TwilioSender {
    async fn send_reply(&self, reply: &mut OutboundReply) -> Result<(), SendError> {
        let from = resolve_sender(reply, self.default_from.as_deref())?.to_string();
        let url = self.messages_url();
        let form = [
            ("To", reply.to.as_str()),
            ("From", from.as_str()),
            ("Body", reply.body.as_str()),
        ];

        let value = send_with_retry("twilio", &self.retry, || {
            self.http
                .post(&url)
                .basic_auth(&self.account_sid, Some(&self.auth_token))
                .form(&form)
        })
        .await?;

        reply
            .metadata
            .insert(META_PROVIDER.to_string(), "twilio".to_string());
        if let Some(sid) = value.get("sid").and_then(|v| v.as_str()) {
            reply
                .metadata
                .insert(META_PROVIDER_MESSAGE_ID.to_string(), sid.to_string());
        }
        if let Some(status) = value.get("status").and_then(|v| v.as_str()) {
            reply
                .metadata
                .insert(META_PROVIDER_STATUS.to_string(), status.to_string());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "twilio"
    }
}
