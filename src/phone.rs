use crate::types::Channel;
use uuid::Uuid;

pub fn sanitize_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Strips everything but digits and prefixes `+`. Empty input stays empty.
pub fn normalize_e164(raw: &str) -> String {
    let digits = sanitize_digits(raw);
    if digits.is_empty() {
        return String::new();
    }
    format!("+{digits}")
}

pub fn lead_id(org_id: &str, phone: &str) -> String {
    format!("{}:{}", org_id, sanitize_digits(phone))
}

pub fn conversation_id(org_id: &str, phone: &str, channel: Channel) -> String {
    format!("{}:{}:{}", channel.as_str(), org_id, sanitize_digits(phone))
}

/// Stable transcript id for a provider message so redeliveries append once.
pub fn transcript_message_id(provider: &str, provider_message_id: &str) -> String {
    let name = format!("{provider}:{provider_message_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}
