use clinic_sms::phone::{conversation_id, lead_id, normalize_e164, sanitize_digits, transcript_message_id};
use clinic_sms::types::Channel;

#[test]
fn test_sanitize_digits() {
    assert_eq!(sanitize_digits("+1 (555) 555-0100"), "15555550100");
    assert_eq!(sanitize_digits("abc"), "");
}

#[test]
fn test_normalize_e164_variants() {
    assert_eq!(normalize_e164("+15555550100"), "+15555550100");
    assert_eq!(normalize_e164("1-555-555-0100"), "+15555550100");
    assert_eq!(normalize_e164(""), "");
}

#[test]
fn test_ids_are_format_insensitive() {
    let a = lead_id("org-1", "+1 (555) 555-0100");
    let b = lead_id("org-1", "15555550100");
    assert_eq!(a, b);
    assert_eq!(a, "org-1:15555550100");

    let c = conversation_id("org-1", "+1 555 555 0100", Channel::Sms);
    let d = conversation_id("org-1", "+15555550100", Channel::Sms);
    assert_eq!(c, d);
    assert_eq!(c, "sms:org-1:15555550100");
}

#[test]
fn test_ids_scoped_by_org_and_channel() {
    assert_ne!(lead_id("org-1", "+15555550100"), lead_id("org-2", "+15555550100"));
    assert_ne!(
        conversation_id("org-1", "+15555550100", Channel::Sms),
        conversation_id("org-1", "+15555550100", Channel::Voice)
    );
}

#[test]
fn test_transcript_message_id_scoped_by_provider() {
    let twilio = transcript_message_id("twilio", "SM1");
    assert_eq!(twilio, transcript_message_id("twilio", "SM1"));
    assert_ne!(twilio, transcript_message_id("telnyx", "SM1"));
    assert!(uuid::Uuid::parse_str(&twilio).is_ok());
}
