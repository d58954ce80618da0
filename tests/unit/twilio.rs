use clinic_sms::channels::twilio::{
    compute_signature, parse_form, parse_inbound_sms, parse_status_callback, validate_signature,
    TwilioSender,
};
use clinic_sms::channels::RetryPolicy;
use clinic_sms::config::TwilioConfig;
use clinic_sms::error::SendError;
use clinic_sms::messenger::ReplyMessenger;
use clinic_sms::types::OutboundReply;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "twilio_auth_token";
const URL: &str = "https://sms.example.com/webhooks/twilio/sms";

fn params() -> Vec<(String, String)> {
    vec![
        ("MessageSid".to_string(), "SM0001".to_string()),
        ("From".to_string(), "+15555550100".to_string()),
        ("To".to_string(), "+15550001111".to_string()),
        ("Body".to_string(), "Hi".to_string()),
    ]
}

fn flip_last_char(value: &str) -> String {
    let mut chars: Vec<char> = value.chars().collect();
    if let Some(last) = chars.last_mut() {
        *last = if *last == 'x' { 'y' } else { 'x' };
    }
    chars.into_iter().collect()
}

#[test]
fn test_signature_round_trip_validates() {
    let sig = compute_signature(SECRET, URL, &params());
    assert!(validate_signature(SECRET, URL, &params(), &sig));
}

#[test]
fn test_signature_order_independent() {
    let sig = compute_signature(SECRET, URL, &params());
    let mut shuffled = params();
    shuffled.reverse();
    assert!(validate_signature(SECRET, URL, &shuffled, &sig));
}

#[test]
fn test_signature_rejects_tampered_payload() {
    let sig = compute_signature(SECRET, URL, &params());
    let mut tampered = params();
    tampered[3].1 = "Hj".to_string();
    assert!(!validate_signature(SECRET, URL, &tampered, &sig));
}

#[test]
fn test_signature_rejects_changed_url() {
    let sig = compute_signature(SECRET, URL, &params());
    assert!(!validate_signature(SECRET, &flip_last_char(URL), &params(), &sig));
    assert!(!validate_signature(
        SECRET,
        "http://sms.example.com/webhooks/twilio/sms",
        &params(),
        &sig
    ));
}

#[test]
fn test_signature_rejects_changed_secret() {
    let sig = compute_signature(SECRET, URL, &params());
    assert!(!validate_signature(&flip_last_char(SECRET), URL, &params(), &sig));
}

#[test]
fn test_signature_rejects_garbage() {
    assert!(!validate_signature(SECRET, URL, &params(), ""));
    assert!(!validate_signature(SECRET, URL, &params(), "not base64!!"));
    assert!(!validate_signature(SECRET, URL, &params(), "AAAA"));
}

#[test]
fn test_parse_form_and_media() {
    let body = b"MessageSid=SM9&From=%2B15555550100&To=%2B15550001111&Body=Photo+attached&NumMedia=2&MediaUrl0=https%3A%2F%2Fm.test%2F0&MediaUrl1=https%3A%2F%2Fm.test%2F1";
    let params = parse_form(body).unwrap();
    let sms = parse_inbound_sms(&params).unwrap();
    assert_eq!(sms.from, "+15555550100");
    assert_eq!(sms.body, "Photo attached");
    assert_eq!(sms.media_urls, vec!["https://m.test/0", "https://m.test/1"]);
}

#[test]
fn test_parse_inbound_allows_empty_body() {
    let params = parse_form(b"MessageSid=SM9&From=%2B15555550100&To=%2B15550001111&Body=&NumMedia=0").unwrap();
    let sms = parse_inbound_sms(&params).unwrap();
    assert!(sms.body.is_empty());
}

#[test]
fn test_parse_inbound_missing_sid() {
    let params = parse_form(b"From=%2B15555550100&To=%2B15550001111&Body=Hi").unwrap();
    assert!(parse_inbound_sms(&params).is_err());
}

#[test]
fn test_parse_status_callback_legacy_fields() {
    let params = parse_form(b"SmsSid=SM7&SmsStatus=Undelivered&ErrorCode=30003").unwrap();
    let event = parse_status_callback(&params).unwrap();
    assert_eq!(event.message_sid, "SM7");
    assert_eq!(event.message_status, "undelivered");
    assert_eq!(event.error_code.as_deref(), Some("30003"));
}

fn sender(server: &MockServer) -> TwilioSender {
    let cfg = TwilioConfig {
        account_sid: Some("AC123".to_string()),
        auth_token: Some("token".to_string()),
        from_number: Some("+15550001111".to_string()),
        api_base: server.uri(),
    };
    TwilioSender::from_config(reqwest::Client::new(), &cfg)
        .unwrap()
        .with_retry_policy(RetryPolicy {
            attempts: 3,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        })
}

fn reply() -> OutboundReply {
    OutboundReply {
        org_id: "org-1".to_string(),
        to: "+15555550100".to_string(),
        body: "Thanks for reaching out!".to_string(),
        ..OutboundReply::default()
    }
}

#[tokio::test]
async fn test_sender_retries_server_error_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
        .and(header_exists("authorization"))
        .and(body_string_contains("From=%2B15550001111"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"sid": "SM42", "status": "queued"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut reply = reply();
    sender(&server).send_reply(&mut reply).await.unwrap();
    assert_eq!(reply.provider_message_id(), Some("SM42"));
    assert_eq!(reply.provider_status(), Some("queued"));
    assert_eq!(reply.metadata.get("provider").map(String::as_str), Some("twilio"));
}

#[tokio::test]
async fn test_sender_does_not_retry_client_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid To"))
        .expect(1)
        .mount(&server)
        .await;

    let mut reply = reply();
    let err = sender(&server).send_reply(&mut reply).await.unwrap_err();
    assert!(matches!(err, SendError::Permanent { status: 400, .. }));
    assert!(!err.is_transient());
    assert!(reply.provider_message_id().is_none());
}

#[tokio::test]
async fn test_sender_gives_up_after_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let mut reply = reply();
    let err = sender(&server).send_reply(&mut reply).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_sender_rejects_empty_body_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let mut reply = OutboundReply {
        body: "   ".to_string(),
        ..reply()
    };
    let err = sender(&server).send_reply(&mut reply).await.unwrap_err();
    assert!(matches!(err, SendError::Invalid(_)));
}
