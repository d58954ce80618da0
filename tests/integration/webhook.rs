use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use clinic_sms::channels::telnyx;
use clinic_sms::channels::twilio::{compute_signature, EMPTY_TWIML, REJECT_TWIML, SIGNATURE_HEADER};
use clinic_sms::config::{Config, OrgBinding};
use clinic_sms::db::{self, DbKind, MessageRecord};
use serde_json::{json, Value};
use clinic_sms::error::SendError;
use clinic_sms::messenger::ReplyMessenger;
use clinic_sms::outbox::{JobOptions, JobPublisher};
use clinic_sms::types::{ConversationJob, OutboundReply, META_PROVIDER_MESSAGE_ID};
use clinic_sms::{build_router, AppState};
use sqlx::AnyPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "test_auth_token";
const TELNYX_SECRET: &str = "telnyx_webhook_secret";
const BASE_URL: &str = "https://sms.example.com";
const CLINIC_NUMBER: &str = "+15550001111";
const PATIENT: &str = "+15555550100";

#[derive(Default)]
struct CountingMessenger {
    calls: AtomicUsize,
    sent: Mutex<Vec<OutboundReply>>,
    delay: Option<std::time::Duration>,
}

impl CountingMessenger {
    fn slow(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bodies(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|r| r.body.clone()).collect()
    }
}

#[async_trait]
impl ReplyMessenger for CountingMessenger {
    async fn send_reply(&self, reply: &mut OutboundReply) -> Result<(), SendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        reply
            .metadata
            .insert(META_PROVIDER_MESSAGE_ID.to_string(), format!("SMout{n}"));
        self.sent.lock().unwrap().push(reply.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

struct BrokenPublisher;

#[async_trait]
impl JobPublisher for BrokenPublisher {
    async fn enqueue_start(&self, _: &str, _: &ConversationJob, _: &JobOptions) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("queue unavailable"))
    }

    async fn enqueue_message(&self, _: &str, _: &ConversationJob, _: &JobOptions) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("queue unavailable"))
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.server.public_base_url = Some(BASE_URL.to_string());
    cfg.sms.webhook_secret = Some(SECRET.to_string());
    cfg.sms.telnyx.webhook_secret = Some(TELNYX_SECRET.to_string());
    cfg.orgs = vec![OrgBinding {
        org_id: "org-1".to_string(),
        numbers: vec![CLINIC_NUMBER.to_string()],
        clinic_name: Some("Glow Med Spa".to_string()),
        quiet_hours: None,
    }];
    cfg
}

struct Harness {
    state: AppState,
    app: Router,
    messenger: Arc<CountingMessenger>,
    _dir: TempDir,
}

async fn harness_with(config: Config) -> Harness {
    harness_with_provider(config, Arc::new(CountingMessenger::default())).await
}

async fn harness_with_provider(config: Config, messenger: Arc<CountingMessenger>) -> Harness {
    sqlx::any::install_default_drivers();
    let dir = TempDir::new().unwrap();
    let db_url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
    let pool = AnyPool::connect(&db_url).await.unwrap();
    db::init_db(&pool, DbKind::Sqlite).await.unwrap();

    let state = AppState::new(config, pool, DbKind::Sqlite, reqwest::Client::new())
        .unwrap()
        .with_provider(messenger.clone());
    let app = build_router(state.clone());
    Harness {
        state,
        app,
        messenger,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(test_config()).await
}

fn form(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn signed_request(path: &str, params: &[(String, String)], signature: Option<String>) -> Request<Body> {
    let url = format!("{BASE_URL}{path}");
    let signature = signature.unwrap_or_else(|| compute_signature(SECRET, &url, params));
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/x-www-form-urlencoded")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(serde_urlencoded::to_string(params).unwrap()))
        .unwrap()
}

fn sms(sid: &str, body: &str) -> Vec<(String, String)> {
    form(&[
        ("MessageSid", sid),
        ("From", PATIENT),
        ("To", CLINIC_NUMBER),
        ("Body", body),
        ("NumMedia", "0"),
    ])
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn count(pool: &AnyPool, sql: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(sql).fetch_one(pool).await.unwrap()
}

#[tokio::test]
async fn test_inbound_sms_end_to_end() {
    let h = harness().await;

    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &sms("SM0001", "Hi"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/xml"
    );
    assert_eq!(body_string(response).await, EMPTY_TWIML);

    let pool = &h.state.pool;
    assert_eq!(db::count_leads(pool, DbKind::Sqlite, "org-1", PATIENT).await.unwrap(), 1);

    let job = db::get_reply_job(pool, DbKind::Sqlite, "SM0001").await.unwrap().unwrap();
    assert_eq!(job.kind, "message");
    assert_eq!(job.payload["request"]["conversation_id"], "sms:org-1:15555550100");
    assert_eq!(job.payload["request"]["message"], "Hi");

    assert_eq!(h.messenger.calls(), 1);
    let ack = &h.messenger.bodies()[0];
    assert!(ack.contains("Glow Med Spa"));
    assert!(ack.ends_with(
        "\n\nThis is an automated assistant. For medical advice, please consult your provider."
    ));

    let inbound = db::get_message_by_provider_id(pool, DbKind::Sqlite, "SM0001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound.direction, "inbound");
    assert_eq!(inbound.clinic_id, "org-1");
    assert_eq!(inbound.from_number, PATIENT);
}

#[tokio::test]
async fn test_redelivery_is_ignored() {
    let h = harness().await;
    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(signed_request("/webhooks/twilio/sms", &sms("SM0002", "Hello"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let pool = &h.state.pool;
    assert_eq!(count(pool, "SELECT COUNT(1) FROM reply_jobs").await, 1);
    assert_eq!(
        count(pool, "SELECT COUNT(1) FROM messages WHERE direction = 'inbound'").await,
        1
    );
    assert_eq!(h.messenger.calls(), 1);
}

#[tokio::test]
async fn test_returning_sender_gets_no_second_disclaimer() {
    let h = harness().await;
    for (sid, text) in [("SM0003", "Hi"), ("SM0004", "Are you open Saturday?")] {
        let response = h
            .app
            .clone()
            .oneshot(signed_request("/webhooks/twilio/sms", &sms(sid, text), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let bodies = h.messenger.bodies();
    assert_eq!(bodies.len(), 2);
    assert!(bodies[0].ends_with("please consult your provider."));
    assert!(!bodies[1].contains("please consult your provider."));
}

#[tokio::test]
async fn test_card_number_redacted_before_storage() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(signed_request(
            "/webhooks/twilio/sms",
            &sms("SM0005", "my card is 4111 1111 1111 1111"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let pool = &h.state.pool;
    let job = db::get_reply_job(pool, DbKind::Sqlite, "SM0005").await.unwrap().unwrap();
    assert_eq!(job.payload["request"]["message"], "my card is [REDACTED_CARD_1111]");
    assert_eq!(job.payload["request"]["metadata"]["pan_redacted"], "true");
    let stored = db::get_message_by_provider_id(pool, DbKind::Sqlite, "SM0005")
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.body.contains("4111"));
    let transcript: String =
        sqlx::query_scalar("SELECT content FROM conversation_messages WHERE role = 'user' LIMIT 1")
            .fetch_one(pool)
            .await
            .unwrap();
    assert_eq!(transcript, "my card is [REDACTED_CARD_1111]");
}

#[tokio::test]
async fn test_bad_signature_rejected() {
    let h = harness().await;
    let params = sms("SM0006", "Hi");
    let forged = compute_signature("wrong_secret", &format!("{BASE_URL}/webhooks/twilio/sms"), &params);
    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &params, Some(forged)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(db::count_rows(&h.state.pool, "reply_jobs").await, 0);
    assert_eq!(h.messenger.calls(), 0);
}

#[tokio::test]
async fn test_missing_signature_rejected() {
    let h = harness().await;
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/twilio/sms")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(serde_urlencoded::to_string(sms("SM0007", "Hi")).unwrap()))
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_signature_skipped_when_configured() {
    let mut cfg = test_config();
    cfg.sms.skip_signature = true;
    let h = harness_with(cfg).await;
    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &sms("SM0008", "Hi"), Some("bogus".to_string())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_destination_rejected() {
    let h = harness().await;
    let params = form(&[
        ("MessageSid", "SM0009"),
        ("From", PATIENT),
        ("To", "+15559999999"),
        ("Body", "Hi"),
    ]);
    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &params, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(db::count_rows(&h.state.pool, "leads").await, 0);
}

#[tokio::test]
async fn test_missing_field_rejected() {
    let h = harness().await;
    let params = form(&[("MessageSid", "SM0010"), ("To", CLINIC_NUMBER), ("Body", "Hi")]);
    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &params, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stop_and_start_keywords() {
    let h = harness().await;
    let pool = &h.state.pool;

    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &sms("SM0011", "STOP"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(db::is_unsubscribed(pool, DbKind::Sqlite, "org-1", PATIENT).await.unwrap());
    assert!(db::get_reply_job(pool, DbKind::Sqlite, "SM0011").await.unwrap().is_none());
    assert!(db::has_provider_message(pool, DbKind::Sqlite, "SM0011").await.unwrap());
    assert_eq!(h.messenger.calls(), 1);
    assert!(h.messenger.bodies()[0].contains("unsubscribed"));

    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &sms("SM0012", "start"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!db::is_unsubscribed(pool, DbKind::Sqlite, "org-1", PATIENT).await.unwrap());
}

#[tokio::test]
async fn test_help_keyword_replies_without_job() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &sms("SM0013", "HELP"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(db::count_rows(&h.state.pool, "reply_jobs").await, 0);
    assert!(h.messenger.bodies()[0].contains("Reply STOP"));
}

#[tokio::test]
async fn test_enqueue_failure_returns_500_and_allows_redelivery() {
    let h = harness().await;
    let broken_state = h.state.clone().with_publisher(Arc::new(BrokenPublisher));
    let broken_app = build_router(broken_state);

    let response = broken_app
        .oneshot(signed_request("/webhooks/twilio/sms", &sms("SM0014", "Hi"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!db::has_provider_message(&h.state.pool, DbKind::Sqlite, "SM0014").await.unwrap());
    assert_eq!(h.messenger.calls(), 0);

    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &sms("SM0014", "Hi"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(db::get_reply_job(&h.state.pool, DbKind::Sqlite, "SM0014").await.unwrap().is_some());
}

fn call(sid: &str, status: &str) -> Vec<(String, String)> {
    form(&[
        ("CallSid", sid),
        ("From", PATIENT),
        ("To", CLINIC_NUMBER),
        ("CallStatus", status),
    ])
}

#[tokio::test]
async fn test_live_call_rejected_busy() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/voice", &call("CA0001", "ringing"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, REJECT_TWIML);
    assert_eq!(db::count_rows(&h.state.pool, "reply_jobs").await, 0);
}

#[tokio::test]
async fn test_missed_call_starts_conversation() {
    let h = harness().await;
    let pool = &h.state.pool;
    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(signed_request("/webhooks/twilio/voice", &call("CA0002", "no-answer"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, EMPTY_TWIML);
    }

    let job = db::get_reply_job(pool, DbKind::Sqlite, "CA0002").await.unwrap().unwrap();
    assert_eq!(job.kind, "start_conversation");
    assert_eq!(job.payload["request"]["channel"], "voice");
    assert_eq!(job.payload["request"]["conversation_id"], "sms:org-1:15555550100");
    let lead = sqlx::query_scalar::<_, String>("SELECT source FROM leads LIMIT 1")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(lead, "missed_call");
    assert_eq!(h.messenger.calls(), 1);
    assert!(h.messenger.bodies()[0].contains("missed your call"));
}

#[tokio::test]
async fn test_status_callback_updates_message() {
    let h = harness().await;
    let pool = &h.state.pool;
    let mut record = MessageRecord::new(
        "m1",
        "org-1",
        CLINIC_NUMBER,
        PATIENT,
        db::DIRECTION_OUTBOUND,
        "See you soon",
        db::STATUS_SENT,
    );
    record.provider_message_id = Some("SMstatus1".to_string());
    db::insert_message(pool, DbKind::Sqlite, &record).await.unwrap();

    let params = form(&[
        ("MessageSid", "SMstatus1"),
        ("MessageStatus", "undelivered"),
        ("ErrorCode", "30006"),
    ]);
    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/status", &params, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stored = db::get_message(pool, DbKind::Sqlite, "m1").await.unwrap().unwrap();
    assert_eq!(stored.provider_status, "failed");
    assert_eq!(stored.last_error.as_deref(), Some("30006"));

    let params = form(&[("MessageSid", "SMunknown"), ("MessageStatus", "delivered")]);
    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/status", &params, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_slow_ack_still_records_outcome() {
    let mut cfg = test_config();
    cfg.ingress.ack_timeout_ms = 50;
    let slow = CountingMessenger::slow(std::time::Duration::from_millis(300));
    let h = harness_with_provider(cfg, slow).await;

    let response = h
        .app
        .clone()
        .oneshot(signed_request("/webhooks/twilio/sms", &sms("SM0020", "Hi"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    assert_eq!(h.messenger.calls(), 1);
    let (status, provider_id): (String, String) = sqlx::query_as(
        "SELECT provider_status, COALESCE(provider_message_id, '') FROM messages WHERE direction = 'outbound'",
    )
    .fetch_one(&h.state.pool)
    .await
    .unwrap();
    assert_eq!(status, "sent");
    assert_eq!(provider_id, "SMout1");
}

// ---- telnyx ----

fn telnyx_request(path: &str, payload: &Value, secret: &str) -> Request<Body> {
    let body = payload.to_string();
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let signature = telnyx::compute_signature(secret, &timestamp, body.as_bytes());
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(telnyx::TIMESTAMP_HEADER, timestamp)
        .header(telnyx::SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap()
}

fn telnyx_inbound(event_id: &str, message_id: &str, text: &str, to: &str) -> Value {
    json!({
        "data": {
            "id": event_id,
            "event_type": "message.received",
            "occurred_at": "2026-03-01T15:04:05Z",
            "payload": {
                "id": message_id,
                "direction": "inbound",
                "text": text,
                "status": "webhook_delivered",
                "from": {"phone_number": PATIENT},
                "to": [{"phone_number": to}],
                "media_urls": []
            }
        }
    })
}

#[tokio::test]
async fn test_telnyx_inbound_enqueues_and_acks() {
    let h = harness().await;
    let pool = &h.state.pool;
    let payload = telnyx_inbound("evt-1", "tx-msg-1", "Do you have Botox openings?", CLINIC_NUMBER);

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(telnyx_request("/webhooks/telnyx/messages", &payload, TELNYX_SECRET))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let job = db::get_reply_job(pool, DbKind::Sqlite, "telnyx:tx-msg-1").await.unwrap().unwrap();
    assert_eq!(job.payload["request"]["message"], "Do you have Botox openings?");
    assert_eq!(job.payload["request"]["metadata"]["provider"], "telnyx");
    let source: String = sqlx::query_scalar("SELECT source FROM leads LIMIT 1")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(source, "telnyx_sms");
    assert!(db::has_provider_message(pool, DbKind::Sqlite, "tx-msg-1").await.unwrap());
    assert_eq!(db::count_rows(pool, "reply_jobs").await, 1);
    assert_eq!(h.messenger.calls(), 1);
}

#[tokio::test]
async fn test_telnyx_flat_record_and_stop_keyword() {
    let h = harness().await;
    let pool = &h.state.pool;
    let payload = json!({
        "id": "tx-msg-2",
        "record_type": "message",
        "direction": "inbound",
        "text": "STOP",
        "from_number": PATIENT,
        "to_number": CLINIC_NUMBER
    });
    let response = h
        .app
        .clone()
        .oneshot(telnyx_request("/webhooks/telnyx/messages", &payload, TELNYX_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(db::is_unsubscribed(pool, DbKind::Sqlite, "org-1", PATIENT).await.unwrap());
    assert_eq!(db::count_rows(pool, "reply_jobs").await, 0);
    assert!(h.messenger.bodies()[0].contains("unsubscribed"));
}

#[tokio::test]
async fn test_telnyx_delivery_status_updates_message() {
    let h = harness().await;
    let pool = &h.state.pool;
    let mut record = MessageRecord::new(
        "m-tx",
        "org-1",
        CLINIC_NUMBER,
        PATIENT,
        db::DIRECTION_OUTBOUND,
        "See you soon",
        db::STATUS_SENT,
    );
    record.provider_message_id = Some("tx-out-1".to_string());
    db::insert_message(pool, DbKind::Sqlite, &record).await.unwrap();

    let payload = json!({
        "data": {
            "id": "evt-2",
            "event_type": "message.delivery_status",
            "occurred_at": "2026-03-01T15:04:05Z",
            "payload": {"id": "tx-out-1", "status": "delivered"}
        }
    });
    let response = h
        .app
        .clone()
        .oneshot(telnyx_request("/webhooks/telnyx/messages", &payload, TELNYX_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stored = db::get_message(pool, DbKind::Sqlite, "m-tx").await.unwrap().unwrap();
    assert_eq!(stored.provider_status, "delivered");
    assert!(stored.delivered_at.is_some());

    let outbound_record = json!({
        "id": "tx-out-1",
        "record_type": "message",
        "direction": "outbound",
        "status": "undelivered"
    });
    let response = h
        .app
        .clone()
        .oneshot(telnyx_request("/webhooks/telnyx/messages", &outbound_record, TELNYX_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stored = db::get_message(pool, DbKind::Sqlite, "m-tx").await.unwrap().unwrap();
    assert_eq!(stored.provider_status, "failed");
    assert_eq!(stored.last_error.as_deref(), Some("undelivered"));
}

#[tokio::test]
async fn test_telnyx_rejections() {
    let h = harness().await;
    let payload = telnyx_inbound("evt-3", "tx-msg-3", "Hi", CLINIC_NUMBER);

    let forged = telnyx_request("/webhooks/telnyx/messages", &payload, "wrong_secret");
    let response = h.app.clone().oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let unknown = telnyx_inbound("evt-4", "tx-msg-4", "Hi", "+15559999999");
    let response = h
        .app
        .clone()
        .oneshot(telnyx_request("/webhooks/telnyx/messages", &unknown, TELNYX_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let other = json!({"data": {"id": "evt-5", "event_type": "message.sent", "payload": {}}});
    let response = h
        .app
        .clone()
        .oneshot(telnyx_request("/webhooks/telnyx/messages", &other, TELNYX_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(db::count_rows(&h.state.pool, "reply_jobs").await, 0);
    assert_eq!(h.messenger.calls(), 0);
}

#[tokio::test]
async fn test_telnyx_requires_webhook_secret() {
    let mut cfg = test_config();
    cfg.sms.telnyx.webhook_secret = None;
    let h = harness_with(cfg).await;
    let payload = telnyx_inbound("evt-6", "tx-msg-6", "Hi", CLINIC_NUMBER);
    let response = h
        .app
        .clone()
        .oneshot(telnyx_request("/webhooks/telnyx/messages", &payload, TELNYX_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_telnyx_hosted_order_upserted() {
    let h = harness().await;
    let pool = &h.state.pool;
    let payload = json!({
        "data": {
            "id": "evt-7",
            "event_type": "hosted_messaging.order.updated",
            "payload": {
                "id": "order-42",
                "clinic_id": "org-2",
                "phone_number": "+1 (555) 000-3333",
                "status": "activated",
                "last_error": ""
            }
        }
    });
    let response = h
        .app
        .clone()
        .oneshot(telnyx_request("/webhooks/telnyx/hosted", &payload, TELNYX_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        db::lookup_activated_clinic(pool, DbKind::Sqlite, "+15550003333").await.unwrap(),
        Some("org-2".to_string())
    );
    let order_id: String = sqlx::query_scalar(
        "SELECT COALESCE(provider_order_id, '') FROM hosted_number_orders WHERE clinic_id = 'org-2'",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(order_id, "order-42");
}
