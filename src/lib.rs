pub mod ack;
pub mod channels;
pub mod compliance;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod messenger;
pub mod org;
pub mod outbox;
pub mod phone;
pub mod retry;
pub mod types;
pub mod webhook;

pub use config::Config;

use self::compliance::{GateDecision, GatePolicy, KeywordDetector, QuietHours};
use self::config::{load_config, resolve_database_url};
use self::conversation::{
    record_assistant_reply, AssistantMessageChecker, ConversationStore, LeadRepository,
    SqlConversationStore, SqlLeadRepository, SqlMessageHistory,
};
use self::db::{BrandRecord, CampaignRecord, DbKind, HostedNumberOrder};
use self::error::SendError;
use self::messenger::{build_provider_messenger, build_reply_chain, ReplyMessenger};
use self::org::{ChainedOrgResolver, OrgResolver, StaticOrgResolver, StoreOrgResolver};
use self::outbox::{JobPublisher, OutboxPublisher};
use self::phone::normalize_e164;
use self::types::{OutboundReply, Purpose, META_MESSAGE_ID, META_PROVIDER};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const AUTH_HEADER: &str = "X-Clinic-Sms-Token";
const HTTP_TIMEOUT_SECONDS: u64 = 15;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub http: reqwest::Client,
    pub db_kind: DbKind,
    /// Bare provider messenger, used by the retry worker.
    pub provider: Option<Arc<dyn ReplyMessenger>>,
    /// Full reply chain for fresh outbound sends.
    pub messenger: Option<Arc<dyn ReplyMessenger>>,
    pub org_resolver: Arc<dyn OrgResolver>,
    pub leads: Arc<dyn LeadRepository>,
    pub conversations: Arc<dyn ConversationStore>,
    pub publisher: Arc<dyn JobPublisher>,
    pub keywords: Arc<KeywordDetector>,
    pub quiet_hours: Arc<HashMap<String, QuietHours>>,
}

impl AppState {
    /// Wires the SQL-backed collaborators and the provider chain from `config`.
    ///
    /// With `provider = "auto"` and no credentials, outbound sending is
    /// disabled instead of failing startup.
    pub fn new(
        config: Config,
        pool: AnyPool,
        db_kind: DbKind,
        http: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let keywords = if config.compliance.keywords_enabled {
            KeywordDetector::new().context("compiling keyword patterns")?
        } else {
            KeywordDetector::disabled()
        };

        let mut quiet_hours = HashMap::new();
        for org in &config.orgs {
            let Some(qh) = org.quiet_hours.as_ref().filter(|q| q.enabled) else {
                continue;
            };
            let window = QuietHours::parse(&qh.start, &qh.end, &qh.timezone)
                .with_context(|| format!("quiet hours for org {}", org.org_id))?;
            quiet_hours.insert(org.org_id.clone(), window);
        }

        let org_resolver = ChainedOrgResolver::new(vec![
            Arc::new(StaticOrgResolver::from_bindings(&config.orgs)),
            Arc::new(StoreOrgResolver::new(pool.clone(), db_kind)),
        ]);

        let provider = match build_provider_messenger(&http, &config.sms) {
            Ok(provider) => Some(provider),
            Err(err) if is_auto_provider(&config.sms.provider) => {
                warn!("outbound sms disabled: {err}");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let state = Self {
            pool: pool.clone(),
            http,
            db_kind,
            provider: None,
            messenger: None,
            org_resolver: Arc::new(org_resolver),
            leads: Arc::new(SqlLeadRepository::new(pool.clone(), db_kind)),
            conversations: Arc::new(SqlConversationStore::new(pool.clone(), db_kind)),
            publisher: Arc::new(OutboxPublisher::new(pool, db_kind)),
            keywords: Arc::new(keywords),
            quiet_hours: Arc::new(quiet_hours),
            config,
        };
        Ok(match provider {
            Some(provider) => state.with_provider(provider),
            None => state,
        })
    }

    /// Rebuilds the reply chain around `provider`.
    pub fn with_provider(mut self, provider: Arc<dyn ReplyMessenger>) -> Self {
        let checkers: Vec<Arc<dyn AssistantMessageChecker>> = vec![
            Arc::new(SqlConversationStore::new(self.pool.clone(), self.db_kind)),
            Arc::new(SqlMessageHistory::new(self.pool.clone(), self.db_kind)),
        ];
        self.messenger = Some(build_reply_chain(
            provider.clone(),
            self.pool.clone(),
            self.db_kind,
            &self.config.compliance,
            checkers,
        ));
        self.provider = Some(provider);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn JobPublisher>) -> Self {
        self.publisher = publisher;
        self
    }
}

fn is_auto_provider(provider: &str) -> bool {
    let provider = provider.trim();
    provider.is_empty() || provider.eq_ignore_ascii_case("auto")
}

#[derive(Debug, Deserialize)]
pub struct DeliverReplyRequest {
    #[serde(flatten)]
    pub reply: OutboundReply,
    #[serde(default)]
    pub purpose: Purpose,
}

#[derive(Debug, Serialize)]
pub struct DeliverReplyResponse {
    pub status: String,
    pub message_id: Option<String>,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub provider_status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub messages: i64,
    pub leads: i64,
    pub pending_jobs: i64,
    pub retry_pending: i64,
    pub outbound_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let config = load_config();
    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
        .build()?;
    let state = AppState::new(config.clone(), pool.clone(), db_kind, http)?;

    tokio::spawn(outbox::start_outbox_worker(
        pool.clone(),
        config.backend.clone(),
        db_kind,
    ));
    if let Some(provider) = state.provider.clone() {
        tokio::spawn(retry::start_retry_worker(
            pool.clone(),
            db_kind,
            provider,
            config.retry.clone(),
        ));
    }

    let app = build_router(state.clone());
    Ok((state, app))
}

pub fn build_router(state: AppState) -> Router {
    let authed_routes = Router::new()
        .route("/v1/replies", post(deliver_reply))
        .route(
            "/v1/registrations/hosted-orders",
            post(upsert_hosted_order).get(list_hosted_orders),
        )
        .route("/v1/registrations/brands", post(upsert_brand))
        .route("/v1/registrations/campaigns", post(upsert_campaign))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/webhooks/twilio/sms", post(webhook::twilio_sms))
        .route("/webhooks/twilio/voice", post(webhook::twilio_voice))
        .route("/webhooks/twilio/status", post(webhook::twilio_status))
        .route("/webhooks/telnyx/messages", post(webhook::telnyx_messages))
        .route("/webhooks/telnyx/hosted", post(webhook::telnyx_hosted));

    Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let messages = db::count_rows(&state.pool, "messages").await;
    let leads = db::count_rows(&state.pool, "leads").await;
    let pending_jobs = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM reply_jobs WHERE status IN ('pending', 'failed')",
    )
    .fetch_one(&state.pool)
    .await
    .unwrap_or(0);
    let retry_pending = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM messages WHERE provider_status IN ('failed', 'retry_pending')",
    )
    .fetch_one(&state.pool)
    .await
    .unwrap_or(0);
    Json(StatusResponse {
        messages,
        leads,
        pending_jobs,
        retry_pending,
        outbound_enabled: state.messenger.is_some(),
    })
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

fn send_error_status(err: &SendError) -> StatusCode {
    match err {
        SendError::Invalid(_) => StatusCode::BAD_REQUEST,
        SendError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        SendError::Transient { .. } | SendError::Permanent { .. } => StatusCode::BAD_GATEWAY,
    }
}

async fn deliver_reply(
    State(state): State<AppState>,
    Json(req): Json<DeliverReplyRequest>,
) -> impl IntoResponse {
    let Some(messenger) = state.messenger.clone() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no sms provider configured");
    };

    let mut reply = req.reply;
    reply.to = normalize_e164(&reply.to);
    reply.from = normalize_e164(&reply.from);
    if reply.from.is_empty() {
        if let Some(number) = state
            .config
            .org(&reply.org_id)
            .and_then(|org| org.numbers.first())
        {
            reply.from = normalize_e164(number);
        }
    }
    if reply.org_id.trim().is_empty() || reply.to.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "org_id and to are required");
    }

    let policy = GatePolicy {
        quiet_hours: state
            .quiet_hours
            .get(&reply.org_id)
            .copied()
            .unwrap_or_default(),
        require_activated_number: state.config.compliance.require_activated_number,
    };
    let decision = compliance::evaluate_send(
        &state.pool,
        state.db_kind,
        &reply,
        req.purpose,
        &policy,
        Utc::now(),
    )
    .await;
    match decision {
        Ok(GateDecision::Allow) => {}
        Ok(GateDecision::Suppress { reason }) => {
            info!(org_id = %reply.org_id, reason = %reason, "outbound reply suppressed");
            return Json(json!({"status": "suppressed", "reason": reason})).into_response();
        }
        Ok(GateDecision::Defer { until }) => {
            info!(org_id = %reply.org_id, retry_at = %until, "outbound reply deferred for quiet hours");
            return (
                StatusCode::ACCEPTED,
                Json(json!({"status": "deferred", "retry_at": until.to_rfc3339()})),
            )
                .into_response();
        }
        Err(err) => {
            error!("send gate failed: {err:?}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "send gate failed");
        }
    }

    match messenger.send_reply(&mut reply).await {
        Ok(()) => {
            record_assistant_reply(state.conversations.as_ref(), &reply).await;
            Json(DeliverReplyResponse {
                status: "sent".to_string(),
                message_id: reply.metadata.get(META_MESSAGE_ID).cloned(),
                provider: reply.metadata.get(META_PROVIDER).cloned(),
                provider_message_id: reply.provider_message_id().map(str::to_string),
                provider_status: reply.provider_status().map(str::to_string),
            })
            .into_response()
        }
        Err(err) => {
            error!(org_id = %reply.org_id, "deliver_reply error: {err}");
            error_response(send_error_status(&err), err.to_string())
        }
    }
}

async fn upsert_hosted_order(
    State(state): State<AppState>,
    Json(mut order): Json<HostedNumberOrder>,
) -> impl IntoResponse {
    order.e164_number = normalize_e164(&order.e164_number);
    if order.clinic_id.trim().is_empty() || order.e164_number.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "clinic_id and e164_number are required",
        );
    }
    if order.id.trim().is_empty() {
        order.id = uuid::Uuid::new_v4().to_string();
    }
    if order.status.trim().is_empty() {
        order.status = "pending".to_string();
    }
    match db::upsert_hosted_number_order(&state.pool, state.db_kind, &order).await {
        Ok(()) => Json(order).into_response(),
        Err(err) => {
            error!("hosted order upsert failed: {err:?}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "hosted order upsert failed")
        }
    }
}

async fn list_hosted_orders(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> impl IntoResponse {
    let limit = page.limit.unwrap_or(100).clamp(1, 500);
    let orders = db::list_pending_hosted_orders(&state.pool, state.db_kind, limit)
        .await
        .unwrap_or_default();
    Json(orders)
}

async fn upsert_brand(
    State(state): State<AppState>,
    Json(brand): Json<BrandRecord>,
) -> impl IntoResponse {
    if brand.brand_id.trim().is_empty() || brand.clinic_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "brand_id and clinic_id are required");
    }
    match db::upsert_brand(&state.pool, state.db_kind, &brand).await {
        Ok(()) => Json(brand).into_response(),
        Err(err) => {
            error!("brand upsert failed: {err:?}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "brand upsert failed")
        }
    }
}

async fn upsert_campaign(
    State(state): State<AppState>,
    Json(campaign): Json<CampaignRecord>,
) -> impl IntoResponse {
    if campaign.campaign_id.trim().is_empty() || campaign.brand_id.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "campaign_id and brand_id are required",
        );
    }
    match db::upsert_campaign(&state.pool, state.db_kind, &campaign).await {
        Ok(()) => Json(campaign).into_response(),
        Err(err) => {
            error!("campaign upsert failed: {err:?}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "campaign upsert failed")
        }
    }
}
