use crate::ack::{select_ack, AckKind};
use crate::channels::telnyx;
use crate::channels::twilio::{self, EMPTY_TWIML, REJECT_TWIML, SIGNATURE_HEADER};
use crate::compliance::{redact_pan, KeywordKind};
use crate::conversation::{is_recently_created, record_assistant_reply};
use crate::db::{self, HostedNumberOrder, MessageRecord, StatusUpdate};
use crate::error::WebhookError;
use crate::outbox::JobOptions;
use crate::phone::{self, normalize_e164};
use crate::types::{
    Channel, ConversationJob, DeliveryStatusEvent, InboundSms, OutboundReply, TranscriptEntry,
    TranscriptRole,
};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{OriginalUri, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PROVIDER: &str = "twilio";
const TELNYX_PROVIDER: &str = "telnyx";
const TELNYX_LEAD_SOURCE: &str = "telnyx_sms";
const UNSUBSCRIBE_SOURCE: &str = "sms_keyword";

pub fn twiml(body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

fn into_response(result: Result<Response, WebhookError>) -> Response {
    match result {
        Ok(resp) => resp,
        Err(err) => {
            if err.status_code().is_server_error() {
                error!("webhook failed: {err}");
            } else {
                warn!("webhook rejected: {err}");
            }
            err.into_response()
        }
    }
}

pub async fn twilio_sms(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    into_response(handle_inbound_sms(&state, &uri, &headers, &body).await)
}

pub async fn twilio_voice(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    into_response(handle_call_status(&state, &uri, &headers, &body).await)
}

pub async fn twilio_status(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    into_response(handle_delivery_status(&state, &uri, &headers, &body).await)
}

/// The URL the provider signed: the configured public origin plus the request path and query.
pub fn absolute_url(public_base_url: Option<&str>, headers: &HeaderMap, uri: &Uri) -> String {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    if let Some(base) = public_base_url.map(str::trim).filter(|b| !b.is_empty()) {
        return format!("{}{}", base.trim_end_matches('/'), path);
    }
    let proto = headers
        .get("X-Forwarded-Proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}{path}")
}

fn verify_signature(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
    params: &[(String, String)],
) -> Result<(), WebhookError> {
    let sms = &state.config.sms;
    let Some(secret) = sms.webhook_secret.as_deref().filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    if sms.skip_signature {
        return Ok(());
    }
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| WebhookError::Authentication("missing signature".to_string()))?;
    let url = absolute_url(state.config.server.public_base_url.as_deref(), headers, uri);
    if !twilio::validate_signature(secret, &url, params, signature) {
        warn!(url, "webhook signature mismatch");
        return Err(WebhookError::Authentication("invalid signature".to_string()));
    }
    Ok(())
}

fn normalized_pair(from: &str, to: &str) -> Result<(String, String), WebhookError> {
    let from = normalize_e164(from);
    let to = normalize_e164(to);
    if from.is_empty() || to.is_empty() {
        return Err(WebhookError::Validation("invalid phone number".to_string()));
    }
    Ok((from, to))
}

async fn resolve_org(state: &AppState, to: &str) -> Result<String, WebhookError> {
    state.org_resolver.resolve_org_id(to).await.map_err(|err| {
        warn!(to, "org resolution failed: {err}");
        WebhookError::Validation("unknown destination number".to_string())
    })
}

async fn already_processed(state: &AppState, provider_message_id: &str) -> bool {
    match db::has_provider_message(&state.pool, state.db_kind, provider_message_id).await {
        Ok(found) => found,
        Err(err) => {
            warn!(provider_message_id, "duplicate check failed: {err:?}");
            false
        }
    }
}

/// Upserts the lead and reports whether this sender is a first-time contact.
async fn ensure_lead(state: &AppState, org_id: &str, from: &str, to: &str, source: &str) -> bool {
    let now = Utc::now();
    let lead_is_new = match state
        .leads
        .get_or_create_by_phone(org_id, from, source, None)
        .await
    {
        Ok(lead) => is_recently_created(&lead, now, state.config.ingress.new_lead_window_seconds),
        Err(err) => {
            warn!(org_id, "lead upsert failed: {err:?}");
            false
        }
    };
    if !lead_is_new {
        return false;
    }
    match db::has_inbound_message(&state.pool, state.db_kind, org_id, from, to).await {
        Ok(seen_before) => !seen_before,
        Err(err) => {
            warn!(org_id, "inbound history check failed: {err:?}");
            true
        }
    }
}

async fn record_transcript(
    state: &AppState,
    provider: &str,
    conversation_id: &str,
    lead_id: &str,
    provider_message_id: &str,
    content: &str,
    now: DateTime<Utc>,
) {
    let entry = TranscriptEntry {
        id: phone::transcript_message_id(provider, provider_message_id),
        role: TranscriptRole::User,
        content: content.to_string(),
        created_at: now,
    };
    if let Err(err) = state.conversations.append_message(conversation_id, &entry).await {
        warn!(conversation_id, "transcript append failed: {err:?}");
    }
    if let Err(err) = state.conversations.link_lead(conversation_id, lead_id).await {
        warn!(conversation_id, lead_id, "lead link failed: {err:?}");
    }
}

async fn enqueue_bounded(
    state: &AppState,
    start: bool,
    job_id: &str,
    job: &ConversationJob,
) -> Result<(), WebhookError> {
    let options = JobOptions {
        delay_ms: state.config.ingress.job_delay_ms,
    };
    let limit = Duration::from_millis(state.config.ingress.enqueue_timeout_ms);
    let publish = async {
        if start {
            state.publisher.enqueue_start(job_id, job, &options).await
        } else {
            state.publisher.enqueue_message(job_id, job, &options).await
        }
    };
    match tokio::time::timeout(limit, publish).await {
        Ok(Ok(())) => {
            info!(job_id, org_id = %job.org_id, conversation_id = %job.conversation_id, "reply job enqueued");
            Ok(())
        }
        Ok(Err(err)) => {
            error!(job_id, "failed to enqueue reply job: {err:?}");
            Err(WebhookError::Publish("failed to enqueue reply job".to_string()))
        }
        Err(_) => {
            error!(job_id, "enqueue timed out");
            Err(WebhookError::Publish("enqueue timed out".to_string()))
        }
    }
}

/// Sends through the reply chain and waits at most the ack timeout. Never fails
/// the request. The send runs on its own task so the persisted row still gets
/// its outcome after the wait gives up.
async fn send_bounded(state: &AppState, mut reply: OutboundReply, what: &'static str) {
    let Some(messenger) = state.messenger.clone() else {
        warn!(conversation_id = %reply.conversation_id, "no sms provider configured, skipping {what}");
        return;
    };
    let conversations = state.conversations.clone();
    let conversation_id = reply.conversation_id.clone();
    let send = tokio::spawn(async move {
        match messenger.send_reply(&mut reply).await {
            Ok(()) => {
                info!(
                    conversation_id = %reply.conversation_id,
                    provider_message_id = reply.provider_message_id().unwrap_or_default(),
                    "{what} sent"
                );
                record_assistant_reply(conversations.as_ref(), &reply).await;
            }
            Err(err) => warn!(conversation_id = %reply.conversation_id, "{what} failed: {err}"),
        }
    });
    let limit = Duration::from_millis(state.config.ingress.ack_timeout_ms);
    match tokio::time::timeout(limit, send).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(conversation_id = %conversation_id, "{what} task aborted: {err}"),
        Err(_) => warn!(conversation_id = %conversation_id, "{what} still sending after ack timeout"),
    }
}

async fn send_ack(state: &AppState, kind: AckKind, job: &ConversationJob) {
    let Some(body) = select_ack(
        &state.config.acks,
        kind,
        &job.conversation_id,
        job.clinic_name.as_deref(),
    ) else {
        return;
    };
    let reply = OutboundReply {
        org_id: job.org_id.clone(),
        lead_id: job.lead_id.clone(),
        conversation_id: job.conversation_id.clone(),
        to: job.from.clone(),
        from: job.to.clone(),
        body,
        metadata: HashMap::new(),
    };
    send_bounded(state, reply, "ack").await;
}

async fn handle_keyword(
    state: &AppState,
    keyword: KeywordKind,
    record: &MessageRecord,
    lead_id: &str,
    conversation_id: &str,
) -> Result<(), WebhookError> {
    let internal = |err: anyhow::Error| WebhookError::Internal(format!("keyword handling failed: {err}"));
    let kind = state.db_kind;

    let mut tx = state.pool.begin().await.map_err(|e| internal(e.into()))?;
    db::insert_message(&mut *tx, kind, record).await.map_err(internal)?;
    match keyword {
        KeywordKind::OptOut => {
            db::insert_unsubscribe(&mut *tx, kind, &record.clinic_id, &record.from_number, UNSUBSCRIBE_SOURCE)
                .await
                .map_err(internal)?
        }
        KeywordKind::OptIn => {
            db::delete_unsubscribe(&mut *tx, kind, &record.clinic_id, &record.from_number)
                .await
                .map_err(internal)?
        }
        KeywordKind::Help => {}
    }
    tx.commit().await.map_err(|e| internal(e.into()))?;
    info!(org_id = %record.clinic_id, keyword = ?keyword, "carrier keyword processed");

    let compliance = &state.config.compliance;
    let body = match keyword {
        KeywordKind::OptOut => &compliance.stop_reply,
        KeywordKind::Help => &compliance.help_reply,
        KeywordKind::OptIn => &compliance.start_reply,
    };
    if body.trim().is_empty() {
        return Ok(());
    }
    let reply = OutboundReply {
        org_id: record.clinic_id.clone(),
        lead_id: lead_id.to_string(),
        conversation_id: conversation_id.to_string(),
        to: record.from_number.clone(),
        from: record.to_number.clone(),
        body: body.clone(),
        metadata: HashMap::new(),
    };
    send_bounded(state, reply, "keyword reply").await;
    Ok(())
}

async fn handle_inbound_sms(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, WebhookError> {
    let params = twilio::parse_form(body)?;
    verify_signature(state, headers, uri, &params)?;
    let inbound = twilio::parse_inbound_sms(&params)?;
    let (from, to) = normalized_pair(&inbound.from, &inbound.to)?;
    let org_id = resolve_org(state, &to).await?;
    let source = InboundSource {
        provider: PROVIDER,
        lead_source: Channel::Sms.as_str(),
        job_id: inbound.message_sid.clone(),
    };
    process_inbound(state, &source, &inbound, org_id, from, to).await?;
    Ok(twiml(EMPTY_TWIML))
}

/// Provider-specific labels for an inbound message.
struct InboundSource {
    provider: &'static str,
    lead_source: &'static str,
    job_id: String,
}

/// Shared inbound pipeline once the sender, destination, and org are known:
/// dedup, lead upsert, transcript, carrier keywords, job enqueue, then the ack.
async fn process_inbound(
    state: &AppState,
    source: &InboundSource,
    inbound: &InboundSms,
    org_id: String,
    from: String,
    to: String,
) -> Result<(), WebhookError> {
    if already_processed(state, &inbound.message_sid).await {
        info!(provider = source.provider, message_id = %inbound.message_sid, "duplicate webhook delivery ignored");
        return Ok(());
    }

    let now = Utc::now();
    let lead_id = phone::lead_id(&org_id, &from);
    let conversation_id = phone::conversation_id(&org_id, &from, Channel::Sms);
    let first_contact = ensure_lead(state, &org_id, &from, &to, source.lead_source).await;

    let (message, pan_redacted) = redact_pan(&inbound.body);
    record_transcript(
        state,
        source.provider,
        &conversation_id,
        &lead_id,
        &inbound.message_sid,
        &message,
        now,
    )
    .await;

    let mut record = MessageRecord::new(
        Uuid::new_v4().to_string(),
        &org_id,
        &from,
        &to,
        db::DIRECTION_INBOUND,
        &message,
        db::STATUS_RECEIVED,
    );
    record.provider_message_id = Some(inbound.message_sid.clone());
    record.media = inbound.media_urls.clone();

    if let Some(keyword) = state.keywords.detect(&inbound.body) {
        return handle_keyword(state, keyword, &record, &lead_id, &conversation_id).await;
    }

    let mut metadata = HashMap::new();
    metadata.insert("provider".to_string(), source.provider.to_string());
    metadata.insert("provider_message_id".to_string(), inbound.message_sid.clone());
    if pan_redacted {
        metadata.insert("pan_redacted".to_string(), "true".to_string());
    }
    if !inbound.media_urls.is_empty() {
        metadata.insert("media_count".to_string(), inbound.media_urls.len().to_string());
    }
    let job = ConversationJob {
        org_id: org_id.clone(),
        lead_id,
        conversation_id,
        channel: Channel::Sms.as_str().to_string(),
        from,
        to,
        message,
        clinic_name: state.config.org(&org_id).and_then(|o| o.clinic_name.clone()),
        metadata,
    };
    enqueue_bounded(state, false, &source.job_id, &job).await?;

    if let Err(err) = db::insert_message(&state.pool, state.db_kind, &record).await {
        warn!(message_id = %inbound.message_sid, "failed to store inbound message: {err:?}");
    }

    send_ack(state, AckKind::for_sms(first_contact), &job).await;
    Ok(())
}

async fn handle_call_status(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, WebhookError> {
    let params = twilio::parse_form(body)?;
    verify_signature(state, headers, uri, &params)?;
    let event = twilio::parse_call_status(&params)?;
    let (from, to) = normalized_pair(&event.from, &event.to)?;
    let org_id = resolve_org(state, &to).await?;

    if !event.is_missed() {
        debug!(call_sid = %event.call_sid, status = %event.call_status, "rejecting live call");
        return Ok(twiml(REJECT_TWIML));
    }
    if already_processed(state, &event.call_sid).await {
        info!(call_sid = %event.call_sid, "duplicate missed-call callback ignored");
        return Ok(twiml(EMPTY_TWIML));
    }

    let lead_id = phone::lead_id(&org_id, &from);
    // Follow-up happens over SMS, so the missed call opens the SMS conversation.
    let conversation_id = phone::conversation_id(&org_id, &from, Channel::Sms);
    let first_contact = ensure_lead(state, &org_id, &from, &to, "missed_call").await;
    if let Err(err) = state.conversations.link_lead(&conversation_id, &lead_id).await {
        warn!(conversation_id = %conversation_id, "lead link failed: {err:?}");
    }

    let mut metadata = HashMap::new();
    metadata.insert("call_sid".to_string(), event.call_sid.clone());
    metadata.insert("call_status".to_string(), event.call_status.clone());
    let job = ConversationJob {
        org_id: org_id.clone(),
        lead_id,
        conversation_id,
        channel: Channel::Voice.as_str().to_string(),
        from: from.clone(),
        to: to.clone(),
        message: String::new(),
        clinic_name: state.config.org(&org_id).and_then(|o| o.clinic_name.clone()),
        metadata,
    };
    enqueue_bounded(state, true, &event.call_sid, &job).await?;

    let mut record = MessageRecord::new(
        Uuid::new_v4().to_string(),
        &org_id,
        &from,
        &to,
        db::DIRECTION_INBOUND,
        format!("[missed call: {}]", event.call_status),
        db::STATUS_RECEIVED,
    );
    record.provider_message_id = Some(event.call_sid.clone());
    if let Err(err) = db::insert_message(&state.pool, state.db_kind, &record).await {
        warn!(call_sid = %event.call_sid, "failed to store missed call: {err:?}");
    }

    send_ack(state, AckKind::for_missed_call(first_contact), &job).await;
    Ok(twiml(EMPTY_TWIML))
}

async fn handle_delivery_status(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, WebhookError> {
    let params = twilio::parse_form(body)?;
    verify_signature(state, headers, uri, &params)?;
    let event = twilio::parse_status_callback(&params)?;
    apply_delivery_status(state, &event, Utc::now()).await?;
    Ok(twiml(EMPTY_TWIML))
}

/// Maps a provider delivery receipt onto the stored outbound row.
async fn apply_delivery_status(
    state: &AppState,
    event: &DeliveryStatusEvent,
    at: DateTime<Utc>,
) -> Result<(), WebhookError> {
    let update = match event.message_status.as_str() {
        "delivered" => StatusUpdate::new(db::STATUS_DELIVERED).delivered(at),
        "failed" | "undelivered" => StatusUpdate::new(db::STATUS_FAILED).failed(
            at,
            event
                .error_code
                .clone()
                .unwrap_or_else(|| event.message_status.clone()),
        ),
        other => StatusUpdate::new(other),
    };

    match db::update_message_status(&state.pool, state.db_kind, &event.message_sid, &update).await {
        Ok(true) => {
            info!(message_id = %event.message_sid, status = %event.message_status, "delivery status updated")
        }
        Ok(false) => {
            debug!(message_id = %event.message_sid, "status callback for unknown message")
        }
        Err(err) => {
            return Err(WebhookError::Internal(format!(
                "status update failed: {err}"
            )))
        }
    }
    Ok(())
}

// ---- telnyx ----

pub async fn telnyx_messages(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    into_response(handle_telnyx_messages(&state, &headers, &body).await)
}

pub async fn telnyx_hosted(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    into_response(handle_telnyx_hosted(&state, &headers, &body).await)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn verify_telnyx_signature(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
    if state.config.sms.skip_signature {
        return Ok(());
    }
    let telnyx_cfg = &state.config.sms.telnyx;
    let Some(secret) = telnyx_cfg.webhook_secret.as_deref().filter(|s| !s.is_empty()) else {
        return Err(WebhookError::NotConfigured(
            "telnyx webhook secret not configured".to_string(),
        ));
    };
    telnyx::verify_signature(
        secret,
        header_str(headers, telnyx::TIMESTAMP_HEADER),
        header_str(headers, telnyx::SIGNATURE_HEADER),
        body,
        Utc::now(),
        telnyx_cfg.signature_max_skew_seconds,
    )
}

async fn handle_telnyx_messages(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, WebhookError> {
    verify_telnyx_signature(state, headers, body)?;
    let event = telnyx::parse_event(body)?;
    match event.event_type.as_str() {
        telnyx::EVENT_MESSAGE_RECEIVED => {
            let inbound = telnyx::parse_inbound_message(&event.payload)?;
            let (from, to) = normalized_pair(&inbound.from, &inbound.to)?;
            let org_id = state.org_resolver.resolve_org_id(&to).await.map_err(|err| {
                warn!(to = %to, "org resolution failed: {err}");
                WebhookError::NotFound(format!("clinic not found for {to}"))
            })?;
            let source = InboundSource {
                provider: TELNYX_PROVIDER,
                lead_source: TELNYX_LEAD_SOURCE,
                job_id: format!("{TELNYX_PROVIDER}:{}", inbound.message_sid),
            };
            process_inbound(state, &source, &inbound, org_id, from, to).await?;
        }
        telnyx::EVENT_DELIVERY_STATUS => {
            let receipt = telnyx::parse_delivery_status(&event.payload)?;
            apply_delivery_status(state, &receipt, event.occurred_at.unwrap_or_else(Utc::now)).await?;
        }
        other => {
            debug!(event_id = %event.id, event_type = other, "ignoring telnyx event");
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
    }
    Ok(StatusCode::OK.into_response())
}

async fn handle_telnyx_hosted(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, WebhookError> {
    verify_telnyx_signature(state, headers, body)?;
    let event = telnyx::parse_event(body)?;
    let hosted = telnyx::parse_hosted_order(&event.payload)?;
    let e164_number = normalize_e164(&hosted.phone_number);
    if hosted.clinic_id.trim().is_empty() || e164_number.is_empty() {
        return Err(WebhookError::Validation(
            "clinic_id and phone_number are required".to_string(),
        ));
    }
    let order = HostedNumberOrder {
        id: Uuid::new_v4().to_string(),
        clinic_id: hosted.clinic_id.trim().to_string(),
        e164_number,
        status: hosted.status.trim().to_lowercase(),
        last_error: Some(hosted.last_error).filter(|e| !e.trim().is_empty()),
        provider_order_id: Some(hosted.id).filter(|id| !id.trim().is_empty()),
    };
    db::upsert_hosted_number_order(&state.pool, state.db_kind, &order)
        .await
        .map_err(|err| WebhookError::Internal(format!("hosted order upsert failed: {err}")))?;
    info!(
        event_id = %event.id,
        clinic_id = %order.clinic_id,
        number = %order.e164_number,
        status = %order.status,
        "hosted order updated"
    );
    Ok(StatusCode::OK.into_response())
}
