use crate::config::RetryConfig;
use crate::db::{self, DbKind, MessageRecord, StatusUpdate};
use crate::error::SendError;
use crate::messenger::ReplyMessenger;
use crate::types::OutboundReply;
use chrono::{DateTime, Duration, Utc};
use sqlx::AnyPool;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{info, warn};

const MAX_RETRY_DELAY_HOURS: i64 = 24;

/// `base * 2^attempts`, capped at 24 hours.
pub fn compute_retry_delay(attempts: i64, base: Duration) -> Duration {
    let exponent = attempts.clamp(0, 16) as u32;
    let delay = base * 2_i32.pow(exponent);
    delay.min(Duration::hours(MAX_RETRY_DELAY_HOURS))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPassSummary {
    pub sent: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    /// Candidates whose outcome could not be written back.
    pub store_failures: usize,
}

fn reply_from_record(record: &MessageRecord) -> OutboundReply {
    OutboundReply {
        org_id: record.clinic_id.clone(),
        to: record.to_number.clone(),
        from: record.from_number.clone(),
        body: record.body.clone(),
        ..OutboundReply::default()
    }
}

async fn mark_sent(
    pool: &AnyPool,
    kind: DbKind,
    record: &MessageRecord,
    reply: &OutboundReply,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    db::record_send_attempt(&mut *tx, kind, &record.id, now).await?;
    db::update_message_status_by_id(
        &mut *tx,
        kind,
        &record.id,
        &StatusUpdate::new(db::STATUS_SENT).delivered(now),
    )
    .await?;
    if let Some(provider_id) = reply.provider_message_id() {
        db::update_message_provider_id(&mut *tx, kind, &record.id, provider_id).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn mark_exhausted(
    pool: &AnyPool,
    kind: DbKind,
    record: &MessageRecord,
    err: &SendError,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    db::record_send_attempt(&mut *tx, kind, &record.id, now).await?;
    db::update_message_status_by_id(
        &mut *tx,
        kind,
        &record.id,
        &StatusUpdate::new(db::STATUS_EXHAUSTED).failed(now, err.to_string()),
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Resends due failed messages once through `sender`.
///
/// `sender` must be the provider-level messenger: the stored row already
/// carries the final body and is updated here. Only transient failures are
/// rescheduled. A row whose outcome cannot be stored is logged and skipped so
/// the rest of the batch still runs.
pub async fn run_retry_pass(
    pool: &AnyPool,
    kind: DbKind,
    sender: &dyn ReplyMessenger,
    cfg: &RetryConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<RetryPassSummary> {
    let candidates =
        db::list_retry_candidates(pool, kind, cfg.max_attempts, now, cfg.batch_size).await?;
    let mut summary = RetryPassSummary::default();
    let base = Duration::seconds(cfg.base_delay_seconds.max(1));

    for record in candidates {
        let mut reply = reply_from_record(&record);
        let attempts = record.send_attempts + 1;
        match sender.send_reply(&mut reply).await {
            Ok(()) => {
                if let Err(err) = mark_sent(pool, kind, &record, &reply, now).await {
                    warn!(message_id = %record.id, "retry delivered but status update failed: {err:?}");
                    summary.store_failures += 1;
                    continue;
                }
                info!(message_id = %record.id, attempts, "retry delivered");
                summary.sent += 1;
            }
            Err(err) if !err.is_transient() || attempts >= cfg.max_attempts => {
                if let Err(store_err) = mark_exhausted(pool, kind, &record, &err, now).await {
                    warn!(message_id = %record.id, "failed to mark retry exhausted: {store_err:?}");
                    summary.store_failures += 1;
                    continue;
                }
                warn!(message_id = %record.id, attempts, "retry abandoned: {err}");
                summary.exhausted += 1;
            }
            Err(err) => {
                let next = now + compute_retry_delay(record.send_attempts, base);
                if let Err(store_err) =
                    db::schedule_retry(pool, kind, &record.id, db::STATUS_RETRY_PENDING, next, now)
                        .await
                {
                    warn!(message_id = %record.id, "failed to schedule retry: {store_err:?}");
                    summary.store_failures += 1;
                    continue;
                }
                warn!(message_id = %record.id, attempts, next_retry_at = %next, "retry failed: {err}");
                summary.rescheduled += 1;
            }
        }
    }

    Ok(summary)
}

pub async fn start_retry_worker(
    pool: AnyPool,
    kind: DbKind,
    sender: Arc<dyn ReplyMessenger>,
    cfg: RetryConfig,
) {
    if !cfg.enabled {
        return;
    }
    loop {
        match run_retry_pass(&pool, kind, sender.as_ref(), &cfg, Utc::now()).await {
            Ok(summary) if summary != RetryPassSummary::default() => {
                info!(
                    sent = summary.sent,
                    rescheduled = summary.rescheduled,
                    exhausted = summary.exhausted,
                    store_failures = summary.store_failures,
                    "retry pass finished"
                );
            }
            Ok(_) => {}
            Err(err) => warn!("retry pass failed: {err:?}"),
        }
        sleep(std::time::Duration::from_secs(cfg.poll_seconds.max(1))).await;
    }
}
