use crate::config::BackendConfig;
use crate::db::{self, DbKind, ReplyJobRecord};
use crate::types::ConversationJob;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde_json::json;
use sqlx::AnyPool;
use tokio::time::sleep;
use tracing::{debug, warn};

const OUTBOX_POLL_SECONDS: u64 = 2;
const OUTBOX_BATCH: i64 = 25;
const OUTBOX_MAX_RETRIES: i32 = 10;
const OUTBOX_LEASE_SECONDS: i64 = 300;

pub const JOB_START: &str = "start_conversation";
pub const JOB_MESSAGE: &str = "message";

#[derive(Debug, Clone, Copy, Default)]
pub struct JobOptions {
    pub delay_ms: u64,
}

/// Hands reply work to the conversation worker. Enqueue is idempotent per job id.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn enqueue_start(
        &self,
        job_id: &str,
        request: &ConversationJob,
        options: &JobOptions,
    ) -> anyhow::Result<()>;

    async fn enqueue_message(
        &self,
        job_id: &str,
        request: &ConversationJob,
        options: &JobOptions,
    ) -> anyhow::Result<()>;
}

/// Stores jobs in `reply_jobs`; `start_outbox_worker` delivers them.
#[derive(Clone)]
pub struct OutboxPublisher {
    pool: AnyPool,
    kind: DbKind,
}

impl OutboxPublisher {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }

    async fn enqueue(
        &self,
        job_kind: &str,
        job_id: &str,
        request: &ConversationJob,
        options: &JobOptions,
    ) -> anyhow::Result<()> {
        let payload = json!({
            "job_id": job_id,
            "kind": job_kind,
            "request": request,
        });
        let next_attempt = Utc::now() + Duration::milliseconds(options.delay_ms as i64);
        let inserted =
            db::insert_reply_job(&self.pool, self.kind, job_id, job_kind, &payload, next_attempt)
                .await?;
        if !inserted {
            debug!(job_id, "reply job already enqueued");
        }
        Ok(())
    }
}

#[async_trait]
impl JobPublisher for OutboxPublisher {
    async fn enqueue_start(
        &self,
        job_id: &str,
        request: &ConversationJob,
        options: &JobOptions,
    ) -> anyhow::Result<()> {
        self.enqueue(JOB_START, job_id, request, options).await
    }

    async fn enqueue_message(
        &self,
        job_id: &str,
        request: &ConversationJob,
        options: &JobOptions,
    ) -> anyhow::Result<()> {
        self.enqueue(JOB_MESSAGE, job_id, request, options).await
    }
}

pub fn compute_backoff(retry_count: i32) -> Duration {
    let exponent = (retry_count.max(1) - 1).min(8) as u32;
    let base = 2_i64.pow(exponent);
    Duration::seconds((base * 5).min(300))
}

pub async fn start_outbox_worker(pool: AnyPool, backend: BackendConfig, db_kind: DbKind) {
    let Some(webhook_url) = backend.webhook_url.clone() else {
        warn!("no backend webhook configured, reply jobs will stay queued");
        return;
    };

    let client = Client::new();
    loop {
        let now = Utc::now();
        let lease = Duration::seconds(OUTBOX_LEASE_SECONDS);
        match db::claim_reply_jobs(&pool, db_kind, now, lease, OUTBOX_BATCH).await {
            Ok(batch) => {
                for row in batch {
                    if let Err(err) =
                        dispatch_job(&client, &webhook_url, &backend, &pool, db_kind, &row).await
                    {
                        let retry = row.retry_count + 1;
                        warn!(job_id = %row.id, retry, "reply job delivery failed: {err}");
                        let (status, next) = if retry >= OUTBOX_MAX_RETRIES {
                            ("dead", now + Duration::seconds(3600))
                        } else {
                            ("failed", Utc::now() + compute_backoff(retry))
                        };
                        if let Err(mark_err) = db::mark_reply_job_failed(
                            &pool,
                            db_kind,
                            &row.id,
                            status,
                            retry,
                            next,
                            &err.to_string(),
                        )
                        .await
                        {
                            warn!(job_id = %row.id, "failed to record reply job failure, lease will expire: {mark_err:?}");
                        }
                    }
                }
            }
            Err(err) => warn!("failed to claim reply jobs: {err:?}"),
        }
        sleep(std::time::Duration::from_secs(OUTBOX_POLL_SECONDS)).await;
    }
}

async fn dispatch_job(
    client: &Client,
    webhook_url: &str,
    backend: &BackendConfig,
    pool: &AnyPool,
    db_kind: DbKind,
    row: &ReplyJobRecord,
) -> anyhow::Result<()> {
    let mut req = client.post(webhook_url).json(&row.payload);
    if let Some(token) = backend.api_token.as_ref() {
        req = req.header("X-Clinic-Sms-Token", token);
    }

    let resp = req.send().await?;
    if resp.status().is_success() {
        db::mark_reply_job_delivered(pool, db_kind, &row.id).await?;
        return Ok(());
    }

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow::anyhow!("backend webhook failed: {} {}", status, body))
}
