use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{Any, AnyPool, Executor, Row};
use std::borrow::Cow;

pub const DIRECTION_INBOUND: &str = "inbound";
pub const DIRECTION_OUTBOUND: &str = "outbound";

pub const STATUS_RECEIVED: &str = "received";
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SENT: &str = "sent";
pub const STATUS_DELIVERED: &str = "delivered";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_RETRY_PENDING: &str = "retry_pending";
pub const STATUS_EXHAUSTED: &str = "exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub clinic_id: String,
    pub from_number: String,
    pub to_number: String,
    pub direction: String,
    pub body: String,
    pub media: Vec<String>,
    pub provider_status: String,
    pub provider_message_id: Option<String>,
    pub send_attempts: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(
        id: impl Into<String>,
        clinic_id: impl Into<String>,
        from_number: impl Into<String>,
        to_number: impl Into<String>,
        direction: &str,
        body: impl Into<String>,
        provider_status: &str,
    ) -> Self {
        Self {
            id: id.into(),
            clinic_id: clinic_id.into(),
            from_number: from_number.into(),
            to_number: to_number.into(),
            direction: direction.to_string(),
            body: body.into(),
            media: Vec::new(),
            provider_status: provider_status.to_string(),
            provider_message_id: None,
            send_attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            delivered_at: None,
            failed_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

/// Terminal or intermediate provider state applied to an existing message.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: String,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Self::default()
        }
    }

    pub fn delivered(mut self, at: DateTime<Utc>) -> Self {
        self.delivered_at = Some(at);
        self
    }

    pub fn failed(mut self, at: DateTime<Utc>, error: impl Into<String>) -> Self {
        self.failed_at = Some(at);
        self.last_error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedNumberOrder {
    #[serde(default)]
    pub id: String,
    pub clinic_id: String,
    pub e164_number: String,
    #[serde(default)]
    pub status: String,
    pub last_error: Option<String>,
    pub provider_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandRecord {
    pub brand_id: String,
    pub clinic_id: String,
    pub legal_name: String,
    pub ein: Option<String>,
    pub website: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub campaign_id: String,
    pub brand_id: String,
    pub clinic_id: String,
    pub use_case: String,
    #[serde(default)]
    pub sample_messages: Vec<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyJobRecord {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    #[serde(skip)]
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

pub fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

// Nullable columns are selected through COALESCE: the Any driver cannot decode
// a SQLite NULL into `Option<T>`. Empty text and zero millis map back to `None`.
fn opt_text(row: &AnyRow, column: &str) -> Result<Option<String>> {
    let value: String = row.try_get(column)?;
    Ok(Some(value).filter(|v| !v.is_empty()))
}

fn opt_datetime(row: &AnyRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let value: i64 = row.try_get(column)?;
    Ok((value > 0).then(|| i64_to_datetime(value)))
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            clinic_id TEXT NOT NULL,
            from_number TEXT NOT NULL,
            to_number TEXT NOT NULL,
            direction TEXT NOT NULL,
            body TEXT NOT NULL,
            media TEXT,
            provider_status TEXT NOT NULL,
            provider_message_id TEXT,
            send_attempts BIGINT NOT NULL,
            last_attempt_at BIGINT,
            next_retry_at BIGINT,
            delivered_at BIGINT,
            failed_at BIGINT,
            last_error TEXT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_provider_id ON messages(provider_message_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_retry ON messages(direction, provider_status, next_retry_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(clinic_id, from_number, to_number)"#,
        r#"CREATE TABLE IF NOT EXISTS unsubscribes (
            clinic_id TEXT NOT NULL,
            recipient TEXT NOT NULL,
            source TEXT NOT NULL,
            created_at BIGINT NOT NULL,
            PRIMARY KEY (clinic_id, recipient)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS hosted_number_orders (
            id TEXT PRIMARY KEY,
            clinic_id TEXT NOT NULL,
            e164_number TEXT NOT NULL,
            status TEXT NOT NULL,
            last_error TEXT,
            provider_order_id TEXT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_hosted_orders_number ON hosted_number_orders(clinic_id, e164_number)"#,
        r#"CREATE TABLE IF NOT EXISTS ten_dlc_brands (
            brand_id TEXT PRIMARY KEY,
            clinic_id TEXT NOT NULL,
            legal_name TEXT NOT NULL,
            ein TEXT,
            website TEXT,
            status TEXT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS ten_dlc_campaigns (
            campaign_id TEXT PRIMARY KEY,
            brand_id TEXT NOT NULL,
            clinic_id TEXT NOT NULL,
            use_case TEXT NOT NULL,
            sample_messages TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS leads (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            source TEXT NOT NULL,
            label TEXT,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS conversation_messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_conversation_messages ON conversation_messages(conversation_id, role)"#,
        r#"CREATE TABLE IF NOT EXISTS conversation_leads (
            conversation_id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS reply_jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count BIGINT NOT NULL,
            next_attempt_at BIGINT NOT NULL,
            last_error TEXT,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_reply_jobs_status ON reply_jobs(status, next_attempt_at)"#,
        r#"CREATE TABLE IF NOT EXISTS compliance_audit_events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            org_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            lead_id TEXT NOT NULL,
            details TEXT NOT NULL,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_audit_conversation ON compliance_audit_events(conversation_id, event_type)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

// ---- messages ----

const MESSAGE_COLUMNS: &str = "id, clinic_id, from_number, to_number, direction, body, \
    COALESCE(media, '') AS media, provider_status, COALESCE(provider_message_id, '') AS provider_message_id, \
    send_attempts, COALESCE(last_attempt_at, 0) AS last_attempt_at, COALESCE(next_retry_at, 0) AS next_retry_at, \
    COALESCE(delivered_at, 0) AS delivered_at, COALESCE(failed_at, 0) AS failed_at, \
    COALESCE(last_error, '') AS last_error, created_at";

fn message_from_row(row: &AnyRow) -> Result<MessageRecord> {
    let media = opt_text(row, "media")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        clinic_id: row.try_get("clinic_id")?,
        from_number: row.try_get("from_number")?,
        to_number: row.try_get("to_number")?,
        direction: row.try_get("direction")?,
        body: row.try_get("body")?,
        media: media
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default(),
        provider_status: row.try_get("provider_status")?,
        provider_message_id: opt_text(row, "provider_message_id")?,
        send_attempts: row.try_get("send_attempts")?,
        last_attempt_at: opt_datetime(row, "last_attempt_at")?,
        next_retry_at: opt_datetime(row, "next_retry_at")?,
        delivered_at: opt_datetime(row, "delivered_at")?,
        failed_at: opt_datetime(row, "failed_at")?,
        last_error: opt_text(row, "last_error")?,
        created_at: i64_to_datetime(created_at),
    })
}

pub async fn insert_message<'e, E>(exec: E, kind: DbKind, record: &MessageRecord) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO messages (
            id, clinic_id, from_number, to_number, direction, body, media, provider_status, provider_message_id,
            send_attempts, last_attempt_at, next_retry_at, delivered_at, failed_at, last_error, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    let media = if record.media.is_empty() {
        None
    } else {
        serde_json::to_string(&record.media).ok()
    };
    let provider_id = record
        .provider_message_id
        .as_deref()
        .filter(|id| !id.is_empty());
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.clinic_id)
        .bind(&record.from_number)
        .bind(&record.to_number)
        .bind(&record.direction)
        .bind(&record.body)
        .bind(media)
        .bind(&record.provider_status)
        .bind(provider_id)
        .bind(record.send_attempts)
        .bind(record.last_attempt_at.map(datetime_to_i64))
        .bind(record.next_retry_at.map(datetime_to_i64))
        .bind(record.delivered_at.map(datetime_to_i64))
        .bind(record.failed_at.map(datetime_to_i64))
        .bind(record.last_error.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(Utc::now()))
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn get_message<'e, E>(exec: E, kind: DbKind, id: &str) -> Result<Option<MessageRecord>>
where
    E: Executor<'e, Database = Any>,
{
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(exec).await?;
    row.as_ref().map(message_from_row).transpose()
}

pub async fn get_message_by_provider_id<'e, E>(
    exec: E,
    kind: DbKind,
    provider_message_id: &str,
) -> Result<Option<MessageRecord>>
where
    E: Executor<'e, Database = Any>,
{
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE provider_message_id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(message_from_row).transpose()
}

/// Returns false when no message carries `provider_message_id`.
pub async fn update_message_status<'e, E>(
    exec: E,
    kind: DbKind,
    provider_message_id: &str,
    update: &StatusUpdate,
) -> Result<bool>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"UPDATE messages SET
            provider_status = ?,
            delivered_at = COALESCE(?, delivered_at),
            failed_at = COALESCE(?, failed_at),
            last_error = COALESCE(?, last_error),
            next_retry_at = NULL,
            updated_at = ?
           WHERE provider_message_id = ?"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(&update.status)
        .bind(update.delivered_at.map(datetime_to_i64))
        .bind(update.failed_at.map(datetime_to_i64))
        .bind(update.last_error.as_deref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(provider_message_id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_message_status_by_id<'e, E>(
    exec: E,
    kind: DbKind,
    id: &str,
    update: &StatusUpdate,
) -> Result<bool>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"UPDATE messages SET
            provider_status = ?,
            delivered_at = COALESCE(?, delivered_at),
            failed_at = COALESCE(?, failed_at),
            last_error = COALESCE(?, last_error),
            next_retry_at = NULL,
            updated_at = ?
           WHERE id = ?"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(&update.status)
        .bind(update.delivered_at.map(datetime_to_i64))
        .bind(update.failed_at.map(datetime_to_i64))
        .bind(update.last_error.as_deref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_message_provider_id<'e, E>(
    exec: E,
    kind: DbKind,
    id: &str,
    provider_message_id: &str,
) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        "UPDATE messages SET provider_message_id = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Counts one more send attempt without touching status.
pub async fn record_send_attempt<'e, E>(exec: E, kind: DbKind, id: &str, at: DateTime<Utc>) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        "UPDATE messages SET send_attempts = send_attempts + 1, last_attempt_at = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(at))
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn schedule_retry<'e, E>(
    exec: E,
    kind: DbKind,
    id: &str,
    status: &str,
    next_retry_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"UPDATE messages SET
            send_attempts = send_attempts + 1,
            provider_status = ?,
            last_attempt_at = ?,
            next_retry_at = ?,
            updated_at = ?
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(status)
        .bind(datetime_to_i64(now))
        .bind(datetime_to_i64(next_retry_at))
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn list_retry_candidates<'e, E>(
    exec: E,
    kind: DbKind,
    max_attempts: i64,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<MessageRecord>>
where
    E: Executor<'e, Database = Any>,
{
    let sql = format!(
        r#"SELECT {MESSAGE_COLUMNS} FROM messages
           WHERE direction = ?
             AND provider_status IN (?, ?)
             AND send_attempts < ?
             AND (next_retry_at IS NULL OR next_retry_at <= ?)
           ORDER BY COALESCE(next_retry_at, 0) ASC, created_at ASC
           LIMIT ?"#
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(DIRECTION_OUTBOUND)
        .bind(STATUS_FAILED)
        .bind(STATUS_RETRY_PENDING)
        .bind(max_attempts)
        .bind(datetime_to_i64(now))
        .bind(limit)
        .fetch_all(exec)
        .await?;
    rows.iter().map(message_from_row).collect()
}

pub async fn has_inbound_message<'e, E>(
    exec: E,
    kind: DbKind,
    clinic_id: &str,
    from_number: &str,
    to_number: &str,
) -> Result<bool>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        "SELECT 1 FROM messages WHERE clinic_id = ? AND from_number = ? AND to_number = ? AND direction = ? LIMIT 1",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(clinic_id)
        .bind(from_number)
        .bind(to_number)
        .bind(DIRECTION_INBOUND)
        .fetch_optional(exec)
        .await?;
    Ok(row.is_some())
}

pub async fn has_provider_message<'e, E>(exec: E, kind: DbKind, provider_message_id: &str) -> Result<bool>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        "SELECT 1 FROM messages WHERE provider_message_id = ? LIMIT 1",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .fetch_optional(exec)
        .await?;
    Ok(row.is_some())
}

pub async fn has_outbound_message<'e, E>(
    exec: E,
    kind: DbKind,
    clinic_id: &str,
    to_number: &str,
) -> Result<bool>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        "SELECT 1 FROM messages WHERE clinic_id = ? AND to_number = ? AND direction = ? AND provider_status <> ? LIMIT 1",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(clinic_id)
        .bind(to_number)
        .bind(DIRECTION_OUTBOUND)
        .bind(STATUS_FAILED)
        .fetch_optional(exec)
        .await?;
    Ok(row.is_some())
}

// ---- unsubscribes ----

pub async fn insert_unsubscribe<'e, E>(
    exec: E,
    kind: DbKind,
    clinic_id: &str,
    recipient: &str,
    source: &str,
) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO unsubscribes (clinic_id, recipient, source, created_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(clinic_id, recipient) DO UPDATE SET source = excluded.source"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(clinic_id)
        .bind(recipient)
        .bind(source)
        .bind(datetime_to_i64(Utc::now()))
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn delete_unsubscribe<'e, E>(exec: E, kind: DbKind, clinic_id: &str, recipient: &str) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        "DELETE FROM unsubscribes WHERE clinic_id = ? AND recipient = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(clinic_id)
        .bind(recipient)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn is_unsubscribed<'e, E>(exec: E, kind: DbKind, clinic_id: &str, recipient: &str) -> Result<bool>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        "SELECT 1 FROM unsubscribes WHERE clinic_id = ? AND recipient = ? LIMIT 1",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(clinic_id)
        .bind(recipient)
        .fetch_optional(exec)
        .await?;
    Ok(row.is_some())
}

// ---- registration records ----

pub async fn upsert_hosted_number_order<'e, E>(exec: E, kind: DbKind, order: &HostedNumberOrder) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let now = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        r#"INSERT INTO hosted_number_orders (
            id, clinic_id, e164_number, status, last_error, provider_order_id, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(clinic_id, e164_number) DO UPDATE SET
            status = excluded.status,
            last_error = excluded.last_error,
            provider_order_id = COALESCE(excluded.provider_order_id, hosted_number_orders.provider_order_id),
            updated_at = excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&order.id)
        .bind(&order.clinic_id)
        .bind(&order.e164_number)
        .bind(&order.status)
        .bind(order.last_error.as_deref())
        .bind(order.provider_order_id.as_deref())
        .bind(now)
        .bind(now)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn lookup_activated_clinic<'e, E>(exec: E, kind: DbKind, e164_number: &str) -> Result<Option<String>>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"SELECT clinic_id FROM hosted_number_orders
           WHERE e164_number = ? AND status = 'activated'
           ORDER BY updated_at DESC LIMIT 1"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(e164_number)
        .fetch_optional(exec)
        .await?;
    match row {
        Some(row) => Ok(Some(row.try_get("clinic_id")?)),
        None => Ok(None),
    }
}

pub async fn list_pending_hosted_orders<'e, E>(exec: E, kind: DbKind, limit: i64) -> Result<Vec<HostedNumberOrder>>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"SELECT id, clinic_id, e164_number, status,
                  COALESCE(last_error, '') AS last_error,
                  COALESCE(provider_order_id, '') AS provider_order_id
           FROM hosted_number_orders
           WHERE status IN ('pending', 'verifying', 'documents_submitted')
           ORDER BY created_at ASC LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(limit).fetch_all(exec).await?;
    let mut result = Vec::new();
    for row in rows {
        result.push(HostedNumberOrder {
            id: row.try_get("id")?,
            clinic_id: row.try_get("clinic_id")?,
            e164_number: row.try_get("e164_number")?,
            status: row.try_get("status")?,
            last_error: opt_text(&row, "last_error")?,
            provider_order_id: opt_text(&row, "provider_order_id")?,
        });
    }
    Ok(result)
}

pub async fn upsert_brand<'e, E>(exec: E, kind: DbKind, brand: &BrandRecord) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let now = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        r#"INSERT INTO ten_dlc_brands (brand_id, clinic_id, legal_name, ein, website, status, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(brand_id) DO UPDATE SET
            clinic_id = excluded.clinic_id,
            legal_name = excluded.legal_name,
            ein = excluded.ein,
            website = excluded.website,
            status = excluded.status,
            updated_at = excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&brand.brand_id)
        .bind(&brand.clinic_id)
        .bind(&brand.legal_name)
        .bind(brand.ein.as_deref())
        .bind(brand.website.as_deref())
        .bind(&brand.status)
        .bind(now)
        .bind(now)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn upsert_campaign<'e, E>(exec: E, kind: DbKind, campaign: &CampaignRecord) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let now = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        r#"INSERT INTO ten_dlc_campaigns (campaign_id, brand_id, clinic_id, use_case, sample_messages, status, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(campaign_id) DO UPDATE SET
            brand_id = excluded.brand_id,
            clinic_id = excluded.clinic_id,
            use_case = excluded.use_case,
            sample_messages = excluded.sample_messages,
            status = excluded.status,
            updated_at = excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&campaign.campaign_id)
        .bind(&campaign.brand_id)
        .bind(&campaign.clinic_id)
        .bind(&campaign.use_case)
        .bind(serde_json::to_string(&campaign.sample_messages)?)
        .bind(&campaign.status)
        .bind(now)
        .bind(now)
        .execute(exec)
        .await?;
    Ok(())
}

// ---- leads & transcripts ----

/// Returns the lead with id `id`, inserting it first when absent.
pub async fn get_or_create_lead(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    org_id: &str,
    phone: &str,
    source: &str,
    label: Option<&str>,
) -> Result<crate::types::Lead> {
    let insert = rewrite_sql(
        r#"INSERT INTO leads (id, org_id, phone, source, label, created_at)
           VALUES (?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO NOTHING"#,
        kind,
    );
    sqlx::query(insert.as_ref())
        .bind(id)
        .bind(org_id)
        .bind(phone)
        .bind(source)
        .bind(label)
        .bind(datetime_to_i64(Utc::now()))
        .execute(pool)
        .await?;

    let select = rewrite_sql(
        "SELECT id, org_id, phone, source, COALESCE(label, '') AS label, created_at FROM leads WHERE id = ?",
        kind,
    );
    let row = sqlx::query(select.as_ref()).bind(id).fetch_one(pool).await?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(crate::types::Lead {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        phone: row.try_get("phone")?,
        source: row.try_get("source")?,
        label: opt_text(&row, "label")?,
        created_at: i64_to_datetime(created_at),
    })
}

pub async fn count_leads(pool: &AnyPool, kind: DbKind, org_id: &str, phone: &str) -> Result<i64> {
    let sql = rewrite_sql(
        "SELECT COUNT(1) AS n FROM leads WHERE org_id = ? AND phone = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(org_id)
        .bind(phone)
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("n")?)
}

pub async fn append_conversation_message<'e, E>(
    exec: E,
    kind: DbKind,
    conversation_id: &str,
    entry: &crate::types::TranscriptEntry,
) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO conversation_messages (id, conversation_id, role, content, created_at)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT(id) DO NOTHING"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&entry.id)
        .bind(conversation_id)
        .bind(entry.role.as_str())
        .bind(&entry.content)
        .bind(datetime_to_i64(entry.created_at))
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn link_conversation_lead<'e, E>(exec: E, kind: DbKind, conversation_id: &str, lead_id: &str) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO conversation_leads (conversation_id, lead_id, updated_at)
           VALUES (?, ?, ?)
           ON CONFLICT(conversation_id) DO UPDATE SET lead_id = excluded.lead_id, updated_at = excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .bind(lead_id)
        .bind(datetime_to_i64(Utc::now()))
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn has_assistant_message<'e, E>(exec: E, kind: DbKind, conversation_id: &str) -> Result<bool>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        "SELECT 1 FROM conversation_messages WHERE conversation_id = ? AND role = 'assistant' LIMIT 1",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .fetch_optional(exec)
        .await?;
    Ok(row.is_some())
}

// ---- compliance audit ----

pub async fn insert_audit_event<'e, E>(exec: E, kind: DbKind, event: &crate::compliance::AuditEvent) -> Result<()>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO compliance_audit_events (
            id, event_type, org_id, conversation_id, lead_id, details, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.org_id)
        .bind(&event.conversation_id)
        .bind(&event.lead_id)
        .bind(event.details.to_string())
        .bind(datetime_to_i64(event.created_at))
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn list_audit_events<'e, E>(
    exec: E,
    kind: DbKind,
    conversation_id: &str,
) -> Result<Vec<crate::compliance::AuditEvent>>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"SELECT id, event_type, org_id, conversation_id, lead_id, details, created_at
           FROM compliance_audit_events
           WHERE conversation_id = ?
           ORDER BY created_at ASC"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .fetch_all(exec)
        .await?;
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let details: String = row.try_get("details")?;
        events.push(crate::compliance::AuditEvent {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            org_id: row.try_get("org_id")?,
            conversation_id: row.try_get("conversation_id")?,
            lead_id: row.try_get("lead_id")?,
            details: serde_json::from_str(&details)?,
            created_at: i64_to_datetime(row.try_get("created_at")?),
        });
    }
    Ok(events)
}

// ---- reply job outbox ----

/// Inserts a job keyed by `id`. Returns false when the job already exists.
pub async fn insert_reply_job<'e, E>(
    exec: E,
    kind: DbKind,
    id: &str,
    job_kind: &str,
    payload: &serde_json::Value,
    next_attempt_at: DateTime<Utc>,
) -> Result<bool>
where
    E: Executor<'e, Database = Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO reply_jobs (id, kind, payload, status, retry_count, next_attempt_at, last_error, created_at)
           VALUES (?, ?, ?, 'pending', 0, ?, NULL, ?)
           ON CONFLICT(id) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(id)
        .bind(job_kind)
        .bind(payload.to_string())
        .bind(datetime_to_i64(next_attempt_at))
        .bind(datetime_to_i64(Utc::now()))
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_reply_job(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<ReplyJobRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, kind, payload, status, retry_count, next_attempt_at,
                  COALESCE(last_error, '') AS last_error, created_at
           FROM reply_jobs WHERE id = ?"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(reply_job_from_row).transpose()
}

fn reply_job_from_row(row: &AnyRow) -> Result<ReplyJobRecord> {
    let payload: String = row.try_get("payload")?;
    let next_attempt_at: i64 = row.try_get("next_attempt_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(ReplyJobRecord {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        payload: serde_json::from_str(&payload).unwrap_or_else(|_| serde_json::json!({})),
        status: row.try_get("status")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as i32,
        next_attempt_at: i64_to_datetime(next_attempt_at),
        last_error: opt_text(row, "last_error")?,
        created_at: i64_to_datetime(created_at),
    })
}

/// Claims due jobs by moving them to `sending` and pushing `next_attempt_at` out
/// by `lease`. A `sending` job whose lease ran out is claimed again.
pub async fn claim_reply_jobs(
    pool: &AnyPool,
    kind: DbKind,
    now: DateTime<Utc>,
    lease: chrono::Duration,
    limit: i64,
) -> Result<Vec<ReplyJobRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, kind, payload, status, retry_count, next_attempt_at,
                  COALESCE(last_error, '') AS last_error, created_at
           FROM reply_jobs
           WHERE status IN ('pending','failed','sending') AND next_attempt_at <= ?
           ORDER BY created_at ASC
           LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(limit)
        .fetch_all(pool)
        .await?;

    let result = rows
        .iter()
        .map(reply_job_from_row)
        .collect::<Result<Vec<_>>>()?;

    if !result.is_empty() {
        let placeholders = result.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let base_sql = format!(
            "UPDATE reply_jobs SET status='sending', next_attempt_at=?, last_error=NULL WHERE id IN ({})",
            placeholders
        );
        let update_sql = rewrite_sql(&base_sql, kind);
        let mut query = sqlx::query(update_sql.as_ref()).bind(datetime_to_i64(now + lease));
        for job in &result {
            query = query.bind(job.id.clone());
        }
        query.execute(pool).await?;
    }

    Ok(result)
}

pub async fn mark_reply_job_delivered(pool: &AnyPool, kind: DbKind, id: &str) -> Result<()> {
    let sql = rewrite_sql("UPDATE reply_jobs SET status='delivered' WHERE id = ?", kind);
    sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    Ok(())
}

pub async fn mark_reply_job_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    status: &str,
    retry_count: i32,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE reply_jobs SET status=?, retry_count=?, next_attempt_at=?, last_error=? WHERE id=?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(status)
        .bind(retry_count as i64)
        .bind(datetime_to_i64(next_attempt_at))
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_rows(pool: &AnyPool, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(1) FROM {table}");
    sqlx::query_scalar::<_, i64>(&sql)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}
