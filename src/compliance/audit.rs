use crate::db::{self, DbKind};
use crate::types::OutboundReply;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::AnyPool;

pub const EVENT_DISCLAIMER_SENT: &str = "compliance.disclaimer_sent";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: String,
    pub org_id: String,
    pub conversation_id: String,
    pub lead_id: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn disclaimer_sent(reply: &OutboundReply, level: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: EVENT_DISCLAIMER_SENT.to_string(),
            org_id: reply.org_id.clone(),
            conversation_id: reply.conversation_id.clone(),
            lead_id: reply.lead_id.clone(),
            details: json!({
                "disclaimer_level": level,
                "disclaimer_text": text,
            }),
            created_at: Utc::now(),
        }
    }
}

/// Append-only record of compliance-relevant actions.
#[async_trait]
pub trait ComplianceAudit: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SqlComplianceAudit {
    pool: AnyPool,
    kind: DbKind,
}

impl SqlComplianceAudit {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }
}

#[async_trait]
impl ComplianceAudit for SqlComplianceAudit {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        db::insert_audit_event(&self.pool, self.kind, event).await
    }
}
