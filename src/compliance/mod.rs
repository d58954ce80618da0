pub mod audit;
pub mod keywords;
pub mod pan;
pub mod quiet_hours;

pub use audit::{AuditEvent, ComplianceAudit, SqlComplianceAudit};
pub use keywords::{KeywordDetector, KeywordKind};
pub use pan::{luhn_valid, redact_pan};
pub use quiet_hours::QuietHours;

use crate::db::{self, DbKind};
use crate::types::{OutboundReply, Purpose};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::AnyPool;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Suppress { reason: String },
    Defer { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GatePolicy {
    pub quiet_hours: QuietHours,
    pub require_activated_number: bool,
}

/// Decides whether `reply` may go out now.
///
/// Opt-out and quiet hours only apply to marketing sends. The activated
/// number check applies to every purpose when enabled.
pub async fn evaluate_send(
    pool: &AnyPool,
    kind: DbKind,
    reply: &OutboundReply,
    purpose: Purpose,
    policy: &GatePolicy,
    now: DateTime<Utc>,
) -> anyhow::Result<GateDecision> {
    if purpose == Purpose::Marketing
        && db::is_unsubscribed(pool, kind, &reply.org_id, &reply.to).await?
    {
        return Ok(GateDecision::Suppress {
            reason: "recipient unsubscribed".to_string(),
        });
    }

    if policy.quiet_hours.suppress(now, purpose) {
        return Ok(GateDecision::Defer {
            until: policy.quiet_hours.window_end(now, purpose),
        });
    }

    if policy.require_activated_number && !reply.from.is_empty() {
        let owner = db::lookup_activated_clinic(pool, kind, &reply.from).await?;
        if owner.as_deref() != Some(reply.org_id.as_str()) {
            return Ok(GateDecision::Suppress {
                reason: "sending number not activated".to_string(),
            });
        }
    }

    Ok(GateDecision::Allow)
}
