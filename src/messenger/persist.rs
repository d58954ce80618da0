use super::ReplyMessenger;
use crate::compliance::redact_pan;
use crate::db::{self, DbKind, MessageRecord, StatusUpdate};
use crate::error::SendError;
use crate::types::{OutboundReply, META_MESSAGE_ID};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::AnyPool;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Records every outbound send in `messages`. Store failures never block delivery.
pub struct PersistingMessenger {
    inner: Arc<dyn ReplyMessenger>,
    pool: AnyPool,
    kind: DbKind,
}

impl PersistingMessenger {
    pub fn new(inner: Arc<dyn ReplyMessenger>, pool: AnyPool, kind: DbKind) -> Self {
        Self { inner, pool, kind }
    }

    async fn record_outcome(&self, id: &str, reply: &OutboundReply, result: &Result<(), SendError>) {
        let now = Utc::now();
        let update = match result {
            Ok(()) => StatusUpdate::new(db::STATUS_SENT).delivered(now),
            Err(err) => StatusUpdate::new(db::STATUS_FAILED).failed(now, err.to_string()),
        };
        if let Err(err) = db::update_message_status_by_id(&self.pool, self.kind, id, &update).await {
            warn!(message_id = id, "failed to update outbound message status: {err:?}");
        }

        if let Some(provider_id) = reply.provider_message_id() {
            if let Err(err) =
                db::update_message_provider_id(&self.pool, self.kind, id, provider_id).await
            {
                warn!(message_id = id, provider_message_id = provider_id, "failed to record provider message id: {err:?}");
            }
        }
    }
}

#[async_trait]
impl ReplyMessenger for PersistingMessenger {
    async fn send_reply(&self, reply: &mut OutboundReply) -> Result<(), SendError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let (body, _) = redact_pan(&reply.body);

        let mut record = MessageRecord::new(
            &id,
            &reply.org_id,
            &reply.from,
            &reply.to,
            db::DIRECTION_OUTBOUND,
            body,
            db::STATUS_PENDING,
        );
        record.send_attempts = 1;
        record.last_attempt_at = Some(now);

        let persisted = match db::insert_message(&self.pool, self.kind, &record).await {
            Ok(()) => {
                reply.metadata.insert(META_MESSAGE_ID.to_string(), id.clone());
                true
            }
            Err(err) => {
                warn!(org_id = %reply.org_id, conversation_id = %reply.conversation_id, "failed to persist outbound message: {err:?}");
                false
            }
        };

        let result = self.inner.send_reply(reply).await;
        if persisted {
            self.record_outcome(&id, reply, &result).await;
        }
        result
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
