use crate::compliance::redact_pan;
use crate::db::{self, DbKind};
use crate::types::{Lead, OutboundReply, TranscriptEntry, TranscriptRole};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::AnyPool;
use tracing::warn;

#[async_trait]
pub trait LeadRepository: Send + Sync {
    async fn get_or_create_by_phone(
        &self,
        org_id: &str,
        phone: &str,
        source: &str,
        label: Option<&str>,
    ) -> anyhow::Result<Lead>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_message(&self, conversation_id: &str, entry: &TranscriptEntry) -> anyhow::Result<()>;
    async fn link_lead(&self, conversation_id: &str, lead_id: &str) -> anyhow::Result<()>;
}

/// One tier of the "has this conversation heard from the assistant" check.
#[async_trait]
pub trait AssistantMessageChecker: Send + Sync {
    async fn has_assistant_message(&self, reply: &OutboundReply) -> anyhow::Result<bool>;

    fn name(&self) -> &'static str;
}

/// Appends a sent reply to the conversation transcript as an assistant turn.
/// Replies without a conversation id are skipped and store errors are logged.
pub async fn record_assistant_reply(store: &dyn ConversationStore, reply: &OutboundReply) {
    if reply.conversation_id.trim().is_empty() {
        return;
    }
    let (content, _) = redact_pan(&reply.body);
    let entry = TranscriptEntry {
        id: uuid::Uuid::new_v4().to_string(),
        role: TranscriptRole::Assistant,
        content,
        created_at: Utc::now(),
    };
    if let Err(err) = store.append_message(&reply.conversation_id, &entry).await {
        warn!(conversation_id = %reply.conversation_id, "assistant transcript append failed: {err:?}");
    }
}

/// Heuristic: the lead row was written within `window_seconds` of `now`.
pub fn is_recently_created(lead: &Lead, now: DateTime<Utc>, window_seconds: i64) -> bool {
    now.signed_duration_since(lead.created_at) <= Duration::seconds(window_seconds)
}

#[derive(Clone)]
pub struct SqlLeadRepository {
    pool: AnyPool,
    kind: DbKind,
}

impl SqlLeadRepository {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }
}

#[async_trait]
impl LeadRepository for SqlLeadRepository {
    async fn get_or_create_by_phone(
        &self,
        org_id: &str,
        phone: &str,
        source: &str,
        label: Option<&str>,
    ) -> anyhow::Result<Lead> {
        let id = crate::phone::lead_id(org_id, phone);
        db::get_or_create_lead(&self.pool, self.kind, &id, org_id, phone, source, label).await
    }
}

/// Transcript tables owned by this service.
#[derive(Clone)]
pub struct SqlConversationStore {
    pool: AnyPool,
    kind: DbKind,
}

impl SqlConversationStore {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }
}

#[async_trait]
impl ConversationStore for SqlConversationStore {
    async fn append_message(&self, conversation_id: &str, entry: &TranscriptEntry) -> anyhow::Result<()> {
        db::append_conversation_message(&self.pool, self.kind, conversation_id, entry).await
    }

    async fn link_lead(&self, conversation_id: &str, lead_id: &str) -> anyhow::Result<()> {
        db::link_conversation_lead(&self.pool, self.kind, conversation_id, lead_id).await
    }
}

#[async_trait]
impl AssistantMessageChecker for SqlConversationStore {
    async fn has_assistant_message(&self, reply: &OutboundReply) -> anyhow::Result<bool> {
        db::has_assistant_message(&self.pool, self.kind, &reply.conversation_id).await
    }

    fn name(&self) -> &'static str {
        "conversation_store"
    }
}

/// Looks for an earlier outbound SMS from the clinic to the same recipient.
#[derive(Clone)]
pub struct SqlMessageHistory {
    pool: AnyPool,
    kind: DbKind,
}

impl SqlMessageHistory {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }
}

#[async_trait]
impl AssistantMessageChecker for SqlMessageHistory {
    async fn has_assistant_message(&self, reply: &OutboundReply) -> anyhow::Result<bool> {
        if reply.org_id.is_empty() || reply.to.is_empty() {
            return Ok(false);
        }
        db::has_outbound_message(&self.pool, self.kind, &reply.org_id, &reply.to).await
    }

    fn name(&self) -> &'static str {
        "message_history"
    }
}
