use super::ReplyMessenger;
use crate::compliance::{AuditEvent, ComplianceAudit};
use crate::config::DisclaimerConfig;
use crate::conversation::AssistantMessageChecker;
use crate::error::SendError;
use crate::types::OutboundReply;
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisclaimerLevel {
    Short,
    Medium,
    Full,
}

impl DisclaimerLevel {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "medium" => DisclaimerLevel::Medium,
            "short" => DisclaimerLevel::Short,
            "full" => DisclaimerLevel::Full,
            _ => DisclaimerLevel::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisclaimerLevel::Short => "short",
            DisclaimerLevel::Medium => "medium",
            DisclaimerLevel::Full => "full",
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            DisclaimerLevel::Short => "Auto-assistant. Not medical advice.",
            DisclaimerLevel::Medium => {
                "This is an automated assistant. For medical advice, please consult your provider."
            }
            DisclaimerLevel::Full => {
                "This is an automated scheduling assistant. The information provided is general in nature and not a substitute for professional medical advice. Please consult with a licensed healthcare provider for medical guidance."
            }
        }
    }
}

/// Level label recorded in the audit trail; "custom" when custom text overrides the level.
pub fn disclaimer_level_name(cfg: &DisclaimerConfig) -> &'static str {
    match cfg.custom_text.as_deref().map(str::trim) {
        Some(custom) if !custom.is_empty() => "custom",
        _ => DisclaimerLevel::parse(&cfg.level).as_str(),
    }
}

pub fn disclaimer_text(cfg: &DisclaimerConfig) -> String {
    match cfg.custom_text.as_deref().map(str::trim) {
        Some(custom) if !custom.is_empty() => custom.to_string(),
        _ => DisclaimerLevel::parse(&cfg.level).text().to_string(),
    }
}

/// Appends `disclaimer` after a blank line unless the body already contains it.
pub fn append_disclaimer(body: &str, disclaimer: &str) -> String {
    if disclaimer.is_empty() || body.contains(disclaimer) {
        return body.to_string();
    }
    format!("{}\n\n{}", body.trim(), disclaimer)
}

/// Process-local set of conversations that already received an assistant message.
#[derive(Debug, Default)]
pub struct SeenConversations {
    inner: DashSet<String>,
}

impl SeenConversations {
    pub fn contains(&self, conversation_id: &str) -> bool {
        self.inner.contains(conversation_id)
    }

    /// Returns true when this call inserted the id.
    pub fn mark(&self, conversation_id: &str) -> bool {
        self.inner.insert(conversation_id.to_string())
    }
}

#[async_trait]
impl AssistantMessageChecker for SeenConversations {
    async fn has_assistant_message(&self, reply: &OutboundReply) -> anyhow::Result<bool> {
        Ok(self.contains(&reply.conversation_id))
    }

    fn name(&self) -> &'static str {
        "seen_cache"
    }
}

/// Adds the compliance disclaimer to the first assistant message of a
/// conversation, or to every message when `first_only` is off.
pub struct DisclaimerMessenger {
    inner: Arc<dyn ReplyMessenger>,
    text: String,
    first_only: bool,
    seen: Arc<SeenConversations>,
    checkers: Vec<Arc<dyn AssistantMessageChecker>>,
    audit: Option<(Arc<dyn ComplianceAudit>, String)>,
}

impl DisclaimerMessenger {
    pub fn new(inner: Arc<dyn ReplyMessenger>, text: String, first_only: bool) -> Self {
        let seen = Arc::new(SeenConversations::default());
        let checkers: Vec<Arc<dyn AssistantMessageChecker>> = vec![seen.clone()];
        Self {
            inner,
            text,
            first_only,
            seen,
            checkers,
            audit: None,
        }
    }

    /// Records a `compliance.disclaimer_sent` event after each successful
    /// send that carried the disclaimer.
    pub fn with_audit(mut self, audit: Arc<dyn ComplianceAudit>, level: impl Into<String>) -> Self {
        self.audit = Some((audit, level.into()));
        self
    }

    /// Appends a checker consulted after the ones already registered.
    pub fn with_checker(mut self, checker: Arc<dyn AssistantMessageChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    pub fn seen(&self) -> &Arc<SeenConversations> {
        &self.seen
    }

    async fn is_first_assistant_message(&self, reply: &OutboundReply) -> bool {
        if reply.conversation_id.trim().is_empty() {
            return true;
        }

        for checker in &self.checkers {
            match checker.has_assistant_message(reply).await {
                Ok(true) => {
                    debug!(checker = checker.name(), conversation_id = %reply.conversation_id, "conversation already has an assistant message");
                    self.seen.mark(&reply.conversation_id);
                    return false;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(checker = checker.name(), conversation_id = %reply.conversation_id, "assistant message check unavailable: {err:?}");
                }
            }
        }

        // A concurrent send that marked the conversation first wins.
        self.seen.mark(&reply.conversation_id)
    }

    async fn record_audit(&self, reply: &OutboundReply) {
        let Some((audit, level)) = self.audit.as_ref() else {
            return;
        };
        let event = AuditEvent::disclaimer_sent(reply, level, &self.text);
        if let Err(err) = audit.record(&event).await {
            warn!(conversation_id = %reply.conversation_id, "disclaimer audit failed: {err:?}");
        }
    }
}

#[async_trait]
impl ReplyMessenger for DisclaimerMessenger {
    async fn send_reply(&self, reply: &mut OutboundReply) -> Result<(), SendError> {
        let first = !self.first_only || self.is_first_assistant_message(reply).await;
        if !first {
            return self.inner.send_reply(reply).await;
        }

        let mut wrapped = reply.clone();
        wrapped.body = append_disclaimer(&reply.body, &self.text);
        let added = wrapped.body != reply.body;
        if added {
            info!(org_id = %reply.org_id, conversation_id = %reply.conversation_id, "disclaimer added");
        }
        let result = self.inner.send_reply(&mut wrapped).await;
        reply.metadata = wrapped.metadata;
        if added && result.is_ok() {
            self.record_audit(reply).await;
        }
        result
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
