use super::ReplyMessenger;
use crate::error::SendError;
use crate::types::OutboundReply;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const SMS_SEGMENT_CHARS: usize = 160;

/// Wraps every body with a fixed prefix and suffix so it matches the
/// registered campaign sample.
pub struct DemoModeMessenger {
    inner: Arc<dyn ReplyMessenger>,
    prefix: String,
    suffix: String,
}

impl DemoModeMessenger {
    pub fn new(inner: Arc<dyn ReplyMessenger>, prefix: String, suffix: String) -> Self {
        Self {
            inner,
            prefix,
            suffix,
        }
    }

    pub fn wrap_body(&self, body: &str) -> String {
        format!("{}{}{}", self.prefix, body.trim(), self.suffix)
    }
}

#[async_trait]
impl ReplyMessenger for DemoModeMessenger {
    async fn send_reply(&self, reply: &mut OutboundReply) -> Result<(), SendError> {
        let mut wrapped = reply.clone();
        wrapped.body = self.wrap_body(&reply.body);
        let len = wrapped.body.chars().count();
        if len > SMS_SEGMENT_CHARS {
            debug!(conversation_id = %reply.conversation_id, len, "demo-wrapped body exceeds one sms segment");
        }

        let result = self.inner.send_reply(&mut wrapped).await;
        reply.metadata = wrapped.metadata;
        result
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
