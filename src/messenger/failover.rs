use super::ReplyMessenger;
use crate::error::SendError;
use crate::types::OutboundReply;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

/// Sends through `primary`, falling back to `secondary` on any error.
pub struct FailoverMessenger {
    primary: Arc<dyn ReplyMessenger>,
    secondary: Arc<dyn ReplyMessenger>,
}

impl FailoverMessenger {
    pub fn new(primary: Arc<dyn ReplyMessenger>, secondary: Arc<dyn ReplyMessenger>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl ReplyMessenger for FailoverMessenger {
    async fn send_reply(&self, reply: &mut OutboundReply) -> Result<(), SendError> {
        let err = match self.primary.send_reply(reply).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        warn!(
            primary = self.primary.name(),
            secondary = self.secondary.name(),
            conversation_id = %reply.conversation_id,
            "primary sms provider failed, failing over: {err}"
        );

        self.secondary.send_reply(reply).await.map_err(|err| {
            error!(
                secondary = self.secondary.name(),
                conversation_id = %reply.conversation_id,
                "secondary sms provider failed: {err}"
            );
            err
        })
    }

    fn name(&self) -> &'static str {
        "failover"
    }
}
