pub mod demo;
pub mod disclaimer;
pub mod failover;
pub mod persist;

pub use demo::DemoModeMessenger;
pub use disclaimer::{DisclaimerLevel, DisclaimerMessenger, SeenConversations};
pub use failover::FailoverMessenger;
pub use persist::PersistingMessenger;

use crate::channels::{telnyx::TelnyxSender, twilio::TwilioSender};
use crate::compliance::SqlComplianceAudit;
use crate::config::{ComplianceConfig, SmsConfig};
use crate::conversation::AssistantMessageChecker;
use crate::db::DbKind;
use crate::error::SendError;
use crate::types::OutboundReply;
use async_trait::async_trait;
use reqwest::Client;
use sqlx::AnyPool;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Delivers one reply. Provider senders and every decorator implement this.
#[async_trait]
pub trait ReplyMessenger: Send + Sync {
    async fn send_reply(&self, reply: &mut OutboundReply) -> Result<(), SendError>;

    fn name(&self) -> &'static str {
        "messenger"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderPreference {
    Auto,
    Telnyx,
    Twilio,
}

impl FromStr for ProviderPreference {
    type Err = SendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(ProviderPreference::Auto),
            "telnyx" => Ok(ProviderPreference::Telnyx),
            "twilio" => Ok(ProviderPreference::Twilio),
            other => Err(SendError::NotConfigured(format!(
                "unknown sms provider {other:?}"
            ))),
        }
    }
}

/// Builds the provider-level messenger.
///
/// `auto` fails over from Telnyx to Twilio when both are configured and
/// otherwise uses whichever one is. An explicit provider that is not
/// configured is an error.
pub fn build_provider_messenger(
    http: &Client,
    sms: &SmsConfig,
) -> Result<Arc<dyn ReplyMessenger>, SendError> {
    match sms.provider.parse::<ProviderPreference>()? {
        ProviderPreference::Telnyx => Ok(Arc::new(TelnyxSender::from_config(
            http.clone(),
            &sms.telnyx,
        )?)),
        ProviderPreference::Twilio => Ok(Arc::new(TwilioSender::from_config(
            http.clone(),
            &sms.twilio,
        )?)),
        ProviderPreference::Auto => {
            let telnyx = TelnyxSender::from_config(http.clone(), &sms.telnyx);
            let twilio = TwilioSender::from_config(http.clone(), &sms.twilio);
            match (telnyx, twilio) {
                (Ok(primary), Ok(secondary)) => {
                    info!("sms provider: telnyx with twilio failover");
                    Ok(Arc::new(FailoverMessenger::new(
                        Arc::new(primary),
                        Arc::new(secondary),
                    )))
                }
                (Ok(primary), Err(_)) => {
                    info!("sms provider: telnyx");
                    Ok(Arc::new(primary))
                }
                (Err(_), Ok(secondary)) => {
                    info!("sms provider: twilio");
                    Ok(Arc::new(secondary))
                }
                (Err(_), Err(_)) => Err(SendError::NotConfigured(
                    "neither telnyx nor twilio credentials are set".to_string(),
                )),
            }
        }
    }
}

/// Demo(Disclaimer(Persistence(provider))).
pub fn build_reply_chain(
    provider: Arc<dyn ReplyMessenger>,
    pool: AnyPool,
    kind: DbKind,
    compliance: &ComplianceConfig,
    checkers: Vec<Arc<dyn AssistantMessageChecker>>,
) -> Arc<dyn ReplyMessenger> {
    let mut chain: Arc<dyn ReplyMessenger> =
        Arc::new(PersistingMessenger::new(provider, pool.clone(), kind));

    let disclaimer = disclaimer::disclaimer_text(&compliance.disclaimer);
    if compliance.disclaimer.enabled && !disclaimer.is_empty() {
        let mut wrapper = DisclaimerMessenger::new(
            chain,
            disclaimer,
            compliance.disclaimer.first_message_only,
        );
        for checker in checkers {
            wrapper = wrapper.with_checker(checker);
        }
        let audit = Arc::new(SqlComplianceAudit::new(pool.clone(), kind));
        chain = Arc::new(wrapper.with_audit(audit, disclaimer::disclaimer_level_name(&compliance.disclaimer)));
    }

    if compliance.demo.enabled {
        chain = Arc::new(DemoModeMessenger::new(
            chain,
            compliance.demo.prefix.clone(),
            compliance.demo.suffix.clone(),
        ));
    }

    chain
}
