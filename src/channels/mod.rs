pub mod telnyx;
pub mod twilio;

use crate::error::SendError;
use crate::types::OutboundReply;
use rand::Rng;
use reqwest::RequestBuilder;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Per-send retry budget for provider HTTP calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn jitter(&self) -> Duration {
        let min = self.min_backoff.as_millis() as u64;
        let max = self.max_backoff.as_millis() as u64;
        if max <= min {
            return self.min_backoff;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Issues the request built by `build` until it succeeds, fails with a
/// non-retryable status, or the attempt budget runs out. Network errors,
/// 5xx and 429 are retried.
pub(crate) async fn send_with_retry<F>(
    provider: &'static str,
    policy: &RetryPolicy,
    build: F,
) -> Result<Value, SendError>
where
    F: Fn() -> RequestBuilder,
{
    let attempts = policy.attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp.json::<Value>().await.unwrap_or(Value::Null));
                }
                let body = resp.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(provider, attempt, status = status.as_u16(), "provider send failed, retrying");
                    last_err = Some(SendError::Transient {
                        provider,
                        message: format!("{status} {body}"),
                    });
                } else {
                    return Err(SendError::Permanent {
                        provider,
                        status: status.as_u16(),
                        message: body,
                    });
                }
            }
            Err(err) => {
                warn!(provider, attempt, "provider request error: {err}");
                last_err = Some(SendError::Transient {
                    provider,
                    message: err.to_string(),
                });
            }
        }
        if attempt < attempts {
            sleep(policy.jitter()).await;
        }
    }

    Err(last_err.unwrap_or(SendError::Transient {
        provider,
        message: "no attempts made".to_string(),
    }))
}

/// Checks the reply is sendable and returns the sender number to use.
pub(crate) fn resolve_sender<'a>(
    reply: &'a OutboundReply,
    default_from: Option<&'a str>,
) -> Result<&'a str, SendError> {
    if reply.to.trim().is_empty() {
        return Err(SendError::Invalid("missing recipient".to_string()));
    }
    if reply.body.trim().is_empty() {
        return Err(SendError::Invalid("empty body".to_string()));
    }
    let from = if reply.from.trim().is_empty() {
        default_from.unwrap_or_default()
    } else {
        reply.from.as_str()
    };
    if from.trim().is_empty() {
        return Err(SendError::Invalid("missing sender number".to_string()));
    }
    Ok(from)
}
