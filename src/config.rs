use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub backend: BackendConfig,
    pub sms: SmsConfig,
    pub compliance: ComplianceConfig,
    pub ingress: IngressConfig,
    pub retry: RetryConfig,
    pub acks: AckConfig,
    pub orgs: Vec<OrgBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public origin the provider signs webhooks against, e.g. `https://sms.example.com`.
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.clinic-sms/state.sqlite".to_string(),
        }
    }
}

/// Where reply jobs are delivered for the conversation worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub webhook_url: Option<String>,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    /// `auto`, `telnyx` or `twilio`.
    pub provider: String,
    pub webhook_secret: Option<String>,
    pub skip_signature: bool,
    pub twilio: TwilioConfig,
    pub telnyx: TelnyxConfig,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            provider: "auto".to_string(),
            webhook_secret: None,
            skip_signature: false,
            twilio: TwilioConfig::default(),
            telnyx: TelnyxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub api_base: String,
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            from_number: None,
            api_base: "https://api.twilio.com".to_string(),
        }
    }
}

impl TwilioConfig {
    pub fn is_configured(&self) -> bool {
        non_empty(&self.account_sid) && non_empty(&self.auth_token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnyxConfig {
    pub api_key: Option<String>,
    pub messaging_profile_id: Option<String>,
    pub from_number: Option<String>,
    pub api_base: String,
    /// HMAC key for the `Telnyx-Signature` header on inbound webhooks.
    pub webhook_secret: Option<String>,
    pub signature_max_skew_seconds: i64,
}

impl Default for TelnyxConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            messaging_profile_id: None,
            from_number: None,
            api_base: "https://api.telnyx.com".to_string(),
            webhook_secret: None,
            signature_max_skew_seconds: 300,
        }
    }
}

impl TelnyxConfig {
    pub fn is_configured(&self) -> bool {
        non_empty(&self.api_key)
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub disclaimer: DisclaimerConfig,
    pub demo: DemoConfig,
    pub keywords_enabled: bool,
    pub stop_reply: String,
    pub help_reply: String,
    pub start_reply: String,
    pub require_activated_number: bool,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            disclaimer: DisclaimerConfig::default(),
            demo: DemoConfig::default(),
            keywords_enabled: true,
            stop_reply: "You have been unsubscribed and will no longer receive messages. Reply START to resubscribe.".to_string(),
            help_reply: "Reply STOP to unsubscribe. For help, call the clinic directly. Msg & data rates may apply.".to_string(),
            start_reply: "You have been resubscribed. Reply STOP to unsubscribe.".to_string(),
            require_activated_number: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisclaimerConfig {
    pub enabled: bool,
    /// `short`, `medium` or `full`.
    pub level: String,
    pub custom_text: Option<String>,
    pub first_message_only: bool,
}

impl Default for DisclaimerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "medium".to_string(),
            custom_text: None,
            first_message_only: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub enabled: bool,
    pub prefix: String,
    pub suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub ack_timeout_ms: u64,
    pub enqueue_timeout_ms: u64,
    pub new_lead_window_seconds: i64,
    pub job_delay_ms: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2000,
            enqueue_timeout_ms: 3000,
            new_lead_window_seconds: 5,
            job_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: i64,
    pub batch_size: i64,
    pub poll_seconds: u64,
    pub base_delay_seconds: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            batch_size: 25,
            poll_seconds: 60,
            base_delay_seconds: 300,
        }
    }
}

/// Acknowledgement copy. `{clinic}` is replaced with the clinic name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AckConfig {
    pub first_sms: Vec<String>,
    pub returning_sms: Vec<String>,
    pub first_missed_call: Vec<String>,
    pub returning_missed_call: Vec<String>,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            first_sms: vec![
                "Thanks for texting {clinic}! Give me a moment to help you. Reply STOP to opt out.".to_string(),
                "Hi! You've reached {clinic}. One moment while I look into that. Reply STOP to opt out.".to_string(),
            ],
            returning_sms: vec![
                "Got it - give me a moment to help you.".to_string(),
                "Thanks! One moment while I check on that.".to_string(),
            ],
            first_missed_call: vec![
                "Hi there! Sorry we missed your call. I'm the virtual receptionist and can answer questions or book an appointment. Which service are you interested in? Reply STOP to opt out.".to_string(),
            ],
            returning_missed_call: vec![
                "Sorry we missed your call! I'm the virtual receptionist for {clinic}. How can I help today?".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHoursConfig {
    pub enabled: bool,
    pub start: String,
    pub end: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgBinding {
    pub org_id: String,
    pub numbers: Vec<String>,
    pub clinic_name: Option<String>,
    pub quiet_hours: Option<QuietHoursConfig>,
}

impl Config {
    pub fn org(&self, org_id: &str) -> Option<&OrgBinding> {
        self.orgs.iter().find(|o| o.org_id == org_id)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("CLINIC_SMS_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.clinic-sms/clinic-sms.json"))
}

fn env_override(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            match serde_json::from_str::<Config>(&raw) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(err) => tracing::warn!(path = %config_path.display(), "ignoring invalid config file: {err}"),
            }
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(token) = env_override("CLINIC_SMS_TOKEN") {
        cfg.auth.token = Some(token);
    }
    if let Some(url) = env_override("CLINIC_SMS_DATABASE_URL") {
        cfg.database.url = Some(url);
    }
    if let Some(path) = env_override("CLINIC_SMS_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }
    if let Some(url) = env_override("CLINIC_SMS_BACKEND_WEBHOOK_URL") {
        cfg.backend.webhook_url = Some(url);
    }
    if let Some(token) = env_override("CLINIC_SMS_BACKEND_TOKEN") {
        cfg.backend.api_token = Some(token);
    }
    if let Some(url) = env_override("CLINIC_SMS_PUBLIC_BASE_URL") {
        cfg.server.public_base_url = Some(url);
    }
    if let Some(secret) = env_override("CLINIC_SMS_WEBHOOK_SECRET") {
        cfg.sms.webhook_secret = Some(secret);
    }
    if let Some(provider) = env_override("SMS_PROVIDER") {
        cfg.sms.provider = provider.trim().to_lowercase();
    }
    if let Some(sid) = env_override("TWILIO_ACCOUNT_SID") {
        cfg.sms.twilio.account_sid = Some(sid);
    }
    if let Some(token) = env_override("TWILIO_AUTH_TOKEN") {
        // Twilio signs webhooks with the account auth token.
        if cfg.sms.webhook_secret.is_none() {
            cfg.sms.webhook_secret = Some(token.clone());
        }
        cfg.sms.twilio.auth_token = Some(token);
    }
    if let Some(from) = env_override("TWILIO_FROM_NUMBER") {
        cfg.sms.twilio.from_number = Some(from);
    }
    if let Some(key) = env_override("TELNYX_API_KEY") {
        cfg.sms.telnyx.api_key = Some(key);
    }
    if let Some(profile) = env_override("TELNYX_MESSAGING_PROFILE_ID") {
        cfg.sms.telnyx.messaging_profile_id = Some(profile);
    }
    if let Some(from) = env_override("TELNYX_FROM_NUMBER") {
        cfg.sms.telnyx.from_number = Some(from);
    }
    if let Some(secret) = env_override("TELNYX_WEBHOOK_SECRET") {
        cfg.sms.telnyx.webhook_secret = Some(secret);
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}
