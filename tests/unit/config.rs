use clinic_sms::config::{
    apply_env_overrides, expand_tilde, resolve_config_path, resolve_database_url, Config,
};

#[test]
fn test_default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 8092);
    assert!(cfg.server.public_base_url.is_none());
    assert!(cfg.auth.token.is_none());
    assert_eq!(cfg.sms.provider, "auto");
    assert!(cfg.sms.webhook_secret.is_none());
    assert!(!cfg.sms.skip_signature);
    assert!(cfg.orgs.is_empty());
}

#[test]
fn test_default_database_config() {
    let cfg = Config::default();
    assert!(cfg.database.url.is_none());
    assert_eq!(cfg.database.sqlite_path, "~/.clinic-sms/state.sqlite");
}

#[test]
fn test_default_compliance_config() {
    let cfg = Config::default();
    assert!(cfg.compliance.keywords_enabled);
    assert!(cfg.compliance.disclaimer.enabled);
    assert_eq!(cfg.compliance.disclaimer.level, "medium");
    assert!(cfg.compliance.disclaimer.first_message_only);
    assert!(!cfg.compliance.demo.enabled);
    assert!(!cfg.compliance.require_activated_number);
}

#[test]
fn test_default_ingress_and_retry() {
    let cfg = Config::default();
    assert_eq!(cfg.ingress.ack_timeout_ms, 2000);
    assert_eq!(cfg.ingress.enqueue_timeout_ms, 3000);
    assert_eq!(cfg.ingress.new_lead_window_seconds, 5);
    assert!(cfg.retry.enabled);
    assert_eq!(cfg.retry.max_attempts, 5);
    assert_eq!(cfg.retry.base_delay_seconds, 300);
}

#[test]
fn test_default_ack_pools_mention_clinic() {
    let cfg = Config::default();
    assert!(!cfg.acks.first_sms.is_empty());
    assert!(cfg.acks.first_sms.iter().all(|v| v.contains("{clinic}")));
    assert!(!cfg.acks.first_missed_call.is_empty());
}

#[test]
fn test_org_lookup() {
    let cfg: Config = serde_json::from_str(
        r#"{"orgs":[
            {"org_id":"org-1","numbers":["+15550001111"],"clinic_name":"Glow Med Spa"},
            {"org_id":"org-2","numbers":["+15550002222"],
             "quiet_hours":{"enabled":true,"start":"21:00","end":"07:30","timezone":"America/New_York"}}
        ]}"#,
    )
    .unwrap();
    assert_eq!(
        cfg.org("org-1").and_then(|o| o.clinic_name.as_deref()),
        Some("Glow Med Spa")
    );
    let qh = cfg.org("org-2").and_then(|o| o.quiet_hours.clone()).unwrap();
    assert!(qh.enabled);
    assert_eq!(qh.timezone, "America/New_York");
    assert!(cfg.org("org-3").is_none());
}

#[test]
fn test_env_overrides() {
    std::env::set_var("TWILIO_ACCOUNT_SID", "AC_env");
    std::env::set_var("TWILIO_AUTH_TOKEN", "auth_env");
    std::env::set_var("SMS_PROVIDER", " Twilio ");
    std::env::set_var("CLINIC_SMS_TOKEN", "api_env");

    let mut cfg = Config::default();
    apply_env_overrides(&mut cfg);

    std::env::remove_var("TWILIO_ACCOUNT_SID");
    std::env::remove_var("TWILIO_AUTH_TOKEN");
    std::env::remove_var("SMS_PROVIDER");
    std::env::remove_var("CLINIC_SMS_TOKEN");

    assert_eq!(cfg.sms.twilio.account_sid.as_deref(), Some("AC_env"));
    assert_eq!(cfg.sms.twilio.auth_token.as_deref(), Some("auth_env"));
    assert_eq!(cfg.sms.webhook_secret.as_deref(), Some("auth_env"));
    assert_eq!(cfg.sms.provider, "twilio");
    assert_eq!(cfg.auth.token.as_deref(), Some("api_env"));
    assert!(cfg.sms.twilio.is_configured());
}

#[test]
fn test_expand_tilde() {
    let expanded = expand_tilde("~/test/path");
    assert!(expanded.to_string_lossy().contains("test/path"));
}

#[test]
fn test_expand_tilde_no_tilde() {
    let expanded = expand_tilde("/absolute/path");
    assert_eq!(expanded.to_string_lossy(), "/absolute/path");
}

#[test]
fn test_resolve_config_path_default() {
    std::env::remove_var("CLINIC_SMS_CONFIG");
    let path = resolve_config_path();
    assert!(path.to_string_lossy().contains(".clinic-sms"));
    assert!(path.to_string_lossy().contains("clinic-sms.json"));
}

#[test]
fn test_resolve_database_url_postgres() {
    let mut cfg = Config::default();
    cfg.database.url = Some("postgres://localhost/testdb".to_string());
    let url = resolve_database_url(&cfg);
    assert_eq!(url, "postgres://localhost/testdb");
}
