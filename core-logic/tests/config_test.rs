use fanout_core::config::{MAX_COUNT, MAX_DELAY_SECS, MAX_RETRY_AFTER_MS, MIN_DELAY_SECS};
use fanout_core::{ConfigError, DispatchConfig, EgressPolicy, JobRequest};
use std::io::Write;
use std::path::PathBuf;

#[test]
fn test_job_bounds() {
    assert!(JobRequest::new("@target", "spam", 1, MIN_DELAY_SECS)
        .validate()
        .is_ok());
    assert!(JobRequest::new("@target", "spam", MAX_COUNT, MAX_DELAY_SECS)
        .validate()
        .is_ok());

    for job in [
        JobRequest::new("@target", "spam", 0, 1.0),
        JobRequest::new("@target", "spam", MAX_COUNT + 1, 1.0),
        JobRequest::new("@target", "spam", 10, 0.05),
        JobRequest::new("@target", "spam", 10, 5.5),
        JobRequest::new("@target", "spam", 10, f64::NAN),
    ] {
        assert!(
            matches!(job.validate(), Err(ConfigError::InvalidValue { .. })),
            "{:?} should be rejected",
            job
        );
    }
}

#[test]
fn test_blank_target_is_missing() {
    let err = JobRequest::new("  ", "spam", 5, 1.0).validate().unwrap_err();
    match err {
        ConfigError::MissingField { field } => assert_eq!(field, "target"),
        other => panic!("Expected MissingField, got {:?}", other),
    }
}

#[test]
fn test_dispatch_config_defaults() {
    let config = DispatchConfig::default();
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.backoff_min_ms, 5_000);
    assert_eq!(config.backoff_max_ms, 60_000);
    assert_eq!(config.egress_file, PathBuf::from("proxies.txt"));
    assert_eq!(config.egress_policy, EgressPolicy::UseAll);
    assert!(config.probe_on_first_use);
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let config = DispatchConfig::from_toml_str(
        r#"
max_retries = 1
egress_policy = "skip_unverified"
"#,
    )
    .unwrap();
    assert_eq!(config.max_retries, 1);
    assert_eq!(config.egress_policy, EgressPolicy::SkipUnverified);
    assert_eq!(config.identity_count, 10);
}

#[test]
fn test_inverted_backoff_rejected() {
    let result = DispatchConfig::from_toml_str("backoff_min_ms = 9000\nbackoff_max_ms = 1000\n");
    assert!(result.is_err());
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "identity_count = 4").unwrap();
    writeln!(file, "egress_file = \"custom.txt\"").unwrap();
    writeln!(file, "probe_timeout_ms = 250").unwrap();

    let config = DispatchConfig::from_path(file.path()).unwrap();
    assert_eq!(config.identity_count, 4);
    assert_eq!(config.egress_file, PathBuf::from("custom.txt"));
    assert_eq!(config.probe_timeout().as_millis(), 250);
}

#[test]
fn test_missing_config_file() {
    assert!(DispatchConfig::from_path("/nonexistent/fanout.toml").is_err());
}

#[test]
fn test_policy_parsing() {
    assert_eq!("all".parse::<EgressPolicy>().unwrap(), EgressPolicy::UseAll);
    assert_eq!(
        "Skip_Unverified".parse::<EgressPolicy>().unwrap(),
        EgressPolicy::SkipUnverified
    );
    assert!("sometimes".parse::<EgressPolicy>().is_err());
}

#[test]
fn test_retry_cooldown_cap_bounds() {
    let config = DispatchConfig::default();
    assert_eq!(config.max_retry_after().as_secs(), 3_600);

    assert!(DispatchConfig::from_toml_str("max_retry_after_ms = 0\n").is_err());
    let too_long = format!("max_retry_after_ms = {}\n", MAX_RETRY_AFTER_MS + 1);
    assert!(DispatchConfig::from_toml_str(&too_long).is_err());
    let longest = format!("max_retry_after_ms = {}\n", MAX_RETRY_AFTER_MS);
    assert!(DispatchConfig::from_toml_str(&longest).is_ok());
}
