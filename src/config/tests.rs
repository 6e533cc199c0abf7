//! Config module tests

use std::io::Write;

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("MQX_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${MQX_TEST_VAR_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("MQX_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("MQX_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${MQX_TEST_VAR_UNSET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"fallback\"");

    std::env::set_var("MQX_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${MQX_TEST_VAR_SET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("MQX_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("MQX_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${MQX_TEST_VAR_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.inflight.retry_timeout, Duration::from_secs(10));
    assert_eq!(config.inflight.max_retries, 3);
    assert_eq!(config.session.receive_maximum, 65535);
    assert_eq!(config.session.max_packet_size, 0);
    assert_eq!(config.exchange.offline_queue_capacity, 1000);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_human_durations() {
    let config = Config::parse(
        r#"
[inflight]
retry_timeout = "1500ms"
max_retries = 5

[exchange]
sweep_interval = "10s"
session_expiry = "2h"
"#,
    )
    .unwrap();

    assert_eq!(config.inflight.retry_timeout, Duration::from_millis(1500));
    assert_eq!(config.inflight.max_retries, 5);
    // Untouched keys keep their defaults
    assert_eq!(config.inflight.poll_interval, Duration::from_secs(1));
    assert_eq!(config.exchange.sweep_interval, Duration::from_secs(10));
    assert_eq!(config.exchange.session_expiry, Duration::from_secs(7200));
}

#[test]
fn test_validation_rejects_zero_limits() {
    for content in [
        "[session]\nreceive_maximum = 0",
        "[inflight]\npoll_interval = \"0s\"",
        "[exchange]\nsweep_interval = \"0s\"",
        "[exchange]\noffline_queue_capacity = 0",
        "[log]\nlevel = \"verbose\"",
    ] {
        assert!(
            matches!(Config::parse(content), Err(ConfigError::Validation(_))),
            "accepted: {}",
            content
        );
    }
}

#[test]
fn test_parse_error() {
    assert!(matches!(
        Config::parse("[inflight]\nmax_retries = \"many\""),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.exchange.idle_timeout, Duration::from_secs(300));
}

#[test]
fn test_load_config_with_env_substitution() {
    std::env::set_var("MQX_TEST_ALIAS_MAX", "32");
    std::env::remove_var("MQX_TEST_CAPACITY");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[session]
topic_alias_maximum = ${{MQX_TEST_ALIAS_MAX}}

[exchange]
offline_queue_capacity = ${{MQX_TEST_CAPACITY:-64}}
idle_timeout = "90s"
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.session.topic_alias_maximum, 32);
    assert_eq!(config.exchange.offline_queue_capacity, 64);
    assert_eq!(config.exchange.idle_timeout, Duration::from_secs(90));

    std::env::remove_var("MQX_TEST_ALIAS_MAX");
}

#[test]
fn test_load_env_override() {
    std::env::set_var("MQTT_EXCHANGE__INFLIGHT__MAX_RETRIES", "7");

    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml"));
    std::env::remove_var("MQTT_EXCHANGE__INFLIGHT__MAX_RETRIES");

    assert_eq!(config.unwrap().inflight.max_retries, 7);
}
