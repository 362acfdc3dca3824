use std::{collections::HashMap, time::Duration};

use super::{RelayConfig, WebhookConfig};

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn test_defaults_follow_batch_size() {
    let config = RelayConfig::default();
    assert_eq!(config.websocket_port, 8765);
    assert_eq!(config.batch_size, 4);
    assert_eq!(config.frame_interval(), Duration::from_millis(250));
    assert_eq!(config.receiver_queue(), 12);
    assert_eq!(config.transformer_backlog(), 8);
    assert_eq!(config.transformer_queue(), 16);
    assert_eq!(config.broadcaster_backlog(), 4);
    assert_eq!(config.heartbeat_timeout(), Duration::from_secs(90));
}

#[test]
fn test_missing_password_is_rejected() {
    let config = RelayConfig::default();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("SERVER_PASSWORD"));
}

#[test]
fn test_env_overrides() {
    let mut config = RelayConfig::default();
    config
        .apply_env(env(&[
            ("SERVER_PASSWORD", "hunter2"),
            ("WEBSOCKET_PORT", "9000"),
            ("BATCH_SIZE", "2"),
            ("FRAME_INTERVAL_MS", "100"),
            ("TRANSFORMER_URL", "http://gpu:7000/transform"),
        ]))
        .unwrap();
    config.validate().unwrap();

    assert_eq!(config.server_password, "hunter2");
    assert_eq!(config.websocket_port, 9000);
    assert_eq!(config.batch_size, 2);
    assert_eq!(config.receiver_queue(), 6);
    assert_eq!(config.frame_interval(), Duration::from_millis(100));
    assert_eq!(
        config.transformer_url.as_deref(),
        Some("http://gpu:7000/transform")
    );
}

#[test]
fn test_invalid_number_names_the_variable() {
    let mut config = RelayConfig::default();
    let err = config
        .apply_env(env(&[("BATCH_SIZE", "four")]))
        .unwrap_err();
    assert!(format!("{:#}", err).contains("BATCH_SIZE"));
}

#[test]
fn test_webhook_from_env() {
    let mut config = RelayConfig::default();
    config
        .apply_env(env(&[
            ("READY_WEBHOOK_URL", "http://hooks/ready"),
            ("RUNPOD_POD_ID", "pod-7"),
        ]))
        .unwrap();
    assert_eq!(
        config.ready_webhook,
        Some(WebhookConfig {
            url: "http://hooks/ready".to_string(),
            pod_id: "pod-7".to_string(),
            secret_key: None,
        })
    );
}

#[test]
fn test_json_file_with_partial_fields() {
    let path = std::env::temp_dir().join(format!("frame-relay-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(
        &path,
        r#"{"server_password": "pw", "batch_size": 8, "transformer_backlog": 3}"#,
    )
    .unwrap();

    let config = RelayConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.server_password, "pw");
    assert_eq!(config.batch_size, 8);
    assert_eq!(config.transformer_backlog(), 3);
    assert_eq!(config.broadcaster_backlog(), 8);
    assert_eq!(config.websocket_port, 8765);
}

#[test]
fn test_zero_batch_size_is_rejected() {
    let mut config = RelayConfig::default();
    config.server_password = "pw".to_string();
    config.batch_size = 0;
    assert!(config.validate().is_err());
}
