use std::io::Write;

use dimse_transfer::{Config, TransferDispatcher, TransferError};

const CONFIG: &str = r#"
    [logging]
    level = "info"

    [dimse]
    local_aet = "TRANSFER"
    connect_timeout_ms = 5000

    [nodes.pacs]
    ae_title = "PACS"
    host = "127.0.0.1"
    port = 104

    [queue]
    capacity = 10
    allow_dropping = false

    [retry]
    strategy = "fixed"
    max_retries = 2
    initial_delay_ms = 250
    max_delay_ms = 250

    [circuit_breaker]
    failure_threshold = 4
    cooldown_ms = 15000
"#;

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.dimse.connect_timeout_ms, 5000);
    assert_eq!(config.node("pacs").unwrap().destination_key(), "PACS@127.0.0.1:104");
    assert!(!config.queue.allow_dropping);
    assert_eq!(config.circuit_breaker.cooldown_ms, 15000);
}

#[test]
fn test_missing_file() {
    let err = Config::from_file("/nonexistent/transfer.toml").unwrap_err();
    assert!(matches!(err, TransferError::Config(msg) if msg.contains("/nonexistent/transfer.toml")));
}

#[test]
fn test_malformed_toml() {
    assert!(matches!(
        "[dimse\nlocal_aet = 1".parse::<Config>(),
        Err(TransferError::Config(_))
    ));
}

#[test]
fn test_invalid_retry_window() {
    let toml = CONFIG.replace("max_delay_ms = 250", "max_delay_ms = 100");
    assert!(matches!(toml.parse::<Config>(), Err(TransferError::Config(_))));
}

#[tokio::test]
async fn test_dispatcher_from_config() {
    let config: Config = CONFIG.parse().unwrap();
    let dispatcher = TransferDispatcher::from_config(&config).unwrap();
    assert_eq!(dispatcher.queue().config().capacity, 10);
    assert_eq!(dispatcher.executor().policy().max_retries, 2);
    assert!(dispatcher.queue().is_empty());
}
