use std::path::PathBuf;
use std::time::Duration;

use helmsman::EngineConfig;
use helmsman::duration::{format_duration, parse_duration};
use helmsman::error::ErrorKind;
use helmsman::persistence::{MementoStore, open_store};

#[test]
fn test_partial_yaml_keeps_defaults() {
    let yaml = r#"
default_task_timeout: 5m
persistence:
  dir: /var/lib/helmsman
feeds:
  default_period_ms: 2000
"#;
    let config = EngineConfig::from_yaml(yaml).expect("config");

    assert_eq!(config.default_timeout().expect("timeout"), Some(Duration::from_secs(300)));
    assert_eq!(config.persistence.dir, Some(PathBuf::from("/var/lib/helmsman")));
    assert_eq!(config.default_poll_period(), Duration::from_secs(2));

    // untouched sections fall back to defaults
    let defaults = EngineConfig::default();
    assert_eq!(config.worker_queue_capacity, defaults.worker_queue_capacity);
    assert_eq!(config.persistence.redis_prefix, "helmsman");
    assert_eq!(config.persistence_period(), Duration::from_secs(1));
    assert_eq!(config.feeds.poll_history, 10);
    assert_eq!(config.log_level, "info");
}

#[test]
fn test_empty_yaml_is_default() {
    let config = EngineConfig::from_yaml("{}").expect("config");
    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.default_timeout().expect("timeout"), None);
}

#[test]
fn test_bad_config_is_rejected() {
    assert!(EngineConfig::from_yaml("default_task_timeout: soon").is_err());
    assert!(EngineConfig::from_yaml("worker_queue_capacity: lots").is_err());
    let err = EngineConfig::from_yaml("default_task_timeout: 100000000000000000000d")
        .expect_err("timeout out of range");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("helmsman.yaml");
    std::fs::write(&path, "log_level: debug\n").expect("write");

    let config = EngineConfig::load(&path).expect("load");
    assert_eq!(config.log_level, "debug");
    assert!(EngineConfig::load(dir.path().join("missing.yaml")).is_err());
}

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("50ms").expect("ms"), Duration::from_millis(50));
    assert_eq!(parse_duration("2s").expect("s"), Duration::from_secs(2));
    assert_eq!(parse_duration("1m30s").expect("compound"), Duration::from_secs(90));
    assert_eq!(parse_duration("1.5s").expect("fraction"), Duration::from_millis(1500));
    assert_eq!(parse_duration("1h").expect("h"), Duration::from_secs(3600));
    assert_eq!(parse_duration(" 250 ").expect("bare"), Duration::from_millis(250));

    for bad in [
        "",
        "   ",
        "soon",
        "10x",
        "ms",
        "100000000000000000000d",
        "18446744073709551615s 1s",
    ] {
        let err = parse_duration(bad).expect_err(bad);
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }
}

#[test]
fn test_format_duration() {
    assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    assert_eq!(format_duration(Duration::from_secs(45)), "45s");
    assert_eq!(format_duration(Duration::from_secs(120)), "2m");
    assert_eq!(format_duration(Duration::ZERO), "0ms");
}

#[tokio::test]
async fn test_open_store_from_config() {
    let mut config = EngineConfig::default();
    assert!(open_store(&config.persistence).expect("open").is_none());

    let dir = tempfile::tempdir().expect("tempdir");
    config.persistence.dir = Some(dir.path().to_path_buf());
    config.persistence.redis_url = Some("redis://127.0.0.1:1/".to_string());
    // the directory wins; no redis connection is attempted
    let store = open_store(&config.persistence).expect("open").expect("store");
    store.write_plane_id("p").await.expect("write");
    assert_eq!(
        store.load_raw_data().await.expect("load").plane_id.as_deref(),
        Some("p")
    );
}
