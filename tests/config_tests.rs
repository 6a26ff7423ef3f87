// Config loading and validation tests

use lab_events::config::AppConfig;
use std::io::Write;
use std::time::Duration;

const VALID_CONFIG: &str = r#"
[stream]
format = "json"
runtime = "docker"
lab_label = "containerlab"
include_initial_state = true
channel_capacity = 64

[interfaces]
include_stats = true
stats_interval_ms = 2000

[traffic]
enabled = true
interval_ms = 3000
bpffs_root = "/sys/fs/bpf/test_traffic"
object_dir = "/opt/lab-events"
services_file = "/etc/services"

[runtime]
docker_socket = "/var/run/docker.sock"
timeout_secs = 10
"#;

#[test]
fn test_config_loads_from_str() {
    let config = AppConfig::load_from_str(VALID_CONFIG).expect("load_from_str");
    assert_eq!(config.stream.format, "json");
    assert!(config.stream.include_initial_state);
    assert_eq!(config.stream.channel_capacity, 64);
    assert!(config.interfaces.include_stats);
    assert_eq!(config.interfaces.stats_interval_ms, 2000);
    assert!(config.traffic.enabled);
    assert_eq!(config.runtime.docker_socket, "/var/run/docker.sock");
    assert_eq!(config.runtime.timeout_secs, 10);
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = AppConfig::load_from_str("").expect("defaults");
    assert_eq!(config.stream.format, "plain");
    assert_eq!(config.stream.runtime, "docker");
    assert_eq!(config.stream.lab_label, "containerlab");
    assert!(!config.stream.include_initial_state);
    assert!(!config.traffic.enabled);
    assert_eq!(config.traffic.interval_ms, 5000);
    assert_eq!(config.runtime.timeout_secs, 30);
}

#[test]
fn test_partial_section_keeps_other_defaults() {
    let config = AppConfig::load_from_str("[traffic]\nenabled = true\n").expect("partial");
    assert!(config.traffic.enabled);
    assert_eq!(config.traffic.services_file, "/etc/services");
    assert_eq!(config.interfaces.stats_interval_ms, 1000);
}

#[test]
fn test_stream_options_follow_config() {
    let config = AppConfig::load_from_str(VALID_CONFIG).unwrap();
    let opts = config.stream_options();
    assert_eq!(opts.format, "json");
    assert!(opts.include_interface_stats);
    assert_eq!(opts.stats_interval, Duration::from_millis(2000));
    assert!(opts.include_traffic);
    assert_eq!(opts.traffic_interval, Duration::from_secs(3));
    assert_eq!(opts.channel_capacity, 64);

    let backend = config.traffic_backend();
    assert_eq!(backend.bpffs_root.to_str(), Some("/sys/fs/bpf/test_traffic"));
    assert_eq!(backend.object_dir.to_str(), Some("/opt/lab-events"));
}

#[test]
fn test_config_validation_rejects_unknown_format() {
    let bad = VALID_CONFIG.replace("format = \"json\"", "format = \"yaml\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("stream.format"));
}

#[test]
fn test_config_validation_accepts_format_case_insensitively() {
    let ok = VALID_CONFIG.replace("format = \"json\"", "format = \"JSON\"");
    assert!(AppConfig::load_from_str(&ok).is_ok());
}

#[test]
fn test_config_validation_rejects_empty_label() {
    let bad = VALID_CONFIG.replace("lab_label = \"containerlab\"", "lab_label = \"\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("stream.lab_label"));
}

#[test]
fn test_config_validation_rejects_channel_capacity_zero() {
    let bad = VALID_CONFIG.replace("channel_capacity = 64", "channel_capacity = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("channel_capacity"));
}

#[test]
fn test_config_validation_rejects_stats_interval_zero() {
    let bad = VALID_CONFIG.replace("stats_interval_ms = 2000", "stats_interval_ms = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("stats_interval_ms"));
}

#[test]
fn test_config_validation_rejects_timeout_zero() {
    let bad = VALID_CONFIG.replace("timeout_secs = 10", "timeout_secs = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("runtime.timeout_secs"));
}

#[test]
fn test_traffic_paths_checked_only_when_enabled() {
    let bad = VALID_CONFIG.replace("object_dir = \"/opt/lab-events\"", "object_dir = \"\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("traffic.object_dir"));

    let disabled = bad.replace("enabled = true", "enabled = false");
    assert!(AppConfig::load_from_str(&disabled).is_ok());
}

#[test]
fn test_traffic_interval_zero_is_allowed() {
    let cfg = VALID_CONFIG.replace("interval_ms = 3000", "interval_ms = 0");
    let config = AppConfig::load_from_str(&cfg).unwrap();
    assert_eq!(config.stream_options().traffic_interval, Duration::ZERO);
}

#[test]
fn test_load_reads_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(VALID_CONFIG.as_bytes()).unwrap();
    let config = AppConfig::load(file.path().to_str()).expect("load");
    assert_eq!(config.stream.format, "json");
}

#[test]
fn test_load_missing_explicit_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.toml");
    let err = AppConfig::load(path.to_str()).unwrap_err();
    assert!(err.to_string().contains("missing.toml"));
}

#[test]
fn test_config_rejects_malformed_toml() {
    assert!(AppConfig::load_from_str("[stream\nformat = ").is_err());
}
