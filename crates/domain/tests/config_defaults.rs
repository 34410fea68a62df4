use std::io::Write;

use rb_domain::config::Config;

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 5000);
}

#[test]
fn default_liveness_timeout_is_three_intervals() {
    let config = Config::default();
    assert_eq!(
        config.broker.liveness_timeout_secs,
        config.broker.liveness_interval_secs * 3
    );
}

#[test]
fn default_token_envs() {
    let config = Config::default();
    assert_eq!(config.auth.agent_token_env, "RB_AGENT_TOKEN");
    assert_eq!(config.auth.controller_token_env, "RB_CONTROLLER_TOKEN");
    assert_eq!(config.server.api_token_env, "RB_API_TOKEN");
}

#[test]
fn cors_config_parses_custom_origins() {
    let toml_str = r#"
[server.cors]
allowed_origins = ["https://myapp.com", "http://localhost:3000"]
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.cors.allowed_origins.len(), 2);
    assert!(config.server.cors.allowed_origins.contains(&"https://myapp.com".to_string()));
}

#[test]
fn broker_section_parses() {
    let toml_str = r#"
[broker]
liveness_interval_secs = 10
liveness_timeout_secs = 40
max_command_history = 50
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.broker.liveness_interval_secs, 10);
    assert_eq!(config.broker.liveness_timeout_secs, 40);
    assert_eq!(config.broker.max_command_history, 50);
    assert_eq!(config.broker.closed_session_grace_secs, 60);
    assert!(config.validate().is_empty());
}

#[test]
fn from_path_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_path(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.port, 5000);
}

#[test]
fn from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[server]\nport = 7001\n\n[observability]\nservice_name = \"edge\"").unwrap();
    let config = Config::from_path(file.path()).unwrap();
    assert_eq!(config.server.port, 7001);
    assert_eq!(config.observability.service_name, "edge");
}

#[test]
fn from_path_rejects_bad_toml() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[server\nport = ").unwrap();
    assert!(Config::from_path(file.path()).is_err());
}
