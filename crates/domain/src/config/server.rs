use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_5000")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Environment variable holding the bearer token for the introspection
    /// endpoints (`/v1/agents`, `/v1/sessions`).
    /// If unset, the server logs a warning and allows unauthenticated access.
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
    /// Per-IP token-bucket rate limiting configuration.
    /// When `None` (the default), rate limiting is disabled.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Global cap on in-flight HTTP requests (WebSocket upgrades included).
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_5000(),
            host: d_host(),
            cors: CorsConfig::default(),
            api_token_env: d_api_token_env(),
            rate_limit: None,
            max_concurrent_requests: d_max_concurrent(),
        }
    }
}

/// Per-IP token-bucket rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Quota replenishment rate.
    pub requests_per_second: u64,
    /// Maximum tokens in the bucket.
    pub burst_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Use `["*"]` for permissive (NOT recommended).
    /// Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_5000() -> u16 {
    5000
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:*".into(),
        "http://127.0.0.1:*".into(),
    ]
}
fn d_api_token_env() -> String {
    "RB_API_TOKEN".into()
}
fn d_max_concurrent() -> usize {
    256
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_parses_without_rate_limit() {
        let toml_str = r#"
            port = 8080
            host = "0.0.0.0"
        "#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.host, "0.0.0.0");
        assert!(cfg.rate_limit.is_none());
    }

    #[test]
    fn server_config_parses_with_rate_limit() {
        let toml_str = r#"
            [rate_limit]
            requests_per_second = 50
            burst_size = 100
        "#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        let rl = cfg.rate_limit.expect("rate_limit should be Some");
        assert_eq!(rl.requests_per_second, 50);
        assert_eq!(rl.burst_size, 100);
    }

    #[test]
    fn server_config_empty_toml_uses_all_defaults() {
        let cfg: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.api_token_env, "RB_API_TOKEN");
        assert_eq!(cfg.max_concurrent_requests, 256);
        assert!(cfg.rate_limit.is_none());
    }
}
