use std::sync::Arc;

use rb_broker::Broker;
use rb_domain::config::Config;
use tokio_util::sync::CancellationToken;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broker: Arc<Broker>,
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
    /// Cancelled on shutdown; stops background tasks.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Arc<Config>, broker: Arc<Broker>, api_token_hash: Option<Vec<u8>>) -> Self {
        Self {
            config,
            broker,
            api_token_hash,
            shutdown: CancellationToken::new(),
        }
    }
}
