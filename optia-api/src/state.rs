use std::sync::Arc;

use optia_order::OrderStore;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OrderStore>,
    pub auth: AuthConfig,
}
