use ordo_order::CancellationEngine;
use ordo_shared::Masked;
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: Masked<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CancellationEngine>,
    pub auth: AuthConfig,
}
