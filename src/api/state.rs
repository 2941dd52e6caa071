use std::sync::Arc;

use crate::services::ServiceContext;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<ServiceContext>,
}

impl AppState {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.ctx.config.api.admin_token.as_deref()
    }
}
