use std::sync::Arc;

use crate::auth::AuthManager;
use crate::bus::EventProducer;
use crate::config::Settings;
use crate::util::rate_limit::RateLimiter;

/// Shared state for the collector HTTP surface.
pub struct AppState {
    pub settings: Settings,
    pub auth: AuthManager,
    pub limiter: RateLimiter,
    pub producer: EventProducer,
}

pub type SharedState = Arc<AppState>;
