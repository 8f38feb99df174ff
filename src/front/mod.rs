pub mod errors;
pub mod hook;
pub mod middleware;
pub mod routes;

use crate::{api::enqueue::EnqueueGateway, services};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<EnqueueGateway>,
    pub rate_limiter: services::ImplRateLimiter,
}
