//! Route configuration for the ingestion API.

use super::hook;
use ntex::web;

/// Configures the hook ingestion routes.
///
/// # Routes
/// - `POST /hook/{service}` - Enqueue a hook for `service`, other methods get a 405
/// - `GET /health` - Liveness probe
pub fn hooks(cfg: &mut web::ServiceConfig) {
    cfg.service((
        web::resource("/hook/{service}").to(hook::enqueue_hook),
        hook::health,
    ));
}
