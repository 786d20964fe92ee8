pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;

use config::CometConfig;
use handler::AppState;
use registry::Registry;

/// Backstop body size cap enforced by axum before the handler ever sees the
/// request, purely to bound buffering of a pathologically large body. The
/// cap spec §4.3/§7 actually names (`InputTooLarge`) is enforced explicitly
/// in `handler::handle_comet` against `codec::REQUEST_BODY_LIMIT_BYTES`, so
/// that the crate's own `text/html` error body is what a caller sees; this
/// layer is set to a generous multiple of that so it only trips as a
/// last-resort guard, never as the normal path.
const HOST_BODY_LIMIT_BYTES: usize = 8 * codec::REQUEST_BODY_LIMIT_BYTES;

/// How often the registry sweeps reclaimed channel entries.
pub const GARBAGE_COLLECT_INTERVAL: Duration = Duration::from_secs(60);

/// Builds the comet endpoint's router. The one route handles every comet
/// request regardless of path, since spec §6 places path routing and
/// authentication out of scope for the core.
pub fn comet_router(registry: Arc<Registry>, config: CometConfig) -> Router {
    let state = AppState {
        registry,
        config: Arc::new(config),
    };

    Router::new()
        .route("/", post(handler::handle_comet))
        .layer(DefaultBodyLimit::max(HOST_BODY_LIMIT_BYTES))
        .with_state(state)
}

/// Spawns the periodic sweep that prunes registry entries whose channel has
/// already been dropped by its application owner.
pub fn spawn_garbage_collector(registry: Arc<Registry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(GARBAGE_COLLECT_INTERVAL).await;
            registry.garbage_collect().await;
        }
    })
}
