//! Route definitions for the control plane.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::{handlers, ControlState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates the control plane router.
///
/// The funding route only exists when development funding is enabled. Every request is
/// logged at `info` with its method, path, status and latency.
pub fn create_router(state: ControlState) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/token/{token}", get(handlers::token_handler));

    if state.dev_funding {
        router = router.route("/token/{token}/fund", post(handlers::fund_handler));
    }

    router.with_state(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}
