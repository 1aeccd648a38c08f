use std::sync::Arc;
use axum::Router;
use axum::routing::{get, post};
use s2v_core::VideoGenerator;
use crate::server::routes::job::{health, run_sync};
use crate::server::state::ServerState;

mod job;

pub fn api_routes<G: VideoGenerator + 'static>() -> Router<Arc<ServerState<G>>> {
    Router::new()
        .route("/runsync", post(run_sync::<G>))
        .route("/health", get(health::<G>))
}
