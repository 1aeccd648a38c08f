use std::sync::Arc;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};
use s2v_core::{ErrorKind, GenerationError, JobFailure, JobResponse, ValidationError, VideoGenerator};
use crate::job::JobEnvelope;
use crate::server::schemas::HealthResponse;
use crate::server::state::ServerState;

pub async fn run_sync<G: VideoGenerator + 'static>(
    State(state): State<Arc<ServerState<G>>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            let status = rejection.status();
            let invalid = if status == StatusCode::PAYLOAD_TOO_LARGE {
                ValidationError::OutOfRange {
                    field: "body",
                    reason: format!("request body exceeds {} bytes", state.max_body_bytes),
                }
            } else {
                ValidationError::MalformedPayload(rejection.body_text())
            };
            warn!("Refusing /runsync request: {}", invalid);
            return (status, Json(JobResponse::from(JobFailure::from(invalid)))).into_response();
        }
    };

    let job: JobEnvelope = match serde_json::from_slice(&body) {
        Ok(job) => job,
        Err(e) => {
            let failure = JobFailure::from(ValidationError::MalformedPayload(e.to_string()));
            return respond(JobResponse::from(failure));
        }
    };

    // Detached so a dropped connection cannot cancel a generation midway.
    let handler = state.handler.clone();
    let response = match tokio::spawn(async move { handler.handle(job).await }).await {
        Ok(response) => response,
        Err(e) => {
            error!("Job task aborted: {}", e);
            JobResponse::from(JobFailure::from(GenerationError::Pipeline(e.to_string())))
        }
    };

    respond(response)
}

pub async fn health<G: VideoGenerator + 'static>(State(state): State<Arc<ServerState<G>>>) -> Response {
    let session = state.handler.session();
    let body = HealthResponse {
        healthy: session.is_healthy(),
        generations: session.generations(),
        session: session.info().clone(),
    };
    let status = if body.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

fn respond(response: JobResponse) -> Response {
    let status = match response.error_kind() {
        None => StatusCode::OK,
        Some(ErrorKind::ValidationError) => StatusCode::BAD_REQUEST,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(response)).into_response()
}
