use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service accepts connections", body = HealthResponse),
        (status = 503, description = "Service is shutting down", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Session and host statistics
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Current diagnostics", body = DiagnosticsResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

/// Client settings
#[utoipa::path(
    get,
    path = "/api/v1/config",
    responses(
        (status = 200, description = "Settings for the browser client", body = ClientConfigResponse)
    )
)]
#[allow(dead_code)]
pub async fn client_config_doc() {}

/// Join a session
#[utoipa::path(
    get,
    path = "/{key}",
    params(
        ("key" = String, Path, description = "Session key"),
        ("ws" = String, Query, description = "Must be set to upgrade to a WebSocket")
    ),
    responses(
        (status = 101, description = "Switched to the session WebSocket"),
        (status = 400, description = "Not a WebSocket upgrade request", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn join_session_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        diagnostics_doc,
        client_config_doc,
        join_session_doc,
    ),
    components(
        schemas(HealthResponse, DiagnosticsResponse, ClientConfigResponse, ErrorResponse)
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
