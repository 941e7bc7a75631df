pub mod api;

use axum::{http::HeaderValue, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::docs::ApiDoc;
use crate::handlers::new_session;
use crate::ws::handler::session_handler;
use crate::AppState;

pub use api::create_api_routes;

/// Assemble the full application below the configured server path.
///
/// Everything not matched by a route is treated as a session key and handed
/// to the WebSocket join handler.
pub fn build_app(state: AppState) -> Router {
    let prefix = state.config.server_path.clone();

    let mut app = Router::<AppState>::new().route(&format!("{}/", prefix), get(new_session));
    if !prefix.is_empty() {
        app = app.route(&prefix, get(new_session));
    }

    let mut app = app
        .nest(&format!("{}/api", prefix), create_api_routes())
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .fallback(session_handler)
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(state.config.cors_origins.as_deref()) {
        app = app.layer(cors);
    }

    app.with_state(state)
}

fn cors_layer(origins: Option<&str>) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins?
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}
