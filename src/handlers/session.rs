use axum::{
    extract::State,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use tracing::debug;
use uuid::Uuid;

use crate::{models::ClientConfigResponse, AppState};

/// Send the client to a freshly generated session key.
pub async fn new_session(State(state): State<AppState>) -> Response {
    let key = Uuid::new_v4().simple().to_string();
    debug!("Redirecting to new session {}", key);
    Redirect::to(&format!("{}/{}", state.config.server_path, key)).into_response()
}

/// Settings the browser client needs
pub async fn client_config(State(state): State<AppState>) -> Json<ClientConfigResponse> {
    Json(ClientConfigResponse {
        sync_ms: state.sessions.settings().grace.as_millis() as u64,
        server_path: state.config.server_path.clone(),
    })
}
