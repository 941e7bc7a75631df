use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Settings a client needs to take part in a session
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ClientConfigResponse {
    /// Grace interval of a write hand-off in milliseconds
    pub sync_ms: u64,
    /// Prefix the server is mounted under
    pub server_path: String,
}
