use std::sync::Arc;
use std::time::Duration;
use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Query, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::models::ErrorResponse;
use super::message::{Command, Request};
use super::registry::SessionRegistry;

/// How long a closing connection may take to flush its last frames.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize, Debug)]
pub struct JoinQuery {
    ws: Option<String>,
}

fn bad_request(message: &str) -> Response {
    let status = StatusCode::BAD_REQUEST;
    (status, Json(ErrorResponse {
        code: status.as_u16(),
        status: status.to_string(),
        error: message.to_string(),
    })).into_response()
}

/// Session key for a request path below `server_path`.
pub fn session_key(path: &str, server_path: &str) -> Option<String> {
    let rest = path.strip_prefix(server_path)?;
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    urlencoding::decode(rest).ok().map(|key| key.into_owned())
}

/// Join endpoint: `GET {server_path}/{key}?ws=1` with a WebSocket upgrade.
pub async fn session_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<JoinQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let Some(key) = session_key(uri.path(), &state.config.server_path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let wants_ws = query.ws.as_deref().is_some_and(|flag| !flag.is_empty());
    match (wants_ws, ws) {
        (true, Some(ws)) => {
            info!("New WebSocket connection attempt for session {}", key);
            let sessions = state.sessions.clone();
            ws.on_upgrade(move |socket| handle_socket(socket, key, sessions))
        }
        _ => bad_request("Expected WebSocket upgrade request"),
    }
}

/// Handle one attached peer
async fn handle_socket(socket: WebSocket, key: String, sessions: Arc<SessionRegistry>) {
    let lease = sessions.get(&key).await;
    let session = lease.session();

    // Split the socket; outbound frames are funneled through one channel
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

    let member = match session.join(tx).await {
        Ok(member) => member,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };
    info!("WebSocket connection established for session {} as member {}", key, member);

    // Forward frames queued by the session to the client. Ends when the
    // session drops this member or the client goes away.
    let send_key = key.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let text = match serde_json::to_string(&cmd) {
                Ok(text) => text,
                Err(e) => {
                    error!("{}: {} can not encode frame: {}", send_key, member, e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                debug!("{}: {} write failed", send_key, member);
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    // Translate client frames into session operations
    let recv_key = key.clone();
    let recv_session = session.clone();
    let recv_sessions = sessions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("{}: {} socket error: {}", recv_key, member, e);
                    break;
                }
            };

            let cmd: Command = match serde_json::from_str(&text) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!("{}: {} sent a malformed frame: {}", recv_key, member, e);
                    break;
                }
            };

            match cmd.request() {
                Request::Write => {
                    recv_sessions.spawn_handoff(recv_session.clone(), member);
                }
                Request::State(content) => {
                    if let Err(e) = recv_session.submit(member, content.to_string()).await {
                        warn!("{}", e);
                        break;
                    }
                }
                Request::Unknown(other) => {
                    info!("{}: {} unknown control: {}", recv_key, member, other);
                }
            }
        }
    });

    let shutdown = sessions.shutdown_token();
    let send_done = tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
            true
        }
        _ = (&mut recv_task) => false,
        _ = shutdown.cancelled() => {
            recv_task.abort();
            false
        }
    };

    // Leaving drops the outbound channel, which lets the send task close the socket
    session.leave(member).await;
    if !send_done && tokio::time::timeout(CLOSE_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }

    drop(lease);
    info!("WebSocket connection terminated for session {} member {}", key, member);
}
