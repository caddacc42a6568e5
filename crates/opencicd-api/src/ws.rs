//! WebSocket handling for real-time updates.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use opencicd_core::ResourceId;
use opencicd_core::update::RunUpdate;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Only stream updates of this run.
    run: Option<ResourceId>,
}

/// Frames sent besides the updates themselves.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsNotice {
    Subscribed { run: Option<ResourceId> },
    /// The client fell behind and missed updates; it should resync through the history
    /// and log endpoints.
    Lagged { skipped: u64 },
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let rx = state.plane.subscribe(query.run);
    ws.on_upgrade(move |socket| handle_socket(socket, rx, query.run))
}

async fn handle_socket(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<RunUpdate>,
    run: Option<ResourceId>,
) {
    info!(run = ?run, "WebSocket connection established");
    if send_json(&mut socket, &WsNotice::Subscribed { run }).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            update = rx.recv() => {
                let sent = match update {
                    Ok(update) => send_json(&mut socket, &update).await,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "WebSocket subscriber lagged");
                        send_json(&mut socket, &WsNotice::Lagged { skipped }).await
                    }
                    Err(RecvError::Closed) => break,
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    info!(run = ?run, "WebSocket connection closed");
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).map_err(axum::Error::new)?;
    socket.send(Message::Text(json.into())).await
}
