//! WebSocket connection handler.
//!
//! One task per client. The task owns both socket halves: it drains the
//! client's outbound queue into the socket and interprets inbound request
//! frames. Parse failures and unknown frame tags are logged and ignored;
//! only socket errors or closure end the session.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::broker::ClientHandle;
use crate::logs::LogSessionOptions;
use crate::message::ClientRequest;

use super::AppState;

pub async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client, mut outbound_rx, mut close_rx) = state.broker.register_client();

    // Refresh conditions in the background so the new client promptly
    // receives the current state of every cluster.
    {
        let registry = Arc::clone(&state.registry);
        let platform = state.broker.platform();
        let namespace = state.broker.namespace().to_string();
        tokio::spawn(async move {
            if let Err(e) = registry.load_conditions(platform.as_ref(), &namespace).await {
                error!(error = %e, "Failed to load cluster conditions for new client");
            }
        });
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "Failed to encode outbound frame");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                // Dispatcher closed our queue
                None => break,
            },
            _ = close_rx.changed() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_frame(&state, &client, &text).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!(client_id = client.id(), "Client closed connection");
                    break;
                }
                // Ping/pong are answered by the protocol layer
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    info!(client_id = client.id(), error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    }

    state.broker.remove_client(client.id());
}

async fn handle_frame(state: &AppState, client: &Arc<ClientHandle>, text: &str) {
    let request = match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => request,
        Err(e) => {
            warn!(
                client_id = client.id(),
                raw_message = text,
                error = %e,
                "Failed to parse client message"
            );
            return;
        }
    };

    match request {
        ClientRequest::ClustersEvents {
            session_id,
            clusters,
        } => {
            state
                .broker
                .subscribe_events(client, session_id, clusters)
                .await;
        }
        ClientRequest::Logs {
            session_id,
            follow,
            start_time,
            end_time,
            cluster_map,
        } => {
            if session_id.is_empty() {
                state.broker.stop_log_session(client);
                return;
            }

            let start_time = parse_rfc3339(&start_time, "startTime", &session_id);
            // End time only applies when not following
            let end_time = if follow {
                None
            } else {
                parse_rfc3339(&end_time, "endTime", &session_id)
            };
            let clusters = cluster_map
                .into_iter()
                .filter_map(|(name, selected)| selected.then_some(name))
                .collect();

            state.broker.start_log_session(
                client,
                session_id,
                LogSessionOptions {
                    follow,
                    start_time,
                    end_time,
                    clusters,
                },
            );
        }
    }
}

/// Parses an optional RFC3339 field; invalid values are ignored with a
/// warning rather than failing the request.
fn parse_rfc3339(raw: &str, field: &str, session_id: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            warn!(field, value = raw, session_id, error = %e, "Invalid time format, ignoring");
            None
        }
    }
}
