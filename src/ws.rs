use std::{collections::HashSet, time::Duration};

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::{
    api::AppState,
    models::{Language, validate_session_id},
    rooms::{ClientEvent, ClientHandle, ServerEvent},
};

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: AppState) {
    let (client, outbound) = ClientHandle::new(state.ws.outbound_capacity);
    let (sink, stream) = socket.split();
    state.metrics.client_connected();
    tracing::info!(client_id = %client.id(), "client connected");

    let writer = tokio::spawn(write_frames(
        sink,
        outbound,
        state.ws.ping_interval,
        state.ws.idle_timeout,
    ));
    let joined = read_frames(&state, &client, stream).await;

    disconnect(&state, &client, joined).await;
    writer.abort();
}

/// Drains the outbound queue and keeps the peer's pongs coming. Stops when
/// the queue closes or a send does not complete within `send_limit`.
async fn write_frames<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<ServerEvent>,
    ping_interval: Duration,
    send_limit: Duration,
) where
    S: Sink<Message> + Unpin,
{
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;
    loop {
        let message = tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(payload) => Message::Text(payload.into()),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to encode server event");
                        continue;
                    }
                }
            }
            _ = ping.tick() => Message::Ping(Default::default()),
        };
        match tokio::time::timeout(send_limit, sink.send(message)).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }
}

/// Reads frames until the peer closes, errors, stays silent for the idle
/// limit, or is evicted. Returns the sessions it still belongs to.
pub(crate) async fn read_frames<S>(
    state: &AppState,
    client: &ClientHandle,
    mut stream: S,
) -> HashSet<String>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut joined = HashSet::new();
    loop {
        let frame = tokio::select! {
            _ = client.evicted() => {
                tracing::warn!(client_id = %client.id(), "client evicted for falling behind");
                break;
            }
            frame = tokio::time::timeout(state.ws.idle_timeout, stream.next()) => frame,
        };
        let text = match frame {
            Err(_) => {
                tracing::info!(client_id = %client.id(), "client idle, dropping connection");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(err))) => {
                tracing::debug!(client_id = %client.id(), error = %err, "socket read failed");
                break;
            }
        };
        match serde_json::from_str::<ClientEvent>(text.as_str()) {
            Ok(event) => dispatch(state, client, &mut joined, event).await,
            Err(err) => {
                tracing::debug!(client_id = %client.id(), error = %err, "undecodable frame");
                client.send(ServerEvent::Error {
                    message: format!("invalid message: {err}"),
                });
            }
        }
    }
    joined
}

/// Applies one client frame. Failures are reported back to the sender only.
pub(crate) async fn dispatch(
    state: &AppState,
    client: &ClientHandle,
    joined: &mut HashSet<String>,
    event: ClientEvent,
) {
    if let Err(message) = validate_session_id(event.session_id()) {
        client.send(ServerEvent::Error { message });
        return;
    }

    let outcome = match event {
        ClientEvent::JoinSession { session_id } => {
            let result = state.rooms.join(client, &session_id).await.map(|_| ());
            if result.is_ok() {
                joined.insert(session_id);
            }
            result
        }
        ClientEvent::LeaveSession { session_id } => {
            state.rooms.leave(client.id(), &session_id).await;
            joined.remove(&session_id);
            Ok(())
        }
        ClientEvent::CodeChange { session_id, code } => {
            if code.len() > state.max_code_bytes {
                client.send(ServerEvent::Error {
                    message: "code exceeds configured limit".to_string(),
                });
                return;
            }
            state
                .rooms
                .submit_change(Some(client.id()), &session_id, &code)
                .await
                .map(|_| ())
        }
        ClientEvent::LanguageChange {
            session_id,
            language,
        } => {
            let Ok(language) = language.parse::<Language>() else {
                client.send(ServerEvent::Error {
                    message: "Unsupported language".to_string(),
                });
                return;
            };
            state
                .rooms
                .submit_language_change(Some(client.id()), &session_id, language)
                .await
                .map(|_| ())
        }
    };

    if let Err(err) = outcome {
        tracing::error!(client_id = %client.id(), error = %err, "session update failed");
        client.send(ServerEvent::Error {
            message: "session update failed".to_string(),
        });
    }
}

pub(crate) async fn disconnect(state: &AppState, client: &ClientHandle, joined: HashSet<String>) {
    for session_id in joined {
        state.rooms.leave(client.id(), &session_id).await;
    }
    state.metrics.client_disconnected();
    tracing::info!(client_id = %client.id(), "client disconnected");
}
