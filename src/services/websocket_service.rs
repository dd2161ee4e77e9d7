//! Lifecycle of one client WebSocket connection: identification, request
//! dispatch, and teardown.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{ClientMessage, ClientRequest, Reply, ServerEvent},
    error::{MultiplayerError, MultiplayerResult},
    services::{hub_service, spectator_service},
    state::{ClientConnection, SharedState, room::UserId},
};

const IDENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle the full lifecycle of an individual client connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps fan-outs flowing even while we await
    // inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let initial_message = match tokio::time::timeout(IDENT_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("websocket identification timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let message = match ClientMessage::from_json_str(&initial_message) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "failed to parse identification message");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let ClientRequest::Identify { user_id } = message.request else {
        warn!("first message was not an identification");
        let _ = outbound_tx.send(Message::Close(None));
        finalize(writer_task, outbound_tx).await;
        return;
    };

    let connection_id = Uuid::new_v4();
    if let Some(stale) = state.connections().insert(
        user_id,
        ClientConnection {
            user_id,
            connection_id,
            tx: outbound_tx.clone(),
            room_id: None,
        },
    ) {
        // The same user reconnected; retire the previous socket.
        warn!(user_id, "replacing an existing connection");
        let _ = stale.tx.send(Message::Close(None));
    }
    send_payload(&outbound_tx, &Reply::ok(message.id, None));
    info!(user_id, %connection_id, "client connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match ClientMessage::from_json_str(&text) {
                Ok(message) => {
                    let id = message.id;
                    let reply = match dispatch(&state, user_id, message.request).await {
                        Ok(data) => Reply::ok(id, data),
                        Err(err) => {
                            info!(user_id, error = %err, "request failed");
                            Reply::err(id, &err)
                        }
                    };
                    send_payload(&outbound_tx, &reply);
                }
                Err(err) => {
                    warn!(user_id, error = %err, "failed to parse client message");
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(user_id, error = %err, "websocket error");
                break;
            }
        }
    }

    cleanup(&state, user_id, connection_id).await;
    info!(user_id, %connection_id, "client disconnected");
    finalize(writer_task, outbound_tx).await;
}

/// Route one request to the owning service.
async fn dispatch(
    state: &SharedState,
    user_id: UserId,
    request: ClientRequest,
) -> MultiplayerResult<Option<serde_json::Value>> {
    match request {
        ClientRequest::Identify { .. } => Err(MultiplayerError::invalid_state(
            "connection is already identified",
        )),
        ClientRequest::JoinRoom {
            room_id,
            password,
            ruleset_id,
        } => {
            let snapshot =
                hub_service::join_room(state, user_id, room_id, password, ruleset_id).await?;
            Ok(serialize_data(&snapshot))
        }
        ClientRequest::LeaveRoom => hub_service::leave_room(state, user_id).await.map(|_| None),
        ClientRequest::ChangeSettings { settings } => {
            hub_service::change_settings(state, user_id, settings)
                .await
                .map(|_| None)
        }
        ClientRequest::ChangeState { state: requested } => {
            hub_service::change_state(state, user_id, requested)
                .await
                .map(|_| None)
        }
        ClientRequest::StartMatch => hub_service::start_match(state, user_id).await.map(|_| None),
        ClientRequest::AddPlaylistItem { item } => {
            let item_id = hub_service::add_playlist_item(state, user_id, item).await?;
            Ok(serialize_data(&item_id))
        }
        ClientRequest::EditPlaylistItem { item_id, item } => {
            hub_service::edit_playlist_item(state, user_id, item_id, item)
                .await
                .map(|_| None)
        }
        ClientRequest::RemovePlaylistItem { item_id } => {
            hub_service::remove_playlist_item(state, user_id, item_id)
                .await
                .map(|_| None)
        }
        ClientRequest::TransferHost { user_id: target } => {
            hub_service::transfer_host(state, user_id, target)
                .await
                .map(|_| None)
        }
        ClientRequest::KickUser { user_id: target } => {
            hub_service::kick_user(state, user_id, target)
                .await
                .map(|_| None)
        }
        ClientRequest::SendMatchRequest { request } => {
            hub_service::send_match_request(state, user_id, request)
                .await
                .map(|_| None)
        }
        ClientRequest::BeginPlaySession { score_token, info } => {
            spectator_service::begin_play_session(state, user_id, score_token, info);
            Ok(None)
        }
        ClientRequest::SendFrameData { bundle } => {
            spectator_service::receive_frame_data(state, user_id, bundle).map(|_| None)
        }
        ClientRequest::EndPlaySession { state: final_state } => {
            spectator_service::end_play_session(state, user_id, final_state)
                .await
                .map(|_| None)
        }
    }
}

/// Undo everything this connection owned: its play session, its room
/// membership, and its directory entry.
async fn cleanup(state: &SharedState, user_id: UserId, connection_id: Uuid) {
    // A reconnect may have replaced the entry already; only the owning
    // socket tears down.
    let owns_entry = state
        .connections()
        .get(&user_id)
        .is_some_and(|connection| connection.connection_id == connection_id);
    if !owns_entry {
        return;
    }

    spectator_service::handle_disconnect(state, user_id).await;
    if let Err(err) = hub_service::leave_room(state, user_id).await {
        // Not being in a room is the common case.
        if !matches!(err, MultiplayerError::InvalidState(_)) {
            warn!(user_id, error = %err, "failed to leave room during cleanup");
        }
    }
    state.connections().remove(&user_id);
}

/// Serialize a payload and push it onto the connection's writer channel.
fn send_payload<T>(tx: &mpsc::UnboundedSender<Message>, value: &T) -> bool
where
    T: ?Sized + Serialize + std::fmt::Debug,
{
    let payload = match serde_json::to_string(value) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}`");
            return true;
        }
    };
    tx.send(Message::Text(payload.into())).is_ok()
}

/// Push a server event to one connection.
pub fn send_event_to_socket(tx: &mpsc::UnboundedSender<Message>, event: &ServerEvent) {
    let _ = send_payload(tx, event);
}

/// Serialize reply data, logging rather than failing on the (unreachable)
/// serialization error.
fn serialize_data<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "failed to serialize reply data");
            None
        }
    }
}

/// Ensure the writer task winds down before we return from the handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
