//! Device websocket: auth, command responses, goals and heartbeats.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::auth::first_message;
use super::{write_frames, AppState};
use crate::ledger::{DeviceConnection, FrameSender};
use crate::protocol::{DashboardEvent, DeviceInfo, DeviceMessage, OutboundFrame, ServerMessage};

pub async fn device_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// An authenticated device socket, as seen by the inbound dispatcher.
struct DeviceSocket {
    device_id: String,
    account_id: String,
    tx: FrameSender,
}

impl DeviceSocket {
    fn reply(&self, message: &ServerMessage) {
        let _ = self.tx.send(OutboundFrame::message(message));
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let auth = first_message::<DeviceMessage, _, _>(&mut stream, state.config.auth_timeout).await;
    let (api_key, info) = match auth {
        Ok(DeviceMessage::Auth {
            api_key,
            device_info,
        }) => (api_key, device_info),
        Ok(_) => return reject(&mut sink, "Expected an auth message first").await,
        Err(e) => {
            warn!(error = %e, "Device failed to authenticate");
            return reject(&mut sink, &e.to_string()).await;
        }
    };
    let account_id = match state.auth.authenticate(&api_key).await {
        Ok(account_id) => account_id,
        Err(e) => {
            warn!(error = %e, "Device presented an invalid key");
            return reject(&mut sink, &e.to_string()).await;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let device_id = DeviceConnection::persistent_id_for(&account_id, &info);
    let connection = DeviceConnection::new(&device_id, &account_id, info.clone(), tx.clone());
    let ephemeral_id = connection.ephemeral_id.clone();
    if let Err(e) = state.ledger.register_device(connection) {
        warn!(device_id = %device_id, error = %e, "Device registration refused");
        return reject(&mut sink, &e.to_string()).await;
    }

    let mut writer = tokio::spawn(write_frames(sink, rx));
    let device = DeviceSocket {
        device_id: device_id.clone(),
        account_id: account_id.clone(),
        tx,
    };
    device.reply(&ServerMessage::AuthOk {
        device_id: device_id.clone(),
    });
    state
        .ledger
        .broadcast_to_account(&account_id, &online_event(&device_id, &info));
    info!(device_id = %device_id, account_id = %account_id, model = %info.model, "Device online");

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&state, &device, &text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => handle_text(&state, &device, &text),
                    Err(_) => debug!(device_id = %device_id, "Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => state.ledger.touch(&device_id),
                Some(Err(e)) => {
                    debug!(device_id = %device_id, error = %e, "Device socket error");
                    break;
                }
            },
            // The writer stops when the ledger closes a replaced connection.
            _ = &mut writer => break,
        }
    }

    writer.abort();
    // A replaced connection no longer owns the persistent id, so this is a no-op for it.
    if state.ledger.unregister_device(&ephemeral_id).is_some() {
        state.ledger.broadcast_to_account(
            &account_id,
            &DashboardEvent::DeviceOffline {
                device_id: device_id.clone(),
            },
        );
        info!(device_id = %device_id, "Device offline");
    } else {
        debug!(device_id = %device_id, connection = %ephemeral_id, "Superseded connection closed");
    }
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, message: &str) {
    let reply = ServerMessage::AuthError {
        message: message.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&reply) {
        let _ = sink.send(Message::Text(text)).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}

fn online_event(device_id: &str, info: &DeviceInfo) -> DashboardEvent {
    DashboardEvent::DeviceOnline {
        device_id: device_id.to_string(),
        model: info.model.clone(),
        screen_width: info.screen_width,
        screen_height: info.screen_height,
    }
}

/// Dispatch one inbound text frame from an authenticated device.
fn handle_text(state: &AppState, device: &DeviceSocket, text: &str) {
    let message = match serde_json::from_str::<DeviceMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(device_id = %device.device_id, error = %e, "Invalid device message");
            device.reply(&ServerMessage::Error {
                message: format!("Invalid message format: {}", e),
            });
            return;
        }
    };
    state.ledger.touch(&device.device_id);

    match message {
        DeviceMessage::Auth { .. } => {
            debug!(device_id = %device.device_id, "Ignoring repeated auth");
        }
        DeviceMessage::Screen { .. } | DeviceMessage::Result { .. } => {
            if let Some((request_id, response)) = message.into_response() {
                if !state
                    .ledger
                    .resolve_request(&device.device_id, &request_id, response)
                {
                    debug!(
                        device_id = %device.device_id,
                        request_id = %request_id,
                        "Response had no pending request"
                    );
                }
            }
        }
        DeviceMessage::Goal { text } => {
            if let Err(e) = state
                .sessions
                .start_goal(&device.account_id, &device.device_id, &text)
            {
                warn!(device_id = %device.device_id, error = %e, "Goal refused");
                device.reply(&ServerMessage::Error {
                    message: e.to_string(),
                });
            }
        }
        DeviceMessage::Heartbeat {
            battery_level,
            is_charging,
        } => {
            state
                .ledger
                .update_device_status(&device.device_id, battery_level, is_charging);
            state.ledger.broadcast_to_account(
                &device.account_id,
                &DashboardEvent::DeviceStatus {
                    device_id: device.device_id.clone(),
                    battery_level,
                    is_charging,
                },
            );
        }
        DeviceMessage::Pong => {}
    }
}
