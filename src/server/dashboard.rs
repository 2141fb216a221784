//! Dashboard websocket: account event feed plus goal start/cancel.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::auth::first_message;
use super::{write_frames, AppState};
use crate::ledger::FrameSender;
use crate::protocol::{DashboardEvent, DashboardMessage, OutboundFrame};

pub async fn dashboard_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct DashboardSocket {
    account_id: String,
    tx: FrameSender,
}

impl DashboardSocket {
    fn send(&self, event: &DashboardEvent) {
        let _ = self.tx.send(OutboundFrame::message(event));
    }

    fn error(&self, message: impl Into<String>) {
        self.send(&DashboardEvent::Error {
            message: message.into(),
        });
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let api_key =
        match first_message::<DashboardMessage, _, _>(&mut stream, state.config.auth_timeout).await {
            Ok(DashboardMessage::Auth { api_key }) => api_key,
            Ok(_) => return reject(&mut sink, "Expected an auth message first").await,
            Err(e) => {
                warn!(error = %e, "Dashboard failed to authenticate");
                return reject(&mut sink, &e.to_string()).await;
            }
        };
    let account_id = match state.auth.authenticate(&api_key).await {
        Ok(account_id) => account_id,
        Err(e) => {
            warn!(error = %e, "Dashboard presented an invalid key");
            return reject(&mut sink, &e.to_string()).await;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let subscriber_id = match state.ledger.register_dashboard(&account_id, tx.clone()) {
        Ok(id) => id,
        Err(e) => return reject(&mut sink, &e.to_string()).await,
    };
    let mut writer = tokio::spawn(write_frames(sink, rx));
    let dashboard = DashboardSocket {
        account_id: account_id.clone(),
        tx,
    };
    dashboard.send(&DashboardEvent::AuthOk {
        account_id: account_id.clone(),
    });
    send_device_list(&state, &dashboard);
    info!(account_id = %account_id, subscriber = %subscriber_id, "Dashboard connected");

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&state, &dashboard, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(subscriber = %subscriber_id, error = %e, "Dashboard socket error");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    state.ledger.unregister_dashboard(&subscriber_id);
    info!(account_id = %account_id, subscriber = %subscriber_id, "Dashboard disconnected");
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, message: &str) {
    let event = DashboardEvent::AuthError {
        message: message.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&event) {
        let _ = sink.send(Message::Text(text)).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Tell a fresh subscriber which devices are already online.
fn send_device_list(state: &AppState, dashboard: &DashboardSocket) {
    for device in state.ledger.devices_for_account(&dashboard.account_id) {
        dashboard.send(&DashboardEvent::DeviceOnline {
            device_id: device.persistent_id.clone(),
            model: device.info.model.clone(),
            screen_width: device.info.screen_width,
            screen_height: device.info.screen_height,
        });
    }
}

fn handle_text(state: &AppState, dashboard: &DashboardSocket, text: &str) {
    let message = match serde_json::from_str::<DashboardMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            dashboard.error(format!("Invalid message format: {}", e));
            return;
        }
    };

    match message {
        DashboardMessage::StartGoal { device_id, goal } => {
            if let Err(e) = state
                .sessions
                .start_goal(&dashboard.account_id, &device_id, &goal)
            {
                warn!(account_id = %dashboard.account_id, device_id = %device_id, error = %e, "Goal refused");
                dashboard.error(e.to_string());
            }
        }
        DashboardMessage::CancelGoal { session_id } => {
            if let Err(e) = state.sessions.cancel(&dashboard.account_id, &session_id) {
                dashboard.error(e.to_string());
            }
        }
        DashboardMessage::Auth { .. } | DashboardMessage::Pong => {}
    }
}
