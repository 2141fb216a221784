//! HTTP and websocket surface.

mod auth;
mod dashboard;
mod device;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

pub use auth::{first_message, AuthError, Authenticator, StaticKeyAuthenticator, DEFAULT_AUTH_TIMEOUT};
pub use dashboard::dashboard_ws;
pub use device::device_ws;

use crate::agent::SessionManager;
use crate::ledger::ConnectionLedger;
use crate::protocol::{DashboardEvent, OutboundFrame};

/// Default interval between keepalive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Missed ping intervals before a silent device is dropped.
pub const STALE_AFTER_INTERVALS: u32 = 3;

/// Socket-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Deadline for the first `auth` frame on a new socket.
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl ServerConfig {
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<ConnectionLedger>,
    pub sessions: Arc<SessionManager>,
    pub auth: Arc<dyn Authenticator>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(
        ledger: Arc<ConnectionLedger>,
        sessions: Arc<SessionManager>,
        auth: Arc<dyn Authenticator>,
        config: ServerConfig,
    ) -> Self {
        Self {
            ledger,
            sessions,
            auth,
            config,
        }
    }
}

/// Build the router: health check plus the two websocket endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/device", get(device_ws))
        .route("/ws/dashboard", get(dashboard_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "devices": state.ledger.device_count(),
        "pendingRequests": state.ledger.pending_count(),
        "runningSessions": state.sessions.running_count(),
    }))
}

/// Forward queued frames to the socket until the channel closes or a close is requested.
pub(crate) async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Json(value) => {
                if sink.send(Message::Text(value.to_string())).await.is_err() {
                    break;
                }
            }
            OutboundFrame::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    debug!("Writer task ended");
}

/// Drop devices that stayed silent too long, then ping the rest.
///
/// Returns the persistent ids of the dropped devices.
pub fn sweep_devices(ledger: &ConnectionLedger, ping_interval: Duration) -> Vec<String> {
    let mut dropped = Vec::new();
    for ephemeral_id in ledger.stale_devices(ping_interval * STALE_AFTER_INTERVALS) {
        if let Some(device) = ledger.unregister_device(&ephemeral_id) {
            info!(device_id = %device.persistent_id, "Dropping silent device");
            device.close();
            ledger.broadcast_to_account(
                &device.account_id,
                &DashboardEvent::DeviceOffline {
                    device_id: device.persistent_id.clone(),
                },
            );
            dropped.push(device.persistent_id);
        }
    }
    ledger.ping_devices();
    dropped
}

/// Run [`sweep_devices`] every ping interval.
pub fn spawn_keepalive(ledger: Arc<ConnectionLedger>, ping_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_devices(&ledger, ping_interval);
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::agent::{AgentConfig, MemorySessionStore, SessionRunner};
    use crate::ledger::LedgerConfig;
    use crate::model::{DecisionOracle, ModelError, ModelResponse};
    use crate::skills::SkillDispatcher;
    use async_trait::async_trait;

    /// Oracle that ends every session immediately.
    pub struct DoneOracle;

    #[async_trait]
    impl DecisionOracle for DoneOracle {
        async fn query(&self, _: &[Value]) -> Result<ModelResponse, ModelError> {
            Ok(ModelResponse::from_content(r#"{"action":"done","message":"ok"}"#))
        }
    }

    pub fn state() -> AppState {
        let ledger = Arc::new(ConnectionLedger::new(
            LedgerConfig::default().with_command_timeout(Duration::from_millis(200)),
        ));
        let runner = SessionRunner::new(
            AgentConfig::default().with_settle_delay(Duration::ZERO),
            Arc::new(DoneOracle),
            Arc::new(MemorySessionStore::new()),
            ledger.clone(),
            SkillDispatcher::default(),
        );
        let sessions = Arc::new(SessionManager::new(ledger.clone(), Arc::new(runner)));
        let auth = Arc::new(StaticKeyAuthenticator::default().with_key("k1", "acct"));
        AppState::new(ledger, sessions, auth, ServerConfig::default())
    }
}
